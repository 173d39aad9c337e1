use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::graph::{Capabilities, GraphClient};
use crate::models::Destination;
use crate::store;

/// How far back published posts keep getting their counters refreshed.
const METRICS_WINDOW_DAYS: i64 = 30;
const METRICS_BATCH: i64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsReport {
    pub updated: usize,
    pub failed: usize,
}

/// Refresh likes, comments and shares for recent successful posts.
/// A post whose counters cannot be read or stored is logged and skipped.
pub async fn refresh_recent_metrics(pool: &SqlitePool, graph: &GraphClient, now: DateTime<Utc>) -> Result<MetricsReport> {
    let since = now - Duration::days(METRICS_WINDOW_DAYS);
    let outcomes = store::get_recent_successful_outcomes(pool, since, METRICS_BATCH).await?;
    let mut report = MetricsReport::default();

    for (outcome, token) in &outcomes {
        let Some(post_id) = outcome.external_post_id.as_deref() else {
            continue;
        };
        let m = match graph.post_details(post_id, token).await {
            Ok(m) => m,
            Err(e) => {
                warn!(post_id, error = %e, "failed to read post metrics");
                report.failed += 1;
                continue;
            }
        };
        match store::update_outcome_metrics(pool, &outcome.id, m.likes, m.comments, m.shares, now).await {
            Ok(()) => {
                debug!(post_id, likes = m.likes, comments = m.comments, shares = m.shares, "metrics updated");
                report.updated += 1;
            }
            Err(e) => {
                warn!(post_id, error = %e, "failed to store post metrics");
                report.failed += 1;
            }
        }
    }

    info!(updated = report.updated, failed = report.failed, "metrics refresh finished");
    Ok(report)
}

/// Check a destination's permissions and store the result.
pub async fn sync_destination(pool: &SqlitePool, graph: &GraphClient, destination: &Destination) -> Result<Capabilities> {
    let caps = graph.check_permissions(destination).await?;
    store::update_destination_capabilities(pool, &destination.id, caps.can_publish, caps.can_read_metrics, Utc::now())
        .await?;
    info!(
        destination = %destination.name,
        can_publish = caps.can_publish,
        can_read_metrics = caps.can_read_metrics,
        "destination capabilities synced"
    );
    Ok(caps)
}
