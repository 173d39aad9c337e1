use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::store;

/// Delete publication outcomes and finished task records older than
/// `retention`. Returns (outcomes, tasks) removed.
pub async fn purge_expired(pool: &SqlitePool, retention: chrono::Duration, now: DateTime<Utc>) -> Result<(u64, u64)> {
    let cutoff = now - retention;
    let outcomes = store::delete_old_outcomes(pool, cutoff).await?;
    let tasks = store::delete_finished_tasks(pool, cutoff).await?;
    if outcomes > 0 || tasks > 0 {
        info!(outcomes, tasks, cutoff = %cutoff.to_rfc3339(), "cleaned up old records");
    }
    Ok((outcomes, tasks))
}

/// Retention cleanup loop. Wakes every hour.
pub async fn cleanup_loop(pool: SqlitePool, retention: chrono::Duration, cancel: CancellationToken) {
    info!("cleanup job started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cleanup job shutting down");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
        }

        if let Err(e) = purge_expired(&pool, retention, Utc::now()).await {
            error!(error = %e, "cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::models::{NewOutcome, TaskState};
    use crate::testutil::seed_destination;

    #[tokio::test]
    async fn removes_only_expired_records() {
        let pool = memory_pool().await;
        let dest = seed_destination(&pool, "TechCo", "101").await;
        let now = Utc::now();
        let old = now - chrono::Duration::days(120);

        for at in [old, now] {
            store::insert_outcome(
                &pool,
                &NewOutcome {
                    batch_id: "b",
                    item_id: None,
                    destination_id: &dest.id,
                    external_post_id: Some("101_1"),
                    error_kind: None,
                    error_detail: None,
                },
                at,
            )
            .await
            .unwrap();
        }

        store::insert_task(&pool, "t-old", "publish_item", "{}", None, old).await.unwrap();
        store::finish_task(&pool, "t-old", TaskState::Success, None, None, old).await.unwrap();
        store::insert_task(&pool, "t-running", "publish_item", "{}", None, old).await.unwrap();
        store::mark_task_started(&pool, "t-running", old).await.unwrap();

        let removed = purge_expired(&pool, chrono::Duration::days(90), now).await.unwrap();
        assert_eq!(removed, (1, 1));

        assert_eq!(store::get_outcomes_for_batch(&pool, "b").await.unwrap().len(), 1);
        assert!(store::get_task(&pool, "t-old").await.unwrap().is_none());
        // Unfinished tasks are never purged
        assert!(store::get_task(&pool, "t-running").await.unwrap().is_some());
    }
}
