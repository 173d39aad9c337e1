use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::discovery::SyncStatus;
use crate::error::GraphError;
use crate::graph::GraphClient;
use crate::models::{Destination, DestinationKind};
use crate::store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadsReport {
    pub status: SyncStatus,
    pub forms: usize,
    pub forms_with_leads: usize,
    pub leads: usize,
    pub new_leads: usize,
    /// Forms whose leads could not be read.
    pub failed_forms: usize,
    pub error: Option<String>,
}

impl LeadsReport {
    fn empty(status: SyncStatus) -> Self {
        Self {
            status,
            forms: 0,
            forms_with_leads: 0,
            leads: 0,
            new_leads: 0,
            failed_forms: 0,
            error: None,
        }
    }
}

/// Pull every lead from every lead form of a page and store the new ones.
///
/// A page token without lead access yields a `no_permission` report. A form
/// whose leads cannot be read is logged and counted, the rest still run.
pub async fn collect_leads(
    pool: &SqlitePool,
    graph: &GraphClient,
    destination: &Destination,
    now: DateTime<Utc>,
) -> Result<LeadsReport> {
    if destination.kind != DestinationKind::Page {
        bail!(
            "lead forms only exist on pages, '{}' is a {}",
            destination.name,
            destination.kind
        );
    }
    let token = destination.access_token.as_str();

    let forms = match graph.leadgen_forms(&destination.external_id, token).await {
        Ok(forms) => forms,
        Err(GraphError::NoPermission(message)) => {
            warn!(destination = %destination.name, error = %message, "no permission to read lead forms");
            return Ok(LeadsReport {
                error: Some(message),
                ..LeadsReport::empty(SyncStatus::NoPermission)
            });
        }
        Err(e) => return Err(e).with_context(|| format!("listing lead forms of {}", destination.name)),
    };

    let mut report = LeadsReport {
        forms: forms.len(),
        ..LeadsReport::empty(SyncStatus::Success)
    };
    for form in &forms {
        let leads = match graph.form_leads(&form.id, token).await {
            Ok(leads) => leads,
            Err(e) => {
                warn!(form_id = %form.id, form = %form.name, error = %e, "failed to read form leads");
                report.failed_forms += 1;
                continue;
            }
        };
        if !leads.is_empty() {
            report.forms_with_leads += 1;
        }
        for lead in &leads {
            if store::insert_lead(pool, &destination.id, form, lead, now).await? {
                report.new_leads += 1;
            }
            report.leads += 1;
        }
        debug!(form_id = %form.id, leads = leads.len(), "form leads read");
    }

    info!(
        destination = %destination.name,
        forms = report.forms,
        leads = report.leads,
        new_leads = report.new_leads,
        failed_forms = report.failed_forms,
        "lead collection finished"
    );
    Ok(report)
}
