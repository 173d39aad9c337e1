use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DestinationError;
use crate::format;
use crate::graph::{Post, Publisher};
use crate::models::{ContentRequest, Destination, ItemStatus, NewOutcome, PromptSource, Schedule, ScheduledItem};
use crate::store;
use crate::tasks::Progress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationSuccess {
    pub destination_id: String,
    pub name: String,
    pub external_post_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationFailure {
    /// Destination id, or the key that failed to resolve.
    pub destination: String,
    pub name: String,
    pub kind: String,
    pub reason: String,
}

impl DestinationFailure {
    fn new(destination: &str, name: &str, error: &DestinationError) -> Self {
        Self {
            destination: destination.to_string(),
            name: name.to_string(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub success: Vec<DestinationSuccess>,
    pub failed: Vec<DestinationFailure>,
    pub processed: usize,
}

impl BatchReport {
    /// `name: reason` for every failed destination.
    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|f| format!("{}: {}", f.name, f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { report: BatchReport },
    Failed { error: String, report: Option<BatchReport> },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledEntry {
    pub destination_id: String,
    pub item_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub created: Vec<ScheduledEntry>,
    pub failed: Vec<DestinationFailure>,
}

/// Look up destinations by id or external id, keeping the given order.
/// Unknown keys are reported as failures rather than aborting.
pub async fn resolve_destinations(
    pool: &SqlitePool,
    keys: &[String],
) -> Result<(Vec<Destination>, Vec<DestinationFailure>)> {
    let mut found = Vec::with_capacity(keys.len());
    let mut missing = Vec::new();
    for key in keys {
        match store::find_destination(pool, key).await? {
            Some(dest) => found.push(dest),
            None => missing.push(DestinationFailure::new(key, key, &DestinationError::NotFound(key.clone()))),
        }
    }
    Ok((found, missing))
}

fn check_capability(dest: &Destination) -> Result<(), DestinationError> {
    if !dest.is_active {
        return Err(DestinationError::Inactive(dest.name.clone()));
    }
    if !dest.can_publish {
        return Err(DestinationError::CannotPublish(dest.name.clone()));
    }
    Ok(())
}

/// Publish one post to each destination in order. A failing destination is
/// recorded and skipped; it never stops the rest of the batch.
pub async fn publish_to_destinations(
    pool: &SqlitePool,
    publisher: &dyn Publisher,
    destinations: &[Destination],
    post: &Post,
    item_id: Option<&str>,
    progress: &Progress,
) -> BatchReport {
    let batch_id = Uuid::new_v4().to_string();
    let total = destinations.len() as u64;
    let mut report = BatchReport {
        batch_id: batch_id.clone(),
        success: Vec::new(),
        failed: Vec::new(),
        processed: 0,
    };

    info!(batch_id = %batch_id, destinations = destinations.len(), "publishing batch");

    for (index, dest) in destinations.iter().enumerate() {
        let result = match check_capability(dest) {
            Ok(()) => publisher.publish(dest, post).await.map_err(DestinationError::from),
            Err(e) => Err(e),
        };

        let (external_post_id, error) = match &result {
            Ok(post_id) => (Some(post_id.as_str()), None),
            Err(e) => (None, Some(e)),
        };
        let error_detail = error.map(|e| e.to_string());
        let record = NewOutcome {
            batch_id: &batch_id,
            item_id,
            destination_id: &dest.id,
            external_post_id,
            error_kind: error.map(DestinationError::kind),
            error_detail: error_detail.as_deref(),
        };
        if let Err(e) = store::insert_outcome(pool, &record, Utc::now()).await {
            warn!(batch_id = %batch_id, destination = %dest.name, error = %e, "failed to record publication outcome");
        }

        match result {
            Ok(post_id) => {
                info!(destination = %dest.name, post_id = %post_id, "published");
                report.success.push(DestinationSuccess {
                    destination_id: dest.id.clone(),
                    name: dest.name.clone(),
                    external_post_id: post_id,
                });
            }
            Err(e) => {
                warn!(destination = %dest.name, kind = e.kind(), error = %e, "destination failed");
                report.failed.push(DestinationFailure::new(&dest.id, &dest.name, &e));
            }
        }

        report.processed += 1;
        progress.report(index as u64 + 1, total).await;
    }

    info!(
        batch_id = %batch_id,
        succeeded = report.success.len(),
        failed = report.failed.len(),
        "batch finished"
    );
    report
}

/// Text sent to the Graph API for an item. Markdown is flattened since
/// posts are shown verbatim.
pub fn post_for_item(item: &ScheduledItem) -> Option<Post> {
    let content = item.generated_content.as_deref().filter(|c| !c.trim().is_empty())?;
    let message = if item.use_markdown {
        format::markdown_to_plain(content)
    } else {
        content.to_string()
    };
    Some(Post {
        message,
        image: item.generated_image_file.as_ref().map(PathBuf::from),
        link: item.link.clone(),
    })
}

/// Publish a scheduled item to all of its destinations.
///
/// `claim` is the version a sweep left on the item when it claimed it as
/// `publishing`; the run takes that claim over with a version check, so
/// only one caller per claim reaches the Graph API. Without a claim only a
/// `ready` item is accepted, and it is claimed here. Anything else is
/// skipped.
pub async fn publish_item(
    pool: &SqlitePool,
    publisher: &dyn Publisher,
    item_id: &str,
    claim: Option<i64>,
    progress: &Progress,
) -> Result<PublishOutcome> {
    let item = store::get_scheduled_item(pool, item_id)
        .await?
        .ok_or_else(|| anyhow!("scheduled item '{item_id}' not found"))?;

    let won = match (item.status, claim) {
        (ItemStatus::Ready, None) => store::claim_item(pool, &item, ItemStatus::Publishing).await?,
        (ItemStatus::Publishing, Some(version)) if version == item.version => {
            store::take_publish_claim(pool, &item.id, version).await?
        }
        (ItemStatus::Publishing, _) => {
            info!(item_id = %item.id, "item is already being published, skipping");
            return Ok(PublishOutcome::Skipped {
                reason: "already being published".to_string(),
            });
        }
        (other, _) => {
            return Ok(PublishOutcome::Skipped {
                reason: format!("item is {other}"),
            });
        }
    };
    if !won {
        info!(item_id = %item.id, "item claimed by another worker, skipping publish");
        return Ok(PublishOutcome::Skipped {
            reason: "claimed by another worker".to_string(),
        });
    }

    match publish_claimed(pool, publisher, &item, progress).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Never leave a claimed item in publishing on an error path
            mark_failed(pool, &item.id, &format!("{e:#}")).await;
            Err(e)
        }
    }
}

async fn publish_claimed(
    pool: &SqlitePool,
    publisher: &dyn Publisher,
    item: &ScheduledItem,
    progress: &Progress,
) -> Result<PublishOutcome> {
    let Some(post) = post_for_item(item) else {
        let error = "item has no generated content".to_string();
        mark_failed(pool, &item.id, &error).await;
        return Ok(PublishOutcome::Failed { error, report: None });
    };

    let destinations = store::get_item_destinations(pool, &item.id).await?;
    if destinations.is_empty() {
        let error = "item has no destinations".to_string();
        mark_failed(pool, &item.id, &error).await;
        return Ok(PublishOutcome::Failed { error, report: None });
    }

    let report = publish_to_destinations(pool, publisher, &destinations, &post, Some(&item.id), progress).await;

    if report.success.is_empty() {
        let error = report.failure_summary();
        warn!(item_id = %item.id, error = %error, "item failed on every destination");
        mark_failed(pool, &item.id, &error).await;
        return Ok(PublishOutcome::Failed {
            error,
            report: Some(report),
        });
    }

    let note = (!report.failed.is_empty()).then(|| {
        format!(
            "published to {} of {} destinations; {}",
            report.success.len(),
            report.processed,
            report.failure_summary()
        )
    });
    let recorded = store::mark_item_published(pool, &item.id, note.as_deref())
        .await
        .with_context(|| format!("published to {} destination(s) but could not record it", report.success.len()))?;
    if recorded {
        info!(item_id = %item.id, succeeded = report.success.len(), "item published");
    } else {
        warn!(
            item_id = %item.id,
            succeeded = report.success.len(),
            "item left publishing while posts went out, status not updated"
        );
    }
    Ok(PublishOutcome::Published { report })
}

/// Fail an item this worker holds in `publishing`, logging instead of
/// erroring since callers are already on a failure path.
async fn mark_failed(pool: &SqlitePool, item_id: &str, message: &str) {
    match store::mark_item_failed(pool, item_id, ItemStatus::Publishing, message).await {
        Ok(true) => {}
        Ok(false) => warn!(item_id, "item left publishing before it could be marked failed"),
        Err(e) => warn!(item_id, error = %e, "failed to mark item failed"),
    }
}

/// Hand a claimed item back to `ready` when its publish task was revoked
/// before it started, so the next sweep picks it up again.
pub async fn release_claim(pool: &SqlitePool, item_id: &str, version: i64) -> Result<bool> {
    let released = store::release_publish_claim(pool, item_id, version).await?;
    if released {
        info!(item_id, "publish claim released");
    } else {
        debug!(item_id, version, "publish claim already moved on, nothing to release");
    }
    Ok(released)
}

fn validate_request(request: &ContentRequest) -> Result<()> {
    let text = match &request.prompt {
        PromptSource::Template { prompt, .. } => prompt,
        PromptSource::Manual(text) => text,
    };
    if text.trim().is_empty() {
        bail!("prompt must not be empty");
    }
    if request.destinations.is_empty() {
        bail!("at least one destination is required");
    }
    Ok(())
}

fn scheduled_time(schedule: Schedule) -> DateTime<Utc> {
    match schedule {
        Schedule::Immediate => Utc::now(),
        Schedule::At(at) => at,
    }
}

/// Create one item covering every destination of the request.
pub async fn create_item(pool: &SqlitePool, request: &ContentRequest) -> Result<String> {
    validate_request(request)?;
    let (destinations, missing) = resolve_destinations(pool, &request.destinations).await?;
    if let Some(first) = missing.first() {
        bail!("unknown destination '{}'", first.destination);
    }
    let ids: Vec<&str> = destinations.iter().map(|d| d.id.as_str()).collect();
    let id = store::insert_scheduled_item(pool, request, scheduled_time(request.schedule), &ids).await?;
    info!(item_id = %id, destinations = ids.len(), "scheduled item created");
    Ok(id)
}

/// Create a separate pending item per destination. Destinations that are
/// unknown or cannot publish are reported and the rest still get scheduled.
pub async fn schedule_for_destinations(
    pool: &SqlitePool,
    request: &ContentRequest,
    at: DateTime<Utc>,
) -> Result<ScheduleReport> {
    validate_request(request)?;
    let (destinations, mut failed) = resolve_destinations(pool, &request.destinations).await?;
    let mut created = Vec::new();

    for dest in &destinations {
        if let Err(e) = check_capability(dest) {
            warn!(destination = %dest.name, error = %e, "not scheduling for destination");
            failed.push(DestinationFailure::new(&dest.id, &dest.name, &e));
            continue;
        }
        match store::insert_scheduled_item(pool, request, at, &[dest.id.as_str()]).await {
            Ok(item_id) => created.push(ScheduledEntry {
                destination_id: dest.id.clone(),
                item_id,
            }),
            Err(e) => {
                warn!(destination = %dest.name, error = %e, "failed to schedule item");
                failed.push(DestinationFailure {
                    destination: dest.id.clone(),
                    name: dest.name.clone(),
                    kind: "storage".to_string(),
                    reason: format!("{e:#}"),
                });
            }
        }
    }

    info!(created = created.len(), failed = failed.len(), "scheduled per destination");
    Ok(ScheduleReport { created, failed })
}

async fn load_item(pool: &SqlitePool, item_id: &str) -> Result<ScheduledItem> {
    store::get_scheduled_item(pool, item_id)
        .await?
        .with_context(|| format!("scheduled item '{item_id}' not found"))
}

pub async fn approve(pool: &SqlitePool, item_id: &str, approver: &str) -> Result<()> {
    let item = load_item(pool, item_id).await?;
    if item.status != ItemStatus::PendingApproval {
        bail!("item '{item_id}' is {}, not awaiting approval", item.status);
    }
    if !store::approve_item(pool, &item, approver, Utc::now()).await? {
        bail!("item '{item_id}' changed concurrently, try again");
    }
    info!(item_id, approver, "item approved");
    Ok(())
}

pub async fn reject(pool: &SqlitePool, item_id: &str, approver: &str, reason: &str) -> Result<()> {
    if reason.trim().is_empty() {
        bail!("a rejection reason is required");
    }
    let item = load_item(pool, item_id).await?;
    if item.status != ItemStatus::PendingApproval {
        bail!("item '{item_id}' is {}, not awaiting approval", item.status);
    }
    if !store::reject_item(pool, &item, approver, reason.trim(), Utc::now()).await? {
        bail!("item '{item_id}' changed concurrently, try again");
    }
    info!(item_id, approver, "item rejected");
    Ok(())
}

pub async fn cancel(pool: &SqlitePool, item_id: &str) -> Result<()> {
    let item = load_item(pool, item_id).await?;
    if item.status.is_terminal() {
        bail!("item '{item_id}' is already {}", item.status);
    }
    if !item.status.can_transition_to(ItemStatus::Cancelled) {
        bail!("item '{item_id}' is {} and can no longer be cancelled", item.status);
    }
    if !store::claim_item(pool, &item, ItemStatus::Cancelled).await? {
        bail!("item '{item_id}' changed concurrently, try again");
    }
    info!(item_id, "item cancelled");
    Ok(())
}
