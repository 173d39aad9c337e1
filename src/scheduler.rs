use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, parse_duration, parse_interval};
use crate::models::ItemStatus;
use crate::store;
use crate::tasks::Dispatch;

pub const GENERATE_CONTENT: &str = "generate_content";
pub const PUBLISH_ITEM: &str = "publish_item";
pub const PUBLISH_BATCH: &str = "publish_batch";
pub const REFRESH_METRICS: &str = "refresh_metrics";
pub const SWEEP_PUBLISH: &str = "sweep_publish";
pub const SWEEP_GENERATION: &str = "sweep_generation";

/// Parsed `[scheduler]` durations.
#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub publish_interval: Duration,
    pub generation_interval: Duration,
    pub metrics_interval: Duration,
    pub lookahead: chrono::Duration,
    pub generation_lead: chrono::Duration,
}

impl SweepSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let s = &config.scheduler;
        Ok(Self {
            publish_interval: parse_interval("scheduler.publish_interval", &s.publish_interval)?,
            generation_interval: parse_interval("scheduler.generation_interval", &s.generation_interval)?,
            metrics_interval: parse_interval("scheduler.metrics_interval", &s.metrics_interval)?,
            lookahead: chrono::Duration::from_std(parse_duration("scheduler.lookahead", &s.lookahead)?)?,
            generation_lead: chrono::Duration::from_std(parse_duration(
                "scheduler.generation_lead",
                &s.generation_lead,
            )?)?,
        })
    }
}

/// Claim every due `ready` item and hand it to a `publish_item` task.
///
/// Returns the number of items dispatched. An item whose claim is lost is
/// skipped; an item that cannot be dispatched is failed with the reason.
pub async fn publish_sweep(pool: &SqlitePool, dispatch: &dyn Dispatch, now: DateTime<Utc>) -> Result<usize> {
    let items = store::get_due_ready_items(pool, now).await?;
    if items.is_empty() {
        debug!("no items due for publishing");
        return Ok(0);
    }

    let mut dispatched = 0;
    for item in &items {
        match store::claim_item(pool, item, ItemStatus::Publishing).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(item_id = %item.id, "publish claim lost, skipping");
                continue;
            }
            Err(e) => {
                error!(item_id = %item.id, error = %e, "failed to claim item for publishing");
                continue;
            }
        }

        // The claim bumped the version; the task proves ownership with it
        let payload = json!({ "item_id": item.id, "version": item.version + 1 });
        match dispatch.dispatch(PUBLISH_ITEM, payload).await {
            Ok(task_id) => {
                info!(item_id = %item.id, task_id = %task_id, "publish dispatched");
                dispatched += 1;
            }
            Err(e) => {
                error!(item_id = %item.id, error = %e, "failed to dispatch publish");
                let message = format!("failed to dispatch publish: {e}");
                match store::mark_item_failed(pool, &item.id, ItemStatus::Publishing, &message).await {
                    Ok(true) => {}
                    Ok(false) => warn!(item_id = %item.id, "item left publishing before it could be marked failed"),
                    Err(e) => error!(item_id = %item.id, error = %e, "failed to mark item failed"),
                }
            }
        }
    }

    info!(due = items.len(), dispatched, "publish sweep finished");
    Ok(dispatched)
}

/// Dispatch generation for pending items coming up within the lead time
/// (bounded by the lookahead). Overdue and immediate items are included.
///
/// The pipeline claims the item itself, so dispatching the same item twice
/// only produces a skipped run.
pub async fn generation_sweep(
    pool: &SqlitePool,
    dispatch: &dyn Dispatch,
    now: DateTime<Utc>,
    lookahead: chrono::Duration,
    lead: chrono::Duration,
) -> Result<usize> {
    let cutoff = now + lead.min(lookahead);
    let items = store::get_pending_items_before(pool, cutoff).await?;

    let mut dispatched = 0;
    for item in &items {
        match dispatch.dispatch(GENERATE_CONTENT, json!({ "item_id": item.id })).await {
            Ok(task_id) => {
                debug!(item_id = %item.id, task_id = %task_id, "generation dispatched");
                dispatched += 1;
            }
            Err(e) => warn!(item_id = %item.id, error = %e, "failed to dispatch generation"),
        }
    }

    if dispatched > 0 {
        info!(dispatched, cutoff = %cutoff.to_rfc3339(), "generation sweep finished");
    }
    Ok(dispatched)
}

/// Enqueue `task` every `interval` until cancelled.
pub async fn periodic_loop(
    task: &'static str,
    interval: Duration,
    dispatch: Arc<dyn Dispatch>,
    cancel: CancellationToken,
) {
    info!(task, interval = %humantime::format_duration(interval), "periodic job started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(task, "periodic job shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = dispatch.dispatch(task, json!({})).await {
            error!(task, error = %e, "failed to enqueue periodic task");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;

    use super::*;
    use crate::db::memory_pool;
    use crate::error::TaskError;
    use crate::models::{Schedule, ScheduledItem};
    use crate::testutil::{manual_request, seed_destination};

    /// Records dispatches; refuses any payload naming `refuse`.
    #[derive(Default)]
    struct RecordingDispatch {
        refuse: Option<String>,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingDispatch {
        fn refusing(item_id: &str) -> Self {
            Self {
                refuse: Some(item_id.to_string()),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<(String, Value)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatch for RecordingDispatch {
        async fn dispatch(&self, name: &str, payload: Value) -> Result<String, TaskError> {
            if let Some(refuse) = &self.refuse
                && payload["item_id"].as_str() == Some(refuse.as_str())
            {
                return Err(TaskError::Store("database is locked".to_string()));
            }
            self.sent.lock().unwrap().push((name.to_string(), payload));
            Ok("task-1".to_string())
        }
    }

    async fn item_at(pool: &SqlitePool, dest_id: &str, at: DateTime<Utc>) -> ScheduledItem {
        let mut request = manual_request("hello");
        request.schedule = Schedule::At(at);
        let id = store::insert_scheduled_item(pool, &request, at, &[dest_id]).await.unwrap();
        store::get_scheduled_item(pool, &id).await.unwrap().unwrap()
    }

    async fn ready_at(pool: &SqlitePool, dest_id: &str, at: DateTime<Utc>) -> String {
        let item = item_at(pool, dest_id, at).await;
        store::claim_item(pool, &item, ItemStatus::Generating).await.unwrap();
        store::save_generation_result(pool, &item.id, "hello", None, None, ItemStatus::Ready)
            .await
            .unwrap();
        item.id
    }

    #[tokio::test]
    async fn dispatch_failure_fails_only_that_item() {
        let pool = memory_pool().await;
        let dest = seed_destination(&pool, "Page One", "101").await;
        let now = Utc::now();
        let first = ready_at(&pool, &dest.id, now - ChronoDuration::minutes(10)).await;
        let second = ready_at(&pool, &dest.id, now - ChronoDuration::minutes(5)).await;
        let later = ready_at(&pool, &dest.id, now + ChronoDuration::hours(1)).await;

        let dispatch = RecordingDispatch::refusing(&second);
        let count = publish_sweep(&pool, &dispatch, now).await.unwrap();
        assert_eq!(count, 1);

        let sent = dispatch.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PUBLISH_ITEM);
        assert_eq!(sent[0].1["item_id"], first.as_str());

        let first = store::get_scheduled_item(&pool, &first).await.unwrap().unwrap();
        assert_eq!(first.status, ItemStatus::Publishing);
        assert_eq!(sent[0].1["version"], first.version);
        let second = store::get_scheduled_item(&pool, &second).await.unwrap().unwrap();
        assert_eq!(second.status, ItemStatus::Failed);
        assert!(!second.error_message.unwrap_or_default().is_empty());
        let later = store::get_scheduled_item(&pool, &later).await.unwrap().unwrap();
        assert_eq!(later.status, ItemStatus::Ready);
    }

    #[tokio::test]
    async fn claimed_items_are_not_dispatched_twice() {
        let pool = memory_pool().await;
        let dest = seed_destination(&pool, "Page One", "101").await;
        let now = Utc::now();
        ready_at(&pool, &dest.id, now - ChronoDuration::minutes(1)).await;

        let dispatch = RecordingDispatch::default();
        assert_eq!(publish_sweep(&pool, &dispatch, now).await.unwrap(), 1);
        assert_eq!(publish_sweep(&pool, &dispatch, now).await.unwrap(), 0);
        assert_eq!(dispatch.sent().len(), 1);
    }

    #[tokio::test]
    async fn generation_sweep_respects_lead_time() {
        let pool = memory_pool().await;
        let dest = seed_destination(&pool, "Page One", "101").await;
        let now = Utc::now();
        let overdue = item_at(&pool, &dest.id, now - ChronoDuration::hours(1)).await;
        let soon = item_at(&pool, &dest.id, now + ChronoDuration::minutes(20)).await;
        item_at(&pool, &dest.id, now + ChronoDuration::minutes(90)).await;
        item_at(&pool, &dest.id, now + ChronoDuration::hours(5)).await;

        let dispatch = RecordingDispatch::default();
        let count = generation_sweep(&pool, &dispatch, now, ChronoDuration::hours(2), ChronoDuration::minutes(30))
            .await
            .unwrap();
        assert_eq!(count, 2);

        let ids: Vec<String> = dispatch
            .sent()
            .iter()
            .map(|(name, payload)| {
                assert_eq!(name, GENERATE_CONTENT);
                payload["item_id"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(ids, [overdue.id, soon.id]);
    }

    #[tokio::test]
    async fn periodic_loop_stops_on_cancel() {
        let dispatch = Arc::new(RecordingDispatch::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(periodic_loop(
            SWEEP_PUBLISH,
            Duration::from_millis(10),
            dispatch.clone(),
            cancel.clone(),
        ));

        for _ in 0..100 {
            if !dispatch.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let sent = dispatch.sent();
        assert!(!sent.is_empty());
        assert_eq!(sent[0].0, SWEEP_PUBLISH);
    }
}
