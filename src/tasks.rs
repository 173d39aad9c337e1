//! Named background tasks with pollable, cancellable handles.
//!
//! Handlers are registered by name up front. `enqueue` persists a task
//! record and spawns the handler under a concurrency semaphore; progress
//! flows back through an explicit `Progress` handle and is mirrored to
//! the `tasks` table so other processes can poll it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::models::{TaskRecord, TaskState};
use crate::store;

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type Handler = Arc<dyn Fn(Value, Progress) -> BoxFuture + Send + Sync>;
type RevokeHook = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub progress: Option<ProgressSnapshot>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<TaskRecord> for TaskStatus {
    fn from(record: TaskRecord) -> Self {
        let progress = (record.progress_total > 0).then(|| ProgressSnapshot {
            current: record.progress_current.max(0) as u64,
            total: record.progress_total as u64,
        });
        Self {
            id: record.id,
            name: record.name,
            state: record.state,
            progress,
            result: record.result.and_then(|r| serde_json::from_str(&r).ok()),
            error: record.error,
        }
    }
}

struct Slot {
    status: watch::Sender<TaskStatus>,
    cancel: CancellationToken,
    payload: Value,
    on_revoke: Option<RevokeHook>,
}

/// Side channel a handler uses to report how far it got.
#[derive(Clone)]
pub struct Progress {
    slot: Option<Arc<Slot>>,
    pool: Option<SqlitePool>,
    task_id: String,
}

impl Progress {
    /// A progress sink attached to no task, for direct (CLI) calls.
    pub fn detached() -> Self {
        Self {
            slot: None,
            pool: None,
            task_id: String::new(),
        }
    }

    pub async fn report(&self, current: u64, total: u64) {
        if let Some(slot) = &self.slot {
            slot.status
                .send_modify(|s| s.progress = Some(ProgressSnapshot { current, total }));
        }
        if let Some(pool) = &self.pool
            && let Err(e) = store::update_task_progress(pool, &self.task_id, current, total).await
        {
            warn!(task_id = %self.task_id, error = %e, "failed to persist task progress");
        }
    }
}

struct Inner {
    pool: SqlitePool,
    handlers: HashMap<String, Handler>,
    revoke_hooks: HashMap<String, RevokeHook>,
    semaphore: Arc<Semaphore>,
    live: Mutex<HashMap<String, Arc<Slot>>>,
    tracker: TaskTracker,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

pub struct TaskQueueBuilder {
    pool: SqlitePool,
    max_concurrent: usize,
    handlers: HashMap<String, Handler>,
    revoke_hooks: HashMap<String, RevokeHook>,
}

impl TaskQueueBuilder {
    pub fn register<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value, Progress) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload, progress| Box::pin(handler(payload, progress)));
        self.handlers.insert(name.to_string(), handler);
        self
    }

    /// Run `hook` with the payload of a `name` task revoked before it
    /// started, so work reserved for it can be handed back.
    pub fn on_revoke<F, Fut>(mut self, name: &str, hook: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: RevokeHook = Arc::new(move |payload| Box::pin(hook(payload)));
        self.revoke_hooks.insert(name.to_string(), hook);
        self
    }

    pub fn build(self) -> TaskQueue {
        TaskQueue {
            inner: Arc::new(Inner {
                pool: self.pool,
                handlers: self.handlers,
                revoke_hooks: self.revoke_hooks,
                semaphore: Arc::new(Semaphore::new(self.max_concurrent.max(1))),
                live: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
            }),
        }
    }
}

impl TaskQueue {
    pub fn builder(pool: SqlitePool, max_concurrent: usize) -> TaskQueueBuilder {
        TaskQueueBuilder {
            pool,
            max_concurrent,
            handlers: HashMap::new(),
            revoke_hooks: HashMap::new(),
        }
    }

    pub async fn enqueue(&self, name: &str, payload: Value) -> Result<TaskHandle, TaskError> {
        let handler = self
            .inner
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;
        if self.inner.tracker.is_closed() {
            return Err(TaskError::Closed);
        }

        let id = Uuid::new_v4().to_string();
        let item_id = payload.get("item_id").and_then(Value::as_str).map(str::to_string);
        let encoded = payload.to_string();
        store::insert_task(&self.inner.pool, &id, name, &encoded, item_id.as_deref(), Utc::now())
            .await
            .map_err(|e| TaskError::Store(format!("{e:#}")))?;

        let (status, _) = watch::channel(TaskStatus {
            id: id.clone(),
            name: name.to_string(),
            state: TaskState::Pending,
            progress: None,
            result: None,
            error: None,
        });
        let slot = Arc::new(Slot {
            status,
            cancel: CancellationToken::new(),
            payload: payload.clone(),
            on_revoke: self.inner.revoke_hooks.get(name).cloned(),
        });
        self.live().insert(id.clone(), slot.clone());

        self.inner
            .tracker
            .spawn(run_task(self.inner.clone(), slot.clone(), handler, payload));
        info!(task = %name, task_id = %id, "task enqueued");

        Ok(TaskHandle {
            id,
            slot,
            pool: self.inner.pool.clone(),
        })
    }

    /// Current status of a task, live or finished.
    pub async fn status(&self, id: &str) -> anyhow::Result<Option<TaskStatus>> {
        let live = self.live().get(id).cloned();
        if let Some(slot) = live {
            return Ok(Some(slot.status.borrow().clone()));
        }
        Ok(store::get_task(&self.inner.pool, id).await?.map(TaskStatus::from))
    }

    /// Revoke a task that has not started. `None` if the id is unknown.
    pub async fn cancel(&self, id: &str) -> anyhow::Result<Option<bool>> {
        let live = self.live().get(id).cloned();
        if let Some(slot) = live {
            return Ok(Some(revoke(&self.inner.pool, &slot).await));
        }
        Ok(store::get_task(&self.inner.pool, id).await?.map(|_| false))
    }

    /// Stop accepting work, revoke queued tasks and wait for running ones.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        let pending: Vec<Arc<Slot>> = self.live().values().cloned().collect();
        for slot in pending {
            revoke(&self.inner.pool, &slot).await;
        }
        self.inner.tracker.wait().await;
    }

    /// Stop accepting work and wait for everything already enqueued.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.inner.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct TaskHandle {
    id: String,
    slot: Arc<Slot>,
    pool: SqlitePool,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn poll(&self) -> TaskStatus {
        self.slot.status.borrow().clone()
    }

    /// Revoke the task if it has not started yet.
    pub async fn cancel(&self) -> bool {
        revoke(&self.pool, &self.slot).await
    }

    /// Wait until the task reaches a final state.
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.slot.status.subscribe();
        match rx.wait_for(|s| s.state.is_finished()).await {
            Ok(status) => status.clone(),
            Err(_) => self.poll(),
        }
    }
}

/// Boundary the sweeps dispatch through.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, name: &str, payload: Value) -> Result<String, TaskError>;
}

#[async_trait]
impl Dispatch for TaskQueue {
    async fn dispatch(&self, name: &str, payload: Value) -> Result<String, TaskError> {
        self.enqueue(name, payload).await.map(|h| h.id)
    }
}

async fn revoke(pool: &SqlitePool, slot: &Slot) -> bool {
    let revoked = slot.status.send_if_modified(|s| {
        if s.state == TaskState::Pending {
            s.state = TaskState::Revoked;
            true
        } else {
            false
        }
    });
    if revoked {
        slot.cancel.cancel();
        let id = slot.status.borrow().id.clone();
        if let Err(e) = store::finish_task(pool, &id, TaskState::Revoked, None, None, Utc::now()).await {
            warn!(task_id = %id, error = %e, "failed to persist task revocation");
        }
        info!(task_id = %id, "task revoked");
        if let Some(hook) = &slot.on_revoke {
            hook(slot.payload.clone()).await;
        }
    }
    revoked
}

async fn run_task(inner: Arc<Inner>, slot: Arc<Slot>, handler: Handler, payload: Value) {
    let (id, name) = {
        let status = slot.status.borrow();
        (status.id.clone(), status.name.clone())
    };

    let permit = tokio::select! {
        _ = slot.cancel.cancelled() => {
            inner.live.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            return;
        }
        permit = inner.semaphore.clone().acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        error!(task = %name, task_id = %id, "task semaphore closed");
        return;
    };

    let started = slot.status.send_if_modified(|s| {
        if s.state == TaskState::Pending {
            s.state = TaskState::Started;
            true
        } else {
            false
        }
    });
    if !started {
        inner.live.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
        return;
    }
    if let Err(e) = store::mark_task_started(&inner.pool, &id, Utc::now()).await {
        warn!(task_id = %id, error = %e, "failed to persist task start");
    }
    info!(task = %name, task_id = %id, "task started");

    let progress = Progress {
        slot: Some(slot.clone()),
        pool: Some(inner.pool.clone()),
        task_id: id.clone(),
    };
    // Run in its own task so a panicking handler is reported as a failure
    let outcome = tokio::spawn(handler(payload, progress)).await;

    let (state, result, err) = match outcome {
        Ok(Ok(value)) => (TaskState::Success, Some(value), None),
        Ok(Err(e)) => (TaskState::Failure, None, Some(format!("{e:#}"))),
        Err(join) => (TaskState::Failure, None, Some(format!("task panicked: {join}"))),
    };

    let encoded = result.as_ref().map(Value::to_string);
    if let Err(e) = store::finish_task(&inner.pool, &id, state, encoded.as_deref(), err.as_deref(), Utc::now()).await {
        warn!(task_id = %id, error = %e, "failed to persist task result");
    }
    match &err {
        Some(message) => error!(task = %name, task_id = %id, error = %message, "task failed"),
        None => info!(task = %name, task_id = %id, "task finished"),
    }

    slot.status.send_modify(|s| {
        s.state = state;
        s.result = result;
        s.error = err;
    });
    inner.live.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
}
