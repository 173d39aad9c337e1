use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, parse_duration};
use crate::fallback::Orchestrator;
use crate::graph::{GraphClient, Post};
use crate::pipeline::{self, PipelineSettings};
use crate::scheduler::{self, SweepSettings};
use crate::tasks::{Dispatch, Progress, TaskQueue};
use crate::{cleanup, db, format, metrics, providers, publish, server, store};

/// Everything a task handler needs, built once per process.
pub struct Services {
    pub pool: SqlitePool,
    pub orchestrator: Orchestrator,
    pub graph: GraphClient,
    pub pipeline: PipelineSettings,
    pub sweeps: SweepSettings,
}

impl Services {
    pub async fn init(config: &Config) -> Result<Self> {
        let pool = db::create_pool(config).await.context("creating database")?;
        info!(db_path = %config.db_path().display(), "database ready");

        store::sync_config_to_db(&pool, config)
            .await
            .context("syncing config to database")?;
        info!("config synced to database");

        let adapters = providers::build_adapters(config).context("building provider adapters")?;
        Ok(Self {
            orchestrator: Orchestrator::new(pool.clone(), adapters),
            graph: GraphClient::new(&config.graph)?,
            pipeline: PipelineSettings::from_config(config)?,
            sweeps: SweepSettings::from_config(config)?,
            pool,
        })
    }
}

/// Arguments of a `publish_batch` task.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub destinations: Vec<String>,
    pub content: String,
    #[serde(default)]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub use_markdown: bool,
}

fn item_id(payload: &Value) -> Result<String> {
    payload
        .get("item_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("payload is missing item_id")
}

/// Register every named task against `services`.
pub fn build_task_queue(services: Arc<Services>, max_concurrent: usize) -> TaskQueue {
    // Sweep tasks enqueue further work on the queue they run on
    let this_queue: Arc<OnceLock<TaskQueue>> = Arc::new(OnceLock::new());

    let (s1, s2, s3, s4, s5, s6) = (
        services.clone(),
        services.clone(),
        services.clone(),
        services.clone(),
        services.clone(),
        services.clone(),
    );
    let (q1, q2) = (this_queue.clone(), this_queue.clone());
    let release_pool = services.pool.clone();

    let queue = TaskQueue::builder(services.pool.clone(), max_concurrent)
        .register(scheduler::GENERATE_CONTENT, move |payload, _| {
            generate_content(s1.clone(), payload)
        })
        .register(scheduler::PUBLISH_ITEM, move |payload, progress| {
            publish_item(s2.clone(), payload, progress)
        })
        .on_revoke(scheduler::PUBLISH_ITEM, move |payload| {
            release_publish_claim(release_pool.clone(), payload)
        })
        .register(scheduler::PUBLISH_BATCH, move |payload, progress| {
            publish_batch(s3.clone(), payload, progress)
        })
        .register(scheduler::REFRESH_METRICS, move |_, _| refresh_metrics(s4.clone()))
        .register(scheduler::SWEEP_PUBLISH, move |_, _| sweep_publish(s5.clone(), q1.clone()))
        .register(scheduler::SWEEP_GENERATION, move |_, _| {
            sweep_generation(s6.clone(), q2.clone())
        })
        .build();

    let _ = this_queue.set(queue.clone());
    queue
}

async fn generate_content(svc: Arc<Services>, payload: Value) -> Result<Value> {
    let id = item_id(&payload)?;
    let outcome = pipeline::generate_for_item(&svc.pool, &svc.orchestrator, &svc.pipeline, &id).await?;
    Ok(serde_json::to_value(outcome)?)
}

async fn publish_item(svc: Arc<Services>, payload: Value, progress: Progress) -> Result<Value> {
    let id = item_id(&payload)?;
    let claim = payload.get("version").and_then(Value::as_i64);
    let outcome = publish::publish_item(&svc.pool, &svc.graph, &id, claim, &progress).await?;
    Ok(serde_json::to_value(outcome)?)
}

/// A publish task revoked before it ran leaves its item claimed; hand the
/// claim back so the next sweep retries it.
async fn release_publish_claim(pool: SqlitePool, payload: Value) {
    let (Ok(id), Some(version)) = (item_id(&payload), payload.get("version").and_then(Value::as_i64)) else {
        return;
    };
    if let Err(e) = publish::release_claim(&pool, &id, version).await {
        warn!(item_id = %id, error = %e, "failed to release publish claim");
    }
}

async fn publish_batch(svc: Arc<Services>, payload: Value, progress: Progress) -> Result<Value> {
    let request: BatchRequest = serde_json::from_value(payload).context("invalid batch request")?;
    let report = run_batch(&svc, &request, &progress).await?;
    Ok(serde_json::to_value(report)?)
}

async fn refresh_metrics(svc: Arc<Services>) -> Result<Value> {
    let report = metrics::refresh_recent_metrics(&svc.pool, &svc.graph, Utc::now()).await?;
    Ok(serde_json::to_value(report)?)
}

async fn sweep_publish(svc: Arc<Services>, queue: Arc<OnceLock<TaskQueue>>) -> Result<Value> {
    let queue = queue.get().context("task queue not initialized")?;
    let dispatched = scheduler::publish_sweep(&svc.pool, queue, Utc::now()).await?;
    Ok(json!({ "dispatched": dispatched }))
}

async fn sweep_generation(svc: Arc<Services>, queue: Arc<OnceLock<TaskQueue>>) -> Result<Value> {
    let queue = queue.get().context("task queue not initialized")?;
    let dispatched = scheduler::generation_sweep(
        &svc.pool,
        queue,
        Utc::now(),
        svc.sweeps.lookahead,
        svc.sweeps.generation_lead,
    )
    .await?;
    Ok(json!({ "dispatched": dispatched }))
}

/// Publish arbitrary content to destinations given by id or external id.
/// Unknown keys show up in the report's failures.
pub async fn run_batch(services: &Services, request: &BatchRequest, progress: &Progress) -> Result<publish::BatchReport> {
    let (destinations, missing) = publish::resolve_destinations(&services.pool, &request.destinations).await?;
    let message = if request.use_markdown {
        format::markdown_to_plain(&request.content)
    } else {
        request.content.clone()
    };
    let post = Post {
        message,
        image: request.image.clone(),
        link: request.link.clone(),
    };
    let mut report =
        publish::publish_to_destinations(&services.pool, &services.graph, &destinations, &post, None, progress).await;
    report.processed += missing.len();
    report.failed.extend(missing);
    Ok(report)
}

pub async fn run(config: Config) -> Result<()> {
    let services = Arc::new(Services::init(&config).await?);
    let pool = services.pool.clone();

    let interrupted = store::fail_interrupted_tasks(&pool, Utc::now()).await?;
    if interrupted > 0 {
        warn!(interrupted, "marked tasks from a previous run as failed");
    }

    let api_token = bootstrap_api_token(&pool, &config).await?;
    let retention = chrono::Duration::from_std(parse_duration("pagecast.retention", &config.pagecast.retention)?)?;
    let sweeps = services.sweeps;

    let queue = build_task_queue(services, config.pagecast.max_concurrent_tasks as usize);
    let dispatch: Arc<dyn Dispatch> = Arc::new(queue.clone());
    let cancel = CancellationToken::new();

    // Spawn background jobs
    let jobs = [
        (scheduler::SWEEP_PUBLISH, sweeps.publish_interval),
        (scheduler::SWEEP_GENERATION, sweeps.generation_interval),
        (scheduler::REFRESH_METRICS, sweeps.metrics_interval),
    ];
    let mut handles: Vec<_> = jobs
        .into_iter()
        .map(|(task, interval)| {
            tokio::spawn(scheduler::periodic_loop(task, interval, dispatch.clone(), cancel.clone()))
        })
        .collect();
    handles.push(tokio::spawn(cleanup::cleanup_loop(pool.clone(), retention, cancel.clone())));

    // Build and start HTTP server
    let app_state = server::AppState {
        pool: pool.clone(),
        queue: queue.clone(),
        api_token,
    };

    let router = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.pagecast.listen)
        .await
        .with_context(|| format!("binding to {}", config.pagecast.listen))?;

    info!(listen = %config.pagecast.listen, "HTTP server listening");

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(30);
    let drained = tokio::time::timeout(shutdown_timeout, async {
        queue.shutdown().await;
        for handle in handles {
            let _ = handle.await;
        }
        let _ = server_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("timed out waiting for running tasks");
    }

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn bootstrap_api_token(pool: &SqlitePool, config: &Config) -> Result<String> {
    // Priority: config value, then stored value, then a fresh one
    if let Some(ref token) = config.pagecast.api_token {
        store::set_setting(pool, "api_token", token).await?;
        info!("using api token from config");
        return Ok(token.clone());
    }

    if let Some(token) = store::get_setting(pool, "api_token").await? {
        info!("using stored api token");
        return Ok(token);
    }

    let token = generate_token();
    store::set_setting(pool, "api_token", &token).await?;
    warn!(token = %token, "api token generated, save this, it won't be shown again");
    Ok(token)
}

fn generate_token() -> String {
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, waiting for ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn token_prefers_config_then_store() {
        let pool = memory_pool().await;
        let mut config: Config = toml::from_str("[pagecast]\nversion = 1\n").unwrap();

        let generated = bootstrap_api_token(&pool, &config).await.unwrap();
        assert_eq!(generated.len(), 32);
        // Stored token is reused on the next start
        assert_eq!(bootstrap_api_token(&pool, &config).await.unwrap(), generated);

        config.pagecast.api_token = Some("from-config".into());
        assert_eq!(bootstrap_api_token(&pool, &config).await.unwrap(), "from-config");
        assert_eq!(
            store::get_setting(&pool, "api_token").await.unwrap().as_deref(),
            Some("from-config")
        );
    }

    #[tokio::test]
    async fn shutdown_returns_undispatched_items_to_ready() {
        use std::time::Duration as StdDuration;
        use tokio::sync::Notify;

        use crate::models::{ItemStatus, TaskState};
        use crate::testutil::{manual_request, seed_destination};

        let pool = memory_pool().await;
        let dest = seed_destination(&pool, "Page One", "101").await;
        let id = store::insert_scheduled_item(&pool, &manual_request("hello"), Utc::now(), &[&dest.id])
            .await
            .unwrap();
        let item = store::get_scheduled_item(&pool, &id).await.unwrap().unwrap();
        store::claim_item(&pool, &item, ItemStatus::Generating).await.unwrap();
        store::save_generation_result(&pool, &id, "hello", None, None, ItemStatus::Ready)
            .await
            .unwrap();

        // One permit, held by a task that waits for the gate
        let gate = Arc::new(Notify::new());
        let release_pool = pool.clone();
        let queue = {
            let gate = gate.clone();
            TaskQueue::builder(pool.clone(), 1)
                .register("busy", move |_, _| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok(Value::Null)
                    }
                })
                .register(scheduler::PUBLISH_ITEM, |_, _| async move { Ok(Value::Null) })
                .on_revoke(scheduler::PUBLISH_ITEM, move |payload| {
                    release_publish_claim(release_pool.clone(), payload)
                })
                .build()
        };
        let busy = queue.enqueue("busy", Value::Null).await.unwrap();
        for _ in 0..100 {
            if busy.poll().state == TaskState::Started {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        assert_eq!(scheduler::publish_sweep(&pool, &queue, Utc::now()).await.unwrap(), 1);
        let claimed = store::get_scheduled_item(&pool, &id).await.unwrap().unwrap();
        assert_eq!(claimed.status, ItemStatus::Publishing);

        let stopping = tokio::spawn({
            let queue = queue.clone();
            async move { queue.shutdown().await }
        });
        for _ in 0..100 {
            let item = store::get_scheduled_item(&pool, &id).await.unwrap().unwrap();
            if item.status != ItemStatus::Publishing {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        gate.notify_one();
        stopping.await.unwrap();

        let item = store::get_scheduled_item(&pool, &id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Ready);
        // The next sweep can claim it again
        let due = store::get_due_ready_items(&pool, Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn batch_request_defaults() {
        let request: BatchRequest = serde_json::from_value(json!({
            "destinations": ["101", "102"],
            "content": "Hello"
        }))
        .unwrap();
        assert_eq!(request.destinations, ["101", "102"]);
        assert!(request.image.is_none());
        assert!(!request.use_markdown);
    }
}
