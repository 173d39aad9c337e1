mod cleanup;
mod cli;
mod config;
mod daemon;
mod db;
mod discovery;
mod error;
mod fallback;
mod format;
mod graph;
mod leads;
mod metrics;
mod models;
mod pipeline;
mod providers;
mod publish;
mod registry;
mod scheduler;
mod server;
mod store;
mod tasks;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::cli::{Cli, Commands, ConfigCommands, DestinationCommands, LeadCommands, SweepCommands};
use crate::config::{load_config, validate_config};
use crate::daemon::{BatchRequest, Services};
use crate::models::{ContentRequest, ItemStatus, NewGenerationConfig, PromptSource, Provider, Schedule};
use crate::tasks::Progress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.pagecast.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    let Some(command) = cli.command else {
        return daemon::run(config).await;
    };
    if let Commands::Validate = command {
        println!("Configuration is valid.");
        return Ok(());
    }

    let services = Arc::new(Services::init(&config).await?);
    let pool = &services.pool;

    match command {
        Commands::Validate => {}
        Commands::Configs { command } => match command {
            ConfigCommands::List => {
                for c in registry::ordered_configs(pool, None).await? {
                    let provider = registry::resolve_provider(&c).map_or("?", |p| p.as_str());
                    let marker = if c.is_default { "*" } else { " " };
                    println!("{marker} {:<24} {provider}/{}  (id {})", c.name, c.model, c.id);
                }
            }
            ConfigCommands::Add {
                name,
                model,
                provider,
                description,
                max_tokens,
                temperature,
                max_hashtags,
                no_hashtags,
                no_emojis,
                default,
            } => {
                let provider = provider
                    .map(|p| p.parse::<Provider>().map_err(|e| anyhow!(e)))
                    .transpose()?;
                let created = registry::create(
                    pool,
                    &NewGenerationConfig {
                        name,
                        description,
                        provider,
                        model,
                        max_tokens,
                        temperature,
                        include_hashtags: !no_hashtags,
                        max_hashtags,
                        include_emojis: !no_emojis,
                        is_default: default,
                    },
                )
                .await?;
                println!("Created generation config '{}' (id {}).", created.name, created.id);
            }
            ConfigCommands::Default => match registry::get_default(pool).await? {
                Some(c) => println!(
                    "{} {}/{} max_tokens={} temperature={} (id {})",
                    c.name,
                    registry::resolve_provider(&c).map_or("?", |p| p.as_str()),
                    c.model,
                    c.max_tokens,
                    c.temperature,
                    c.id
                ),
                None => println!("No default configuration."),
            },
            ConfigCommands::SetDefault { config: key } => {
                let found = registry::get(pool, &key)
                    .await?
                    .ok_or_else(|| anyhow!("no generation config '{key}'"))?;
                registry::set_default(pool, &found.id).await?;
                println!("'{}' is now the default configuration.", found.name);
            }
        },
        Commands::Destinations { command } => match command {
            DestinationCommands::List => {
                for d in store::list_destinations(pool).await? {
                    println!(
                        "{:<24} {:<6} {:<20} active={} publish={} metrics={}  (id {})",
                        d.name, d.kind, d.external_id, d.is_active, d.can_publish, d.can_read_metrics, d.id
                    );
                }
            }
            DestinationCommands::PageToken { page_id, user_token } => {
                match services.graph.page_access_token(&user_token, &page_id).await? {
                    Some(token) => println!("{token}"),
                    None => bail!("user token has no access to page '{page_id}'"),
                }
            }
            DestinationCommands::Check { destination } => {
                let dest = store::find_destination(pool, &destination)
                    .await?
                    .ok_or_else(|| anyhow!("no destination '{destination}'"))?;
                let caps = metrics::sync_destination(pool, &services.graph, &dest).await?;
                println!(
                    "{}: publish={} metrics={}",
                    dest.name, caps.can_publish, caps.can_read_metrics
                );
            }
            DestinationCommands::Sync { user_token, check } => {
                let report = discovery::sync_destinations(pool, &services.graph, &user_token, check).await?;
                print_json(&report)?;
            }
        },
        Commands::Leads { command } => match command {
            LeadCommands::Collect { destination } => {
                let dest = store::find_destination(pool, &destination)
                    .await?
                    .ok_or_else(|| anyhow!("no destination '{destination}'"))?;
                let report = leads::collect_leads(pool, &services.graph, &dest, Utc::now()).await?;
                print_json(&report)?;
            }
            LeadCommands::List { destination, limit } => {
                let destination_id = match destination {
                    Some(key) => Some(
                        store::find_destination(pool, &key)
                            .await?
                            .ok_or_else(|| anyhow!("no destination '{key}'"))?
                            .id,
                    ),
                    None => None,
                };
                for lead in store::list_leads(pool, destination_id.as_deref(), limit).await? {
                    let contact = lead
                        .field_map()
                        .into_iter()
                        .filter_map(|(k, v)| v.map(|v| format!("{k}={v}")))
                        .collect::<Vec<_>>()
                        .join(" ");
                    println!(
                        "{}  {:<20} {:<24} {}",
                        lead.created_time.as_deref().unwrap_or("-"),
                        lead.lead_id,
                        lead.form_name,
                        contact
                    );
                }
            }
        },
        Commands::Schedule {
            destinations,
            prompt,
            category,
            text,
            context,
            at,
            approval,
            markdown,
            link,
            split,
        } => {
            let prompt = match (prompt, text) {
                (Some(prompt), _) => PromptSource::Template { prompt, category },
                (None, Some(text)) => PromptSource::Manual(text),
                (None, None) => bail!("either --prompt or --text is required"),
            };
            let now = Utc::now();
            let at = at.map(|a| cli::parse_at(&a, now)).transpose()?;
            let request = ContentRequest {
                prompt,
                context: cli::parse_context(&context)?,
                destinations,
                schedule: at.map_or(Schedule::Immediate, Schedule::At),
                use_markdown: markdown,
                requires_approval: approval,
                link,
            };
            if split {
                let report = publish::schedule_for_destinations(pool, &request, at.unwrap_or(now)).await?;
                print_json(&report)?;
            } else {
                let id = publish::create_item(pool, &request).await?;
                println!("Scheduled item {id}.");
            }
        }
        Commands::Items { status, limit } => {
            let status = status
                .map(|s| s.parse::<ItemStatus>().map_err(|e| anyhow!(e)))
                .transpose()?;
            for item in store::list_scheduled_items(pool, status, limit).await? {
                let marker = if item.status.is_terminal() { " " } else { "*" };
                println!(
                    "{marker} {}  {:<16} {}  {}",
                    item.id,
                    item.status,
                    item.scheduled_time.format("%Y-%m-%d %H:%M"),
                    item.error_message.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Generate { item } => {
            let outcome =
                pipeline::generate_for_item(pool, &services.orchestrator, &services.pipeline, &item).await?;
            print_json(&outcome)?;
        }
        Commands::Publish { item } => {
            let outcome = publish::publish_item(pool, &services.graph, &item, None, &Progress::detached()).await?;
            print_json(&outcome)?;
        }
        Commands::Batch {
            destinations,
            text,
            image,
            link,
            markdown,
        } => {
            let request = BatchRequest {
                destinations,
                content: text,
                image,
                link,
                use_markdown: markdown,
            };
            let report = daemon::run_batch(&services, &request, &Progress::detached()).await?;
            print_json(&report)?;
        }
        Commands::Approve { item, by } => {
            publish::approve(pool, &item, &by).await?;
            println!("Approved {item}.");
        }
        Commands::Reject { item, reason, by } => {
            publish::reject(pool, &item, &by, &reason).await?;
            println!("Rejected {item}.");
        }
        Commands::Cancel { item } => {
            publish::cancel(pool, &item).await?;
            println!("Cancelled {item}.");
        }
        Commands::Sweep { command } => {
            let queue = daemon::build_task_queue(services.clone(), config.pagecast.max_concurrent_tasks as usize);
            let dispatched = match command {
                SweepCommands::Publish => scheduler::publish_sweep(pool, &queue, Utc::now()).await?,
                SweepCommands::Generation => {
                    scheduler::generation_sweep(
                        pool,
                        &queue,
                        Utc::now(),
                        services.sweeps.lookahead,
                        services.sweeps.generation_lead,
                    )
                    .await?
                }
            };
            println!("Dispatched {dispatched} item(s), waiting for them to finish...");
            queue.drain().await;
        }
    }

    pool.close().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
