use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pagecast", about = "AI-generated posts for social pages, scheduled and published")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Generation configurations
    Configs {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Publishing destinations
    Destinations {
        #[command(subcommand)]
        command: DestinationCommands,
    },

    /// Lead-form submissions
    Leads {
        #[command(subcommand)]
        command: LeadCommands,
    },

    /// Schedule a post
    Schedule {
        /// Destination ids or external ids
        #[arg(long = "to", required = true)]
        destinations: Vec<String>,

        /// Topic for generated content
        #[arg(long, conflicts_with = "text")]
        prompt: Option<String>,

        /// Category passed to the generator
        #[arg(long, requires = "prompt")]
        category: Option<String>,

        /// Publish this text instead of generating from a topic
        #[arg(long)]
        text: Option<String>,

        /// Extra context as key=value, repeatable
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// RFC 3339 time, or a delay like "2h"; now when omitted
        #[arg(long)]
        at: Option<String>,

        /// Hold generated content for approval
        #[arg(long)]
        approval: bool,

        /// Render content from markdown before publishing
        #[arg(long)]
        markdown: bool,

        #[arg(long)]
        link: Option<String>,

        /// Create one item per destination instead of a single shared item
        #[arg(long)]
        split: bool,
    },

    /// List scheduled items, newest first
    Items {
        /// Only items in this status
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Generate content for a scheduled item now
    Generate {
        item: String,
    },

    /// Publish a ready item now
    Publish {
        item: String,
    },

    /// Publish text to destinations immediately
    Batch {
        #[arg(long = "to", required = true)]
        destinations: Vec<String>,

        #[arg(long)]
        text: String,

        #[arg(long)]
        image: Option<PathBuf>,

        #[arg(long)]
        link: Option<String>,

        #[arg(long)]
        markdown: bool,
    },

    /// Approve an item awaiting approval
    Approve {
        item: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Reject an item awaiting approval
    Reject {
        item: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Cancel an item that has not been published
    Cancel {
        item: String,
    },

    /// Run a sweep once
    Sweep {
        #[command(subcommand)]
        command: SweepCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// List generation configurations in priority order
    List,
    /// Add a generation configuration
    Add {
        name: String,
        model: String,
        /// openai or gemini; inferred from the model name when omitted
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 500)]
        max_tokens: i64,
        #[arg(long, default_value_t = 0.7)]
        temperature: f64,
        #[arg(long, default_value_t = 5)]
        max_hashtags: i64,
        #[arg(long)]
        no_hashtags: bool,
        #[arg(long)]
        no_emojis: bool,
        /// Make it the default right away
        #[arg(long)]
        default: bool,
    },
    /// Show the default configuration
    Default,
    /// Make a configuration the default
    SetDefault {
        /// Configuration id or name
        config: String,
    },
}

#[derive(Subcommand)]
pub enum DestinationCommands {
    List,
    /// Print the page token a user token grants for a page
    PageToken {
        page_id: String,
        #[arg(long)]
        user_token: String,
    },
    /// Check a destination's permissions and store them
    Check {
        /// Destination id or external id
        destination: String,
    },
    /// Register every page and group a user token can reach
    Sync {
        #[arg(long)]
        user_token: String,
        /// Also check and store each destination's permissions
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand)]
pub enum LeadCommands {
    /// Fetch new leads from a page's lead forms
    Collect {
        /// Destination id or external id
        destination: String,
    },
    /// Show stored leads, newest first
    List {
        /// Only leads of this destination (id or external id)
        #[arg(long)]
        destination: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum SweepCommands {
    /// Publish due ready items
    Publish,
    /// Generate content for upcoming items
    Generation,
}

/// `--context key=value` pairs.
pub fn parse_context(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut context = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid context '{pair}': expected KEY=VALUE");
        };
        if key.trim().is_empty() {
            bail!("invalid context '{pair}': empty key");
        }
        context.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(context)
}

/// `--at` as an RFC 3339 timestamp or a delay from `now`.
pub fn parse_at(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    let delay = humantime::parse_duration(value)
        .with_context(|| format!("invalid --at '{value}': expected RFC 3339 time or a delay like '2h'"))?;
    Ok(now + chrono::Duration::from_std(delay)?)
}
