use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// AI vendor behind a generation configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GenerationConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub provider: Option<String>,
    pub model: String,
    pub max_tokens: i64,
    pub temperature: f64,
    pub include_hashtags: bool,
    pub max_hashtags: i64,
    pub include_emojis: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a generation configuration.
#[derive(Debug, Clone)]
pub struct NewGenerationConfig {
    pub name: String,
    pub description: String,
    pub provider: Option<Provider>,
    pub model: String,
    pub max_tokens: i64,
    pub temperature: f64,
    pub include_hashtags: bool,
    pub max_hashtags: i64,
    pub include_emojis: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DestinationKind {
    Page,
    Group,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Page => "page",
            Self::Group => "group",
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Destination {
    pub id: String,
    pub kind: DestinationKind,
    pub external_id: String,
    pub name: String,
    pub category: Option<String>,
    pub access_token: String,
    pub can_publish: bool,
    pub can_read_metrics: bool,
    pub is_active: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Generating,
    Ready,
    PendingApproval,
    Publishing,
    Published,
    Failed,
    Cancelled,
    Rejected,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Ready => "ready",
            Self::PendingApproval => "pending_approval",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Cancelled | Self::Rejected)
    }

    /// Allowed edges of the item lifecycle. `Failed -> Generating` is the
    /// manual regenerate path; `Publishing -> Ready` hands back a claim
    /// whose publish task never started.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Generating)
                | (Generating, Ready)
                | (Generating, PendingApproval)
                | (Generating, Failed)
                | (PendingApproval, Ready)
                | (PendingApproval, Rejected)
                | (Ready, Publishing)
                | (Publishing, Published)
                | (Publishing, Failed)
                | (Publishing, Ready)
                | (Failed, Generating)
                | (Pending, Cancelled)
                | (Generating, Cancelled)
                | (Ready, Cancelled)
                | (PendingApproval, Cancelled)
        )
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        [
            Self::Pending,
            Self::Generating,
            Self::Ready,
            Self::PendingApproval,
            Self::Publishing,
            Self::Published,
            Self::Failed,
            Self::Cancelled,
            Self::Rejected,
        ]
        .into_iter()
        .find(|status| status.as_str() == wanted)
        .ok_or_else(|| format!("unknown item status '{s}'"))
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the text of a post comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Template { prompt: String, category: Option<String> },
    Manual(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Immediate,
    At(DateTime<Utc>),
}

/// A user request to produce and publish a post.
#[derive(Debug, Clone)]
pub struct ContentRequest {
    pub prompt: PromptSource,
    pub context: BTreeMap<String, String>,
    pub destinations: Vec<String>,
    pub schedule: Schedule,
    pub use_markdown: bool,
    pub requires_approval: bool,
    pub link: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduledItem {
    pub id: String,
    pub status: ItemStatus,
    pub template_prompt: Option<String>,
    pub category: Option<String>,
    pub manual_content: Option<String>,
    /// JSON object of string pairs.
    pub context: String,
    pub use_markdown: bool,
    pub link: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub generated_content: Option<String>,
    pub generated_image_prompt: Option<String>,
    pub generated_image_file: Option<String>,
    pub error_message: Option<String>,
    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledItem {
    pub fn context_map(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.context).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PublicationOutcome {
    pub id: String,
    pub batch_id: String,
    pub item_id: Option<String>,
    pub destination_id: String,
    pub success: bool,
    pub external_post_id: Option<String>,
    pub post_url: Option<String>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    pub published_at: DateTime<Utc>,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub metrics_updated_at: Option<DateTime<Utc>>,
}

/// A lead-form submission collected from a page.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Lead {
    pub id: String,
    pub lead_id: String,
    pub destination_id: String,
    pub form_id: String,
    pub form_name: String,
    pub is_organic: bool,
    pub ad_id: Option<String>,
    pub ad_name: Option<String>,
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
    /// JSON object of answers keyed by form field name.
    pub fields: String,
    /// As reported by the Graph API.
    pub created_time: Option<String>,
    pub collected_at: DateTime<Utc>,
}

impl Lead {
    pub fn field_map(&self) -> BTreeMap<String, Option<String>> {
        serde_json::from_str(&self.fields).unwrap_or_default()
    }
}

/// Outcome row to be written. Not a FromRow; built by the coordinator.
pub struct NewOutcome<'a> {
    pub batch_id: &'a str,
    pub item_id: Option<&'a str>,
    pub destination_id: &'a str,
    pub external_post_id: Option<&'a str>,
    pub error_kind: Option<&'a str>,
    pub error_detail: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub payload: String,
    pub state: TaskState,
    pub progress_current: i64,
    pub progress_total: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub item_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
