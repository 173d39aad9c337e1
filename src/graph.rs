use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::error::GraphError;
use crate::models::{Destination, DestinationKind};

/// A post ready to send to one destination.
#[derive(Debug, Clone)]
pub struct Post {
    pub message: String,
    pub image: Option<PathBuf>,
    pub link: Option<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and return the external post id.
    async fn publish(&self, destination: &Destination, post: &Post) -> Result<String, GraphError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_publish: bool,
    pub can_read_metrics: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostMetrics {
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
}

/// Graph collections wrap their rows in `data`.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Listing<T> {
    #[serde(default)]
    data: Vec<T>,
}

/// A page the user manages, from `me/accounts`.
#[derive(Debug, Clone, Deserialize)]
pub struct PageAccount {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// A group the user belongs to, from `me/groups`.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub privacy: Option<String>,
    #[serde(default)]
    pub member_count: Option<i64>,
    #[serde(default)]
    pub administrator: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeadForm {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub leads_count: Option<i64>,
}

/// One lead-form submission with its answers keyed by field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormLead {
    pub id: String,
    pub created_time: Option<String>,
    pub is_organic: bool,
    pub ad_id: Option<String>,
    pub ad_name: Option<String>,
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
    pub fields: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Deserialize)]
struct RawLead {
    id: String,
    #[serde(default)]
    created_time: Option<String>,
    #[serde(default = "organic_by_default")]
    is_organic: bool,
    #[serde(default)]
    ad_id: Option<String>,
    #[serde(default)]
    ad_name: Option<String>,
    #[serde(default)]
    campaign_id: Option<String>,
    #[serde(default)]
    campaign_name: Option<String>,
    #[serde(default)]
    field_data: Vec<FieldData>,
}

#[derive(Debug, Deserialize)]
struct FieldData {
    name: String,
    #[serde(default)]
    values: Vec<String>,
}

fn organic_by_default() -> bool {
    true
}

impl From<RawLead> for FormLead {
    fn from(raw: RawLead) -> Self {
        // Only the first answer of a multi-value field is kept
        let fields = raw
            .field_data
            .into_iter()
            .map(|f| (f.name, f.values.into_iter().next()))
            .collect();
        Self {
            id: raw.id,
            created_time: raw.created_time,
            is_organic: raw.is_organic,
            ad_id: raw.ad_id,
            ad_name: raw.ad_name,
            campaign_id: raw.campaign_id,
            campaign_name: raw.campaign_name,
            fields,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    likes: Option<Summarized>,
    #[serde(default)]
    comments: Option<Summarized>,
    #[serde(default)]
    shares: Option<Shares>,
}

#[derive(Debug, Deserialize)]
struct Summarized {
    summary: Summary,
}

#[derive(Debug, Deserialize)]
struct Summary {
    #[serde(default)]
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct Shares {
    #[serde(default)]
    count: i64,
}

pub struct GraphClient {
    client: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(config: &GraphConfig) -> Result<Self> {
        let timeout = humantime::parse_duration(&config.timeout).context("parsing graph timeout")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pagecast/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("creating graph HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        fields: &str,
        access_token: &str,
    ) -> Result<Vec<T>, GraphError> {
        let response = self
            .client
            .get(self.url(path))
            .query(&[("fields", fields), ("access_token", access_token)])
            .send()
            .await?;
        let body = read_json(response).await?;
        let listing: Listing<T> =
            serde_json::from_value(body).map_err(|e| api_error(200, format!("unexpected {path} payload: {e}")))?;
        Ok(listing.data)
    }

    /// Pages the user token manages, each with its own page token.
    pub async fn list_pages(&self, user_token: &str) -> Result<Vec<PageAccount>, GraphError> {
        self.get_list("me/accounts", "id,name,category,access_token", user_token)
            .await
    }

    /// Resolve a page token from a user token via `me/accounts`.
    pub async fn page_access_token(&self, user_token: &str, page_id: &str) -> Result<Option<String>, GraphError> {
        Ok(self
            .list_pages(user_token)
            .await?
            .into_iter()
            .find(|a| a.id == page_id)
            .and_then(|a| a.access_token))
    }

    /// Groups the user token belongs to. Needs a user token, not a page token.
    pub async fn list_groups(&self, user_token: &str) -> Result<Vec<GroupInfo>, GraphError> {
        self.get_list("me/groups", "id,name,privacy,member_count,administrator", user_token)
            .await
    }

    pub async fn leadgen_forms(&self, page_id: &str, access_token: &str) -> Result<Vec<LeadForm>, GraphError> {
        self.get_list(
            &format!("{page_id}/leadgen_forms"),
            "id,name,status,leads_count",
            access_token,
        )
        .await
    }

    pub async fn form_leads(&self, form_id: &str, access_token: &str) -> Result<Vec<FormLead>, GraphError> {
        let raw: Vec<RawLead> = self
            .get_list(
                &format!("{form_id}/leads"),
                "id,created_time,field_data,ad_id,ad_name,campaign_id,campaign_name,is_organic",
                access_token,
            )
            .await?;
        Ok(raw.into_iter().map(FormLead::from).collect())
    }

    pub async fn post_details(&self, post_id: &str, access_token: &str) -> Result<PostMetrics, GraphError> {
        let response = self
            .client
            .get(self.url(post_id))
            .query(&[
                ("fields", "likes.summary(true),comments.summary(true),shares"),
                ("access_token", access_token),
            ])
            .send()
            .await?;
        let body = read_json(response).await?;
        let details: DetailsResponse =
            serde_json::from_value(body).map_err(|e| api_error(200, format!("unexpected post payload: {e}")))?;
        Ok(PostMetrics {
            likes: details.likes.map(|l| l.summary.total_count).unwrap_or(0),
            comments: details.comments.map(|c| c.summary.total_count).unwrap_or(0),
            shares: details.shares.map(|s| s.count).unwrap_or(0),
        })
    }

    /// Check what the destination's token allows: an unpublished test post
    /// for publishing, an insights read (pages) or a plain read (groups)
    /// for metrics.
    pub async fn check_permissions(&self, destination: &Destination) -> Result<Capabilities, GraphError> {
        let can_publish = match self.post_unpublished_check(destination).await {
            Ok(()) => true,
            Err(GraphError::Http(e)) => return Err(GraphError::Http(e)),
            Err(e) => {
                warn!(destination = %destination.name, error = %e, "publish permission check failed");
                false
            }
        };

        let token = destination.access_token.as_str();
        let read = match destination.kind {
            DestinationKind::Page => self
                .client
                .get(self.url(&format!("{}/insights", destination.external_id)))
                .query(&[("metric", "page_fan_adds"), ("period", "day"), ("access_token", token)]),
            // Groups have no insights edge
            DestinationKind::Group => self
                .client
                .get(self.url(&destination.external_id))
                .query(&[("fields", "id,name"), ("access_token", token)]),
        };
        let response = read.send().await?;
        let can_read_metrics = match read_json(response).await {
            Ok(_) => true,
            Err(e) => {
                warn!(destination = %destination.name, error = %e, "metrics permission check failed");
                false
            }
        };

        Ok(Capabilities {
            can_publish,
            can_read_metrics,
        })
    }

    async fn post_unpublished_check(&self, destination: &Destination) -> Result<(), GraphError> {
        let response = self
            .client
            .post(self.url(&format!("{}/feed", destination.external_id)))
            .form(&[
                ("message", "pagecast permission check"),
                ("published", "false"),
                ("access_token", destination.access_token.as_str()),
            ])
            .send()
            .await?;
        let body = read_json(response).await?;

        if let Some(post_id) = post_id(&body) {
            let cleanup = self
                .client
                .delete(self.url(&post_id))
                .query(&[("access_token", destination.access_token.as_str())])
                .send()
                .await;
            if let Err(e) = cleanup {
                debug!(post_id = %post_id, error = %e, "could not delete permission check post");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for GraphClient {
    async fn publish(&self, destination: &Destination, post: &Post) -> Result<String, GraphError> {
        let token = destination.access_token.as_str();

        let response = match &post.image {
            Some(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|source| GraphError::Image {
                    path: path.display().to_string(),
                    source,
                })?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "image.png".to_string());
                let mut form = multipart::Form::new()
                    .text("caption", post.message.clone())
                    .text("access_token", token.to_string())
                    .part("source", multipart::Part::bytes(bytes).file_name(file_name));
                if let Some(link) = &post.link {
                    form = form.text("link", link.clone());
                }
                self.client
                    .post(self.url(&format!("{}/photos", destination.external_id)))
                    .multipart(form)
                    .send()
                    .await?
            }
            None => {
                let mut form = vec![("message", post.message.as_str()), ("access_token", token)];
                if let Some(link) = &post.link {
                    form.push(("link", link.as_str()));
                }
                self.client
                    .post(self.url(&format!("{}/feed", destination.external_id)))
                    .form(&form)
                    .send()
                    .await?
            }
        };

        let body = read_json(response).await?;
        let id = post_id(&body).ok_or(GraphError::MissingPostId)?;
        debug!(destination = %destination.name, post_id = %id, "graph post created");
        Ok(id)
    }
}

/// Photo uploads answer with `post_id`, feed posts with `id`.
fn post_id(body: &Value) -> Option<String> {
    body.get("post_id")
        .or_else(|| body.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn api_error(status: u16, message: String) -> GraphError {
    GraphError::Api { status, message }
}

async fn read_json(response: reqwest::Response) -> Result<Value, GraphError> {
    let status = response.status();
    let text = response.text().await?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(body);
    }

    let error = body.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(text);
    let code = error.and_then(|e| e.get("code")).and_then(Value::as_i64);

    // Graph reports missing permissions as 403 or as OAuth codes 10 and 200-299
    if status.as_u16() == 403 || matches!(code, Some(10) | Some(200..=299)) {
        return Err(GraphError::NoPermission(message));
    }
    Err(api_error(status.as_u16(), message))
}
