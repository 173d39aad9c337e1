//! AI vendor adapters behind one async interface.
//!
//! Each adapter turns (prompt, context, config) into a vendor request,
//! normalizes the response and maps vendor failures onto `ProviderError`.

pub mod gemini;
pub mod media;
pub mod openai;
pub mod prompts;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::config::{Config, GenerationSettings};
use crate::error::ProviderError;
use crate::models::{GenerationConfig, Provider};

pub use media::MediaStore;

/// Flat key/value context rendered into the user prompt.
pub type Context = BTreeMap<String, String>;

pub type AdapterMap = HashMap<Provider, Arc<dyn ProviderAdapter>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub size: String,
    pub format: String,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            size: "1024x1024".to_string(),
            format: "png".to_string(),
        }
    }
}

impl From<&GenerationSettings> for ImageSpec {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            size: settings.image_size.clone(),
            format: settings.image_format.clone(),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn generate_text(
        &self,
        prompt: &str,
        context: &Context,
        config: &GenerationConfig,
    ) -> Result<String, ProviderError>;

    async fn generate_image_prompt(&self, content: &str, config: &GenerationConfig) -> Result<String, ProviderError>;

    /// Generate an image and write it under the media root.
    async fn generate_image(&self, prompt: &str, spec: &ImageSpec) -> Result<PathBuf, ProviderError>;
}

/// Build one adapter per vendor from `[providers.*]`. A vendor without an
/// API key is still registered; its calls fail as not configured.
pub fn build_adapters(config: &Config) -> Result<AdapterMap> {
    let media = MediaStore::new(config.media_root());
    let mut adapters: AdapterMap = HashMap::new();

    let openai = openai::OpenAiAdapter::new(&config.providers.openai, media.clone())?;
    adapters.insert(Provider::OpenAi, Arc::new(openai));

    let gemini = gemini::GeminiAdapter::new(&config.providers.gemini, media)?;
    adapters.insert(Provider::Gemini, Arc::new(gemini));

    Ok(adapters)
}

pub(crate) fn http_client(timeout: &str) -> Result<reqwest::Client> {
    let timeout = humantime::parse_duration(timeout).unwrap_or(Duration::from_secs(60));
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("pagecast/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("creating provider HTTP client")
}

/// Turn a non-success response into a classified error. The raw body is
/// kept because quota markers live in vendor-specific fields.
pub(crate) async fn error_from_response(provider: Provider, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::from_status(provider, status, &body)
}
