use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Context, ImageSpec, MediaStore, ProviderAdapter, error_from_response, http_client, prompts};
use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::models::{GenerationConfig, Provider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: i64,
    temperature: f64,
    n: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    b64_json: Option<String>,
}

/// Chat-completions and images API client.
pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    image_model: String,
    media: MediaStore,
}

impl OpenAiAdapter {
    pub fn new(config: &ProviderConfig, media: MediaStore) -> Result<Self> {
        Ok(Self {
            client: http_client(&config.timeout)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.resolve_api_key(API_KEY_ENV),
            image_model: config
                .image_model
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            media,
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::new(
                Provider::OpenAi,
                ProviderErrorKind::NotConfigured,
                format!("no API key (set providers.openai.api_key or {API_KEY_ENV})"),
            )
        })
    }

    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: i64,
        temperature: f64,
    ) -> Result<String, ProviderError> {
        let key = self.api_key()?;
        let request = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature,
            n: 1,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::OpenAi, e))?;

        if !response.status().is_success() {
            return Err(error_from_response(Provider::OpenAi, response).await);
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::OpenAi, e))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::malformed(Provider::OpenAi, "response has no choices"))?;

        prompts::clean_text(Provider::OpenAi, &content)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn generate_text(
        &self,
        prompt: &str,
        context: &Context,
        config: &GenerationConfig,
    ) -> Result<String, ProviderError> {
        prompts::require_input(Provider::OpenAi, prompt, "prompt")?;
        let system = prompts::system_prompt(config);
        let user = prompts::user_prompt(prompt, context);
        debug!(model = %config.model, "requesting openai completion");
        self.chat(&config.model, &system, &user, config.max_tokens, config.temperature)
            .await
    }

    async fn generate_image_prompt(&self, content: &str, config: &GenerationConfig) -> Result<String, ProviderError> {
        prompts::require_input(Provider::OpenAi, content, "content")?;
        self.chat(
            &config.model,
            prompts::IMAGE_PROMPT_SYSTEM,
            &prompts::image_prompt_request(content),
            prompts::IMAGE_PROMPT_MAX_TOKENS,
            prompts::IMAGE_PROMPT_TEMPERATURE,
        )
        .await
    }

    async fn generate_image(&self, prompt: &str, spec: &ImageSpec) -> Result<PathBuf, ProviderError> {
        prompts::require_input(Provider::OpenAi, prompt, "image prompt")?;
        let key = self.api_key()?;
        let request = ImageRequest {
            model: &self.image_model,
            prompt,
            n: 1,
            size: &spec.size,
            response_format: "b64_json",
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::OpenAi, e))?;

        if !response.status().is_success() {
            return Err(error_from_response(Provider::OpenAi, response).await);
        }

        let body: ImageResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::OpenAi, e))?;
        let encoded = body
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| ProviderError::malformed(Provider::OpenAi, "image response has no b64_json"))?;

        self.media.save_base64(Provider::OpenAi, &encoded, &spec.format).await
    }
}
