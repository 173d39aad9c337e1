use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Context, ImageSpec, MediaStore, ProviderAdapter, error_from_response, http_client, prompts};
use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::models::{GenerationConfig, Provider};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_IMAGE_MODEL: &str = "imagen-3.0-generate-001";
const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: [Content<'a>; 1],
    generation_config: GenerationParams,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationParams {
    temperature: f64,
    max_output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest<'a> {
    instances: [PredictInstance<'a>; 1],
    parameters: PredictParams,
}

#[derive(Debug, Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParams {
    sample_count: u32,
    aspect_ratio: &'static str,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
}

/// generateContent and Imagen predict client.
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    image_model: String,
    media: MediaStore,
}

/// Model names are addressed as `models/<name>` on the public endpoint.
pub fn model_path(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// Imagen takes an aspect ratio instead of pixel dimensions.
pub fn aspect_ratio(size: &str) -> &'static str {
    if size == "1024x1024" { "1:1" } else { "16:9" }
}

impl GeminiAdapter {
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
                Provider::Gemini,
                ProviderErrorKind::NotConfigured,
                format!("no API key (set providers.gemini.api_key or {API_KEY_ENV})"),
            )
        })
    }

    async fn generate(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: i64,
        temperature: f64,
    ) -> Result<String, ProviderError> {
        let key = self.api_key()?;
        let request = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: [Part { text: system }],
            },
            contents: [Content {
                role: Some("user"),
                parts: [Part { text: user }],
            }],
            generation_config: GenerationParams {
                temperature,
                max_output_tokens: max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/{}:generateContent", self.base_url, model_path(model)))
            .header("x-goog-api-key", key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::Gemini, e))?;

        if !response.status().is_success() {
            return Err(error_from_response(Provider::Gemini, response).await);
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::Gemini, e))?;

        let text = body
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n");

        prompts::clean_text(Provider::Gemini, &text)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn generate_text(
        &self,
        prompt: &str,
        context: &Context,
        config: &GenerationConfig,
    ) -> Result<String, ProviderError> {
        prompts::require_input(Provider::Gemini, prompt, "prompt")?;
        let system = prompts::system_prompt(config);
        let user = prompts::user_prompt(prompt, context);
        debug!(model = %config.model, "requesting gemini completion");
        self.generate(&config.model, &system, &user, config.max_tokens, config.temperature)
            .await
    }

    async fn generate_image_prompt(&self, content: &str, config: &GenerationConfig) -> Result<String, ProviderError> {
        prompts::require_input(Provider::Gemini, content, "content")?;
        self.generate(
            &config.model,
            prompts::IMAGE_PROMPT_SYSTEM,
            &prompts::image_prompt_request(content),
            prompts::IMAGE_PROMPT_MAX_TOKENS,
            prompts::IMAGE_PROMPT_TEMPERATURE,
        )
        .await
    }

    async fn generate_image(&self, prompt: &str, spec: &ImageSpec) -> Result<PathBuf, ProviderError> {
        prompts::require_input(Provider::Gemini, prompt, "image prompt")?;
        let key = self.api_key()?;
        let request = PredictRequest {
            instances: [PredictInstance { prompt }],
            parameters: PredictParams {
                sample_count: 1,
                aspect_ratio: aspect_ratio(&spec.size),
            },
        };

        let response = self
            .client
            .post(format!("{}/{}:predict", self.base_url, model_path(&self.image_model)))
            .header("x-goog-api-key", key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::Gemini, e))?;

        if !response.status().is_success() {
            return Err(error_from_response(Provider::Gemini, response).await);
        }

        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(Provider::Gemini, e))?;
        let encoded = body
            .predictions
            .into_iter()
            .find_map(|p| p.bytes_base64_encoded)
            .ok_or_else(|| ProviderError::malformed(Provider::Gemini, "predict response has no image bytes"))?;

        self.media.save_base64(Provider::Gemini, &encoded, &spec.format).await
    }
}
