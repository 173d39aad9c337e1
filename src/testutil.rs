//! Fixtures and scripted collaborators shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::DestinationSeed;
use crate::error::{GraphError, ProviderError, ProviderErrorKind};
use crate::graph::{Post, Publisher};
use crate::models::{
    ContentRequest, Destination, DestinationKind, GenerationConfig, NewGenerationConfig, PromptSource, Provider,
    Schedule,
};
use crate::providers::{AdapterMap, Context, ImageSpec, ProviderAdapter};
use crate::store;

pub fn config_with(name: &str, provider: Option<Provider>, model: &str) -> GenerationConfig {
    GenerationConfig {
        id: format!("id-{name}"),
        name: name.to_string(),
        description: String::new(),
        provider: provider.map(|p| p.as_str().to_string()),
        model: model.to_string(),
        max_tokens: 500,
        temperature: 0.7,
        include_hashtags: true,
        max_hashtags: 5,
        include_emojis: true,
        is_default: false,
        created_at: Utc::now(),
    }
}

pub async fn seed_config(pool: &SqlitePool, name: &str, provider: Option<Provider>, model: &str) -> GenerationConfig {
    store::insert_generation_config(
        pool,
        &NewGenerationConfig {
            name: name.to_string(),
            description: String::new(),
            provider,
            model: model.to_string(),
            max_tokens: 500,
            temperature: 0.7,
            include_hashtags: true,
            max_hashtags: 5,
            include_emojis: true,
            is_default: false,
        },
    )
    .await
    .expect("insert generation config")
}

pub fn destination_seed(name: &str, external_id: &str) -> DestinationSeed {
    DestinationSeed {
        name: name.to_string(),
        kind: DestinationKind::Page,
        external_id: external_id.to_string(),
        category: Some("Technology".to_string()),
        access_token: format!("token-{external_id}"),
        is_active: true,
    }
}

pub async fn seed_destination(pool: &SqlitePool, name: &str, external_id: &str) -> Destination {
    let id = store::upsert_destination(pool, &destination_seed(name, external_id))
        .await
        .expect("upsert destination");
    store::get_destination(pool, &id)
        .await
        .expect("fetch destination")
        .expect("destination exists")
}

pub fn manual_request(text: &str) -> ContentRequest {
    ContentRequest {
        prompt: PromptSource::Manual(text.to_string()),
        context: BTreeMap::new(),
        destinations: Vec::new(),
        schedule: Schedule::Immediate,
        use_markdown: false,
        requires_approval: false,
        link: None,
    }
}

pub fn template_request(prompt: &str, category: Option<&str>) -> ContentRequest {
    ContentRequest {
        prompt: PromptSource::Template {
            prompt: prompt.to_string(),
            category: category.map(str::to_string),
        },
        ..manual_request("")
    }
}

/// Adapter whose answers are fixed up front; records every call.
pub struct ScriptedAdapter {
    provider: Provider,
    text: HashMap<String, Result<String, ProviderErrorKind>>,
    image_prompt: Result<String, ProviderErrorKind>,
    image: Result<PathBuf, ProviderErrorKind>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            text: HashMap::new(),
            image_prompt: Err(ProviderErrorKind::Server),
            image: Err(ProviderErrorKind::Server),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn text_ok(mut self, model: &str, text: &str) -> Self {
        self.text.insert(model.to_string(), Ok(text.to_string()));
        self
    }

    pub fn text_err(mut self, model: &str, kind: ProviderErrorKind) -> Self {
        self.text.insert(model.to_string(), Err(kind));
        self
    }

    pub fn image_prompt_ok(mut self, prompt: &str) -> Self {
        self.image_prompt = Ok(prompt.to_string());
        self
    }

    pub fn image_ok(mut self, path: &str) -> Self {
        self.image = Ok(PathBuf::from(path));
        self
    }

    pub fn image_err(mut self, kind: ProviderErrorKind) -> Self {
        self.image = Err(kind);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn fail(&self, kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new(self.provider, kind, "scripted failure")
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn generate_text(
        &self,
        _prompt: &str,
        _context: &Context,
        config: &GenerationConfig,
    ) -> Result<String, ProviderError> {
        self.record(format!("text:{}", config.model));
        match self.text.get(&config.model) {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(kind)) => Err(self.fail(*kind)),
            None => Err(self.fail(ProviderErrorKind::InvalidRequest)),
        }
    }

    async fn generate_image_prompt(&self, _content: &str, config: &GenerationConfig) -> Result<String, ProviderError> {
        self.record(format!("image_prompt:{}", config.model));
        self.image_prompt.clone().map_err(|kind| self.fail(kind))
    }

    async fn generate_image(&self, _prompt: &str, _spec: &ImageSpec) -> Result<PathBuf, ProviderError> {
        self.record("image".to_string());
        self.image.clone().map_err(|kind| self.fail(kind))
    }
}

pub fn adapters(list: &[Arc<ScriptedAdapter>]) -> AdapterMap {
    list.iter()
        .map(|a| (a.provider(), a.clone() as Arc<dyn ProviderAdapter>))
        .collect()
}

/// Publisher that succeeds unless a failure was scripted for the
/// destination's external id.
#[derive(Default)]
pub struct ScriptedPublisher {
    failures: HashMap<String, (u16, String)>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, external_id: &str, status: u16, message: &str) -> Self {
        self.failures
            .insert(external_id.to_string(), (status, message.to_string()));
        self
    }

    /// (external id, message) per call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(&self, destination: &Destination, post: &Post) -> Result<String, GraphError> {
        self.calls
            .lock()
            .unwrap()
            .push((destination.external_id.clone(), post.message.clone()));
        match self.failures.get(&destination.external_id) {
            Some((403, message)) => Err(GraphError::NoPermission(message.clone())),
            Some((status, message)) => Err(GraphError::Api {
                status: *status,
                message: message.clone(),
            }),
            None => Ok(format!("{}_post", destination.external_id)),
        }
    }
}
