use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::error::{GenerationError, ProviderError, Stage};
use crate::models::{GenerationConfig, Provider};
use crate::providers::{AdapterMap, Context, ImageSpec, ProviderAdapter};
use crate::registry;

/// One call made by a fallback chain. Kept for the exhaustion log line.
#[derive(Debug)]
pub struct GenerationAttempt {
    pub config: String,
    pub provider: Provider,
    pub error: ProviderError,
}

/// Tries generation configs in priority order until one succeeds.
pub struct Orchestrator {
    pool: SqlitePool,
    adapters: AdapterMap,
}

impl Orchestrator {
    pub fn new(pool: SqlitePool, adapters: AdapterMap) -> Self {
        Self { pool, adapters }
    }

    pub async fn generate_with_fallback(
        &self,
        prompt: &str,
        context: &Context,
        explicit: Option<&GenerationConfig>,
    ) -> Result<String, GenerationError> {
        if prompt.trim().is_empty() {
            return Err(GenerationError::EmptyInput { stage: Stage::Text });
        }
        self.run_chain(Stage::Text, explicit, false, |adapter, config| async move {
            adapter.generate_text(prompt, context, &config).await
        })
        .await
    }

    pub async fn generate_image_prompt_with_fallback(&self, content: &str) -> Result<String, GenerationError> {
        if content.trim().is_empty() {
            return Err(GenerationError::EmptyInput {
                stage: Stage::ImagePrompt,
            });
        }
        self.run_chain(Stage::ImagePrompt, None, false, |adapter, config| async move {
            adapter.generate_image_prompt(content, &config).await
        })
        .await
    }

    /// Image calls ignore per-config sampling, so each vendor is asked at
    /// most once per run.
    pub async fn generate_image_with_fallback(
        &self,
        prompt: &str,
        spec: &ImageSpec,
    ) -> Result<PathBuf, GenerationError> {
        if prompt.trim().is_empty() {
            return Err(GenerationError::EmptyInput { stage: Stage::Image });
        }
        self.run_chain(Stage::Image, None, true, |adapter, _config| async move {
            adapter.generate_image(prompt, spec).await
        })
        .await
    }

    async fn run_chain<T, F, Fut>(
        &self,
        stage: Stage,
        explicit: Option<&GenerationConfig>,
        once_per_provider: bool,
        mut call: F,
    ) -> Result<T, GenerationError>
    where
        F: FnMut(Arc<dyn ProviderAdapter>, GenerationConfig) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let configs = registry::ordered_configs(&self.pool, explicit)
            .await
            .map_err(|e| GenerationError::Registry(format!("{e:#}")))?;
        let total = configs.len();

        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut tried = HashSet::new();

        for (index, config) in configs.into_iter().enumerate() {
            let Some(provider) = registry::resolve_provider(&config) else {
                continue;
            };
            let Some(adapter) = self.adapters.get(&provider).cloned() else {
                warn!(config = %config.name, provider = %provider, "no adapter registered, skipping config");
                continue;
            };
            if once_per_provider && !tried.insert(provider) {
                debug!(config = %config.name, provider = %provider, stage = %stage, "provider already tried");
                continue;
            }

            let name = config.name.clone();
            info!(
                stage = %stage,
                config = %name,
                provider = %provider,
                attempt = index + 1,
                total,
                "trying generation config"
            );

            match call(adapter, config).await {
                Ok(value) => {
                    info!(stage = %stage, config = %name, provider = %provider, "generation succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    if e.is_quota() {
                        warn!(stage = %stage, config = %name, provider = %provider, quota = true, error = %e.message, "provider quota exhausted, trying next config");
                    } else {
                        warn!(stage = %stage, config = %name, provider = %provider, kind = %e.kind, error = %e.message, "generation attempt failed, trying next config");
                    }
                    attempts.push(GenerationAttempt {
                        config: name,
                        provider,
                        error: e,
                    });
                }
            }
        }

        let count = attempts.len();
        match attempts.pop() {
            Some(last) => {
                error!(stage = %stage, attempts = count, last_config = %last.config, "all generation configs failed");
                Err(GenerationError::Exhausted {
                    stage,
                    attempts: count,
                    last_error: last.error,
                })
            }
            None => {
                error!(stage = %stage, "no usable generation config");
                Err(GenerationError::NoUsableConfig { stage })
            }
        }
    }
}
