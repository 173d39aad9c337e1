use std::collections::HashSet;

use anyhow::{Result, bail};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::validate_sampling;
use crate::error::ConfigError;
use crate::models::{GenerationConfig, NewGenerationConfig, Provider};
use crate::store;

pub const DEFAULT_CONFIG_NAME: &str = "Default configuration";

/// Configuration used when the registry is empty.
pub fn builtin_default() -> NewGenerationConfig {
    NewGenerationConfig {
        name: DEFAULT_CONFIG_NAME.to_string(),
        description: "Created automatically because no configuration existed".to_string(),
        provider: Some(Provider::OpenAi),
        model: "gpt-3.5-turbo".to_string(),
        max_tokens: 500,
        temperature: 0.7,
        include_hashtags: true,
        max_hashtags: 5,
        include_emojis: true,
        is_default: true,
    }
}

/// Guess the vendor from a model name. Only used for configs without an
/// explicit provider tag.
pub fn infer_provider(model: &str) -> Option<Provider> {
    let model = model.trim().to_lowercase();
    if model.starts_with("gpt") || model.starts_with('o') {
        Some(Provider::OpenAi)
    } else if model.starts_with("gemini") {
        Some(Provider::Gemini)
    } else {
        None
    }
}

pub fn resolve_provider(config: &GenerationConfig) -> Option<Provider> {
    match config.provider.as_deref().map(str::trim) {
        Some(tag) if !tag.is_empty() => match tag.parse::<Provider>() {
            Ok(provider) => Some(provider),
            Err(e) => {
                warn!(config = %config.name, error = %e, "skipping config with unknown provider");
                None
            }
        },
        _ => {
            let inferred = infer_provider(&config.model);
            if inferred.is_none() {
                warn!(config = %config.name, model = %config.model, "cannot infer provider from model name");
            }
            inferred
        }
    }
}

/// Configs in the order the fallback chain tries them: the explicit one,
/// then the default, then the rest oldest first. Each config appears once.
pub async fn ordered_configs(pool: &SqlitePool, explicit: Option<&GenerationConfig>) -> Result<Vec<GenerationConfig>> {
    let mut all = store::list_generation_configs(pool).await?;

    if all.is_empty() && explicit.is_none() {
        warn!("no generation configuration exists; creating '{DEFAULT_CONFIG_NAME}'");
        all.push(create_builtin_default(pool).await?);
    }

    let mut seen = HashSet::new();
    let mut ordered = Vec::with_capacity(all.len() + 1);

    if let Some(config) = explicit
        && seen.insert(config.id.clone())
    {
        ordered.push(config.clone());
    }
    if let Some(default) = all.iter().find(|c| c.is_default)
        && seen.insert(default.id.clone())
    {
        ordered.push(default.clone());
    }
    for config in all {
        if seen.insert(config.id.clone()) {
            ordered.push(config);
        }
    }
    Ok(ordered)
}

async fn create_builtin_default(pool: &SqlitePool) -> Result<GenerationConfig> {
    match store::insert_generation_config(pool, &builtin_default()).await {
        Ok(config) => Ok(config),
        Err(e) => {
            // Another task may have created it first
            if let Some(existing) = store::get_generation_config_by_name(pool, DEFAULT_CONFIG_NAME).await? {
                Ok(existing)
            } else {
                Err(e)
            }
        }
    }
}

pub async fn create(pool: &SqlitePool, new: &NewGenerationConfig) -> Result<GenerationConfig> {
    validate_sampling(new.max_tokens, new.temperature, new.max_hashtags)
        .map_err(|e| ConfigError::Validation(format!("generation config '{}': {}", new.name, e)))?;
    if new.model.trim().is_empty() {
        return Err(ConfigError::Validation(format!("generation config '{}': model is empty", new.name)).into());
    }
    let config = store::insert_generation_config(pool, new).await?;
    info!(name = %config.name, default = config.is_default, "created generation config");
    Ok(config)
}

/// Make `id` the single default. Repeating the call changes nothing.
pub async fn set_default(pool: &SqlitePool, id: &str) -> Result<()> {
    if !store::set_default_config(pool, id).await? {
        bail!("generation config '{id}' not found");
    }
    info!(id = %id, "default generation config set");
    Ok(())
}

pub async fn get_default(pool: &SqlitePool) -> Result<Option<GenerationConfig>> {
    store::get_default_config(pool).await
}

/// Look a config up by id or by name.
pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<GenerationConfig>> {
    if let Some(config) = store::get_generation_config(pool, key).await? {
        return Ok(Some(config));
    }
    store::get_generation_config_by_name(pool, key).await
}
