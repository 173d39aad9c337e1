use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::{DestinationKind, Provider};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pagecast: PagecastConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub generation_config: Vec<GenerationConfigSeed>,
    #[serde(default)]
    pub destination: Vec<DestinationSeed>,
}

#[derive(Debug, Deserialize)]
pub struct PagecastConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub media_root: Option<PathBuf>,
    #[serde(default = "default_retention")]
    pub retention: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for PagecastConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            media_root: None,
            retention: default_retention(),
            timezone: default_timezone(),
            log_level: default_log_level(),
            max_concurrent_tasks: default_max_concurrent(),
            listen: default_listen(),
            api_token: None,
        }
    }
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_retention() -> String {
    "90d".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_concurrent() -> u32 {
    4
}
fn default_listen() -> String {
    "127.0.0.1:8088".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "pagecast.db".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub gemini: ProviderConfig,
}

/// Connection settings for one AI vendor. Unset fields fall back to the
/// vendor's public endpoint and default image model.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable read when `api_key` is not set.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub image_model: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: None,
            base_url: None,
            image_model: None,
            timeout: default_provider_timeout(),
        }
    }
}

fn default_provider_timeout() -> String {
    "60s".to_string()
}

impl ProviderConfig {
    /// Key from config, else from `api_key_env`, else from `fallback_env`.
    pub fn resolve_api_key(&self, fallback_env: &str) -> Option<String> {
        if let Some(key) = &self.api_key
            && !key.trim().is_empty()
        {
            return Some(key.clone());
        }
        let var = self.api_key_env.as_deref().unwrap_or(fallback_env);
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    #[serde(default = "default_graph_timeout")]
    pub timeout: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_graph_base_url(),
            timeout: default_graph_timeout(),
        }
    }
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com/v18.0".to_string()
}
fn default_graph_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sweep_interval")]
    pub publish_interval: String,
    #[serde(default = "default_sweep_interval")]
    pub generation_interval: String,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval: String,
    #[serde(default = "default_lookahead")]
    pub lookahead: String,
    #[serde(default = "default_generation_lead")]
    pub generation_lead: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            publish_interval: default_sweep_interval(),
            generation_interval: default_sweep_interval(),
            metrics_interval: default_metrics_interval(),
            lookahead: default_lookahead(),
            generation_lead: default_generation_lead(),
        }
    }
}

fn default_sweep_interval() -> String {
    "5m".to_string()
}
fn default_metrics_interval() -> String {
    "6h".to_string()
}
fn default_lookahead() -> String {
    "2h".to_string()
}
fn default_generation_lead() -> String {
    "30m".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_image_size")]
    pub image_size: String,
    #[serde(default = "default_image_format")]
    pub image_format: String,
    #[serde(default = "default_fallback_prompt")]
    pub fallback_prompt: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
            image_format: default_image_format(),
            fallback_prompt: default_fallback_prompt(),
        }
    }
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}
fn default_image_format() -> String {
    "png".to_string()
}
fn default_fallback_prompt() -> String {
    "Create an engaging social media post.".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfigSeed {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub provider: Option<String>,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_true")]
    pub include_hashtags: bool,
    #[serde(default = "default_max_hashtags")]
    pub max_hashtags: i64,
    #[serde(default = "default_true")]
    pub include_emojis: bool,
    #[serde(default)]
    pub is_default: bool,
}

fn default_max_tokens() -> i64 {
    500
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_hashtags() -> i64 {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSeed {
    pub name: String,
    #[serde(default = "default_destination_kind")]
    pub kind: DestinationKind,
    pub external_id: String,
    #[serde(default)]
    pub category: Option<String>,
    pub access_token: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_destination_kind() -> DestinationKind {
    DestinationKind::Page
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.pagecast.data_dir.join(db_path)
        }
    }

    /// Root for generated media; defaults to `<data_dir>/media`.
    pub fn media_root(&self) -> PathBuf {
        self.pagecast
            .media_root
            .clone()
            .unwrap_or_else(|| self.pagecast.data_dir.join("media"))
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.pagecast
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", self.pagecast.timezone)).into())
    }
}

/// Parse a humantime duration field, naming the field on failure.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Validation(format!("{field} '{value}': {e}")))
}

/// Like `parse_duration`, but a loop period must be longer than zero.
pub fn parse_interval(field: &str, value: &str) -> Result<Duration, ConfigError> {
    let interval = parse_duration(field, value)?;
    if interval.is_zero() {
        return Err(ConfigError::Validation(format!("{field} must be greater than zero")));
    }
    Ok(interval)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.pagecast.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.pagecast.version
        ))
        .into());
    }

    config.timezone()?;

    parse_duration("retention", &config.pagecast.retention)?;
    parse_duration("providers.openai.timeout", &config.providers.openai.timeout)?;
    parse_duration("providers.gemini.timeout", &config.providers.gemini.timeout)?;
    parse_duration("graph.timeout", &config.graph.timeout)?;
    parse_interval("scheduler.publish_interval", &config.scheduler.publish_interval)?;
    parse_interval("scheduler.generation_interval", &config.scheduler.generation_interval)?;
    parse_interval("scheduler.metrics_interval", &config.scheduler.metrics_interval)?;
    parse_duration("scheduler.lookahead", &config.scheduler.lookahead)?;
    parse_duration("scheduler.generation_lead", &config.scheduler.generation_lead)?;

    if config.pagecast.max_concurrent_tasks == 0 {
        return Err(ConfigError::Validation("max_concurrent_tasks must be at least 1".to_string()).into());
    }

    config
        .pagecast
        .listen
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::Validation(format!("listen '{}': {}", config.pagecast.listen, e)))?;

    validate_image_size(&config.generation.image_size)
        .map_err(|e| ConfigError::Validation(format!("generation.image_size: {e}")))?;
    if !["png", "jpeg", "webp"].contains(&config.generation.image_format.as_str()) {
        return Err(ConfigError::Validation(format!(
            "generation.image_format '{}' must be one of png, jpeg, webp",
            config.generation.image_format
        ))
        .into());
    }
    if config.generation.fallback_prompt.trim().is_empty() {
        return Err(ConfigError::Validation("generation.fallback_prompt must not be empty".to_string()).into());
    }

    let mut names = HashSet::new();
    let mut defaults = 0;
    for seed in &config.generation_config {
        if !names.insert(&seed.name) {
            return Err(ConfigError::Validation(format!("duplicate generation_config name: '{}'", seed.name)).into());
        }
        if let Some(tag) = &seed.provider {
            tag.parse::<Provider>()
                .map_err(|e| ConfigError::Validation(format!("generation_config '{}': {}", seed.name, e)))?;
        }
        if seed.model.trim().is_empty() {
            return Err(ConfigError::Validation(format!("generation_config '{}': model is empty", seed.name)).into());
        }
        validate_sampling(seed.max_tokens, seed.temperature, seed.max_hashtags)
            .map_err(|e| ConfigError::Validation(format!("generation_config '{}': {}", seed.name, e)))?;
        if seed.is_default {
            defaults += 1;
        }
    }
    if defaults > 1 {
        return Err(ConfigError::Validation("at most one generation_config may set is_default".to_string()).into());
    }

    let mut external_ids = HashSet::new();
    for dest in &config.destination {
        if !external_ids.insert(&dest.external_id) {
            return Err(
                ConfigError::Validation(format!("duplicate destination external_id: '{}'", dest.external_id)).into(),
            );
        }
        if dest.access_token.trim().is_empty() {
            return Err(ConfigError::Validation(format!("destination '{}': access_token is empty", dest.name)).into());
        }
    }

    Ok(())
}

/// Shared bounds for generation configurations, from config seeds or the CLI.
pub fn validate_sampling(max_tokens: i64, temperature: f64, max_hashtags: i64) -> Result<(), String> {
    if max_tokens <= 0 {
        return Err(format!("max_tokens must be positive, got {max_tokens}"));
    }
    if !(0.0..=2.0).contains(&temperature) {
        return Err(format!("temperature {temperature} outside 0.0..=2.0"));
    }
    if max_hashtags < 0 {
        return Err(format!("max_hashtags must not be negative, got {max_hashtags}"));
    }
    Ok(())
}

fn validate_image_size(size: &str) -> Result<(), String> {
    let Some((w, h)) = size.split_once('x') else {
        return Err(format!("invalid size '{size}': expected WIDTHxHEIGHT"));
    };
    for part in [w, h] {
        part.parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("invalid size '{size}': expected WIDTHxHEIGHT"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).expect("config should parse")
    }

    #[test]
    fn empty_config_gets_defaults() {
        let config = parse("");
        assert_eq!(config.pagecast.timezone, "UTC");
        assert_eq!(config.scheduler.lookahead, "2h");
        assert_eq!(config.generation.image_size, "1024x1024");
        assert_eq!(config.graph.base_url, "https://graph.facebook.com/v18.0");
        assert_eq!(config.db_path(), PathBuf::from("./data/pagecast.db"));
        assert_eq!(config.media_root(), PathBuf::from("./data/media"));
        validate_config(&config).unwrap();
    }

    #[test]
    fn seeds_parse_with_defaults() {
        let config = parse(
            r#"
            [[generation_config]]
            name = "fast"
            model = "gpt-4o-mini"
            is_default = true

            [[destination]]
            name = "TechCo"
            external_id = "1234"
            access_token = "tok"
            "#,
        );
        let seed = &config.generation_config[0];
        assert_eq!(seed.max_tokens, 500);
        assert!(seed.include_hashtags);
        assert_eq!(config.destination[0].kind, DestinationKind::Page);
        validate_config(&config).unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            "[pagecast]\ntimezone = \"Mars/Olympus\"",
            "[scheduler]\npublish_interval = \"soon\"",
            "[generation]\nimage_size = \"big\"",
            "[[generation_config]]\nname = \"x\"\nmodel = \"gpt-4\"\ntemperature = 3.5",
            "[[generation_config]]\nname = \"x\"\nmodel = \"gpt-4\"\nprovider = \"acme\"",
            "[[generation_config]]\nname = \"x\"\nmodel = \"a\"\nis_default = true\n\
             [[generation_config]]\nname = \"y\"\nmodel = \"b\"\nis_default = true",
        ];
        for case in cases {
            let config = parse(case);
            assert!(validate_config(&config).is_err(), "expected rejection: {case}");
        }
    }

    #[test]
    fn rejects_zero_intervals() {
        for field in ["publish_interval", "generation_interval", "metrics_interval"] {
            let config = parse(&format!("[scheduler]\n{field} = \"0s\""));
            let err = validate_config(&config).unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{field}: {err}");
        }
        // A zero lead time is fine: generate right at the scheduled time
        validate_config(&parse("[scheduler]\ngeneration_lead = \"0s\"")).unwrap();
    }

    #[test]
    fn explicit_api_key_wins_over_env() {
        let provider = ProviderConfig {
            api_key: Some("from-config".into()),
            ..Default::default()
        };
        assert_eq!(
            provider.resolve_api_key("PAGECAST_TEST_UNSET_KEY").as_deref(),
            Some("from-config")
        );
        assert_eq!(ProviderConfig::default().resolve_api_key("PAGECAST_TEST_UNSET_KEY"), None);
    }
}
