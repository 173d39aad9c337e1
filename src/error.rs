use std::fmt;

use thiserror::Error;

use crate::models::Provider;

/// Longest vendor message kept on a `ProviderError`.
const MAX_PROVIDER_MESSAGE: usize = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Classification of a failed vendor call.
///
/// Quota is kept apart from the rest so the fallback chain can log it
/// distinctly; for control flow every kind means "try the next config".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Auth,
    Quota,
    MalformedResponse,
    Network,
    Server,
    InvalidRequest,
    NotConfigured,
    Io,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "authentication failed",
            Self::Quota => "quota exceeded",
            Self::MalformedResponse => "malformed response",
            Self::Network => "network error",
            Self::Server => "server error",
            Self::InvalidRequest => "invalid request",
            Self::NotConfigured => "not configured",
            Self::Io => "i/o error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{provider} {kind}: {message}")]
pub struct ProviderError {
    pub provider: Provider,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: Provider, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: truncate(&message.into(), MAX_PROVIDER_MESSAGE),
        }
    }

    /// Map a non-success HTTP response onto the taxonomy.
    pub fn from_status(provider: Provider, status: u16, body: &str) -> Self {
        let lower = body.to_lowercase();
        let kind = if status == 429 || lower.contains("insufficient_quota") || lower.contains("resource_exhausted") {
            ProviderErrorKind::Quota
        } else if status == 401 || status == 403 {
            ProviderErrorKind::Auth
        } else if status >= 500 {
            ProviderErrorKind::Server
        } else {
            ProviderErrorKind::InvalidRequest
        };
        Self::new(provider, kind, format!("HTTP {status}: {body}"))
    }

    pub fn from_reqwest(provider: Provider, err: reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            ProviderErrorKind::MalformedResponse
        } else {
            ProviderErrorKind::Network
        };
        Self::new(provider, kind, err.to_string())
    }

    pub fn malformed(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::MalformedResponse, message)
    }

    pub fn is_quota(&self) -> bool {
        self.kind == ProviderErrorKind::Quota
    }
}

/// The generation stage a fallback chain was running for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Text,
    ImagePrompt,
    Image,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::ImagePrompt => "image prompt",
            Self::Image => "image",
        })
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("all {attempts} configurations failed for {stage}; last error: {last_error}")]
    Exhausted {
        stage: Stage,
        attempts: usize,
        last_error: ProviderError,
    },
    #[error("no usable generation configuration for {stage}")]
    NoUsableConfig { stage: Stage },
    #[error("{stage} input is empty")]
    EmptyInput { stage: Stage },
    #[error("loading generation configurations: {0}")]
    Registry(String),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no permission: {0}")]
    NoPermission(String),
    #[error("Graph API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("image not readable at {path}: {source}")]
    Image { path: String, source: std::io::Error },
    #[error("response did not contain a post id")]
    MissingPostId,
}

/// Why a single destination in a batch did not receive the post.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination '{0}' is inactive")]
    Inactive(String),
    #[error("destination '{0}' has no publish permission")]
    CannotPublish(String),
    #[error("destination '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl DestinationError {
    /// Short machine-readable reason stored on the outcome row.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inactive(_) | Self::CannotPublish(_) | Self::NotFound(_) => "capability",
            Self::Graph(GraphError::NoPermission(_)) => "no_permission",
            Self::Graph(GraphError::Image { .. }) => "media",
            Self::Graph(GraphError::Http(_)) => "network",
            Self::Graph(_) => "api",
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("failed to register task: {0}")]
    Store(String),
    #[error("task queue is shutting down")]
    Closed,
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_detected_from_status_and_body() {
        assert!(ProviderError::from_status(Provider::OpenAi, 429, "slow down").is_quota());
        assert!(
            ProviderError::from_status(Provider::OpenAi, 400, r#"{"error":{"code":"insufficient_quota"}}"#).is_quota()
        );
        assert!(ProviderError::from_status(Provider::Gemini, 400, "RESOURCE_EXHAUSTED").is_quota());
        let auth = ProviderError::from_status(Provider::Gemini, 401, "bad key");
        assert_eq!(auth.kind, ProviderErrorKind::Auth);
        assert!(!auth.is_quota());
    }

    #[test]
    fn long_messages_are_truncated() {
        let err = ProviderError::new(Provider::OpenAi, ProviderErrorKind::Server, "x".repeat(1000));
        assert_eq!(err.message.chars().count(), MAX_PROVIDER_MESSAGE + 1);
    }

    #[test]
    fn destination_error_kinds() {
        assert_eq!(DestinationError::CannotPublish("p".into()).kind(), "capability");
        assert_eq!(
            DestinationError::Graph(GraphError::NoPermission("403".into())).kind(),
            "no_permission"
        );
        assert_eq!(
            DestinationError::Graph(GraphError::Api {
                status: 400,
                message: "bad".into()
            })
            .kind(),
            "api"
        );
    }
}
