use std::path::PathBuf;

use crate::types::Capability;

/// Errors surfaced to callers of the gateway. Every variant maps to one
/// HTTP status through [`GatewayError::status_code`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request expired or device clock is wrong")]
    RequestExpired,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Invalid client, operation refused")]
    ClientUnauthorized,

    #[error("Not logged in, operation refused")]
    Unauthenticated,

    /// `key` names what is missing. It is logged, never sent to the client.
    #[error("Server misconfigured: {key}")]
    ServerMisconfigured { key: String },

    #[error("Daily {} call limit reached ({limit} calls)", .capability.label())]
    QuotaExceeded { capability: Capability, limit: i64 },

    #[error("Unsupported service provider: {0}")]
    UnsupportedProvider(String),

    #[error("Request to {provider} failed")]
    UpstreamUnavailable { provider: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn misconfigured(key: impl Into<String>) -> Self {
        let key = key.into();
        tracing::error!("Server misconfigured: {} is not set", key);
        GatewayError::ServerMisconfigured { key }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::UnsupportedProvider(_) => 400,
            GatewayError::Unauthenticated => 401,
            GatewayError::SignatureInvalid | GatewayError::ClientUnauthorized => 403,
            GatewayError::RequestExpired => 408,
            GatewayError::QuotaExceeded { .. } => 429,
            GatewayError::ServerMisconfigured { .. } | GatewayError::Store(_) => 500,
            GatewayError::UpstreamUnavailable { .. } => 502,
        }
    }

    /// Message safe to show to the client.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::ServerMisconfigured { .. } => {
                "Server configuration error, please contact the administrator".to_string()
            }
            GatewayError::Store(_) => "Internal server error, please try again later".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),
}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        GatewayError::misconfigured(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Principal not found: {0}")]
    PrincipalNotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Timeout after {0} seconds")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
