//! Error types for signal-watch.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the gateway connection and the channel REST client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid credentials. Fatal: the connection manager stops retrying.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Session invalidated (resumable: {resumable})")]
    InvalidSession { resumable: bool },

    #[error("No heartbeat acknowledgement within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    /// REST call failed or returned an error status.
    #[error("HTTP error: {0}")]
    Http(String),
}

impl GatewayError {
    /// Whether the connection manager must stop instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }
}

/// Classification service errors.
///
/// These never escape the classifier's public calls; they are folded into
/// the default "unclassified" result with the message preserved.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Empty response")]
    EmptyResponse,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("API configuration error: {0}")]
    Misconfigured(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Message {0} not found")]
    MessageNotFound(String),

    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),

    #[error("Step tracking failed: {0}")]
    Tracking(String),

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
