//! Relay error types.

use thiserror::Error;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Backbone (Redis / NATS) error.
    #[error("Backbone error: {0}")]
    Backbone(#[from] pubsub_client::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Listener or socket error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Envelope failed to parse or had an invalid payload.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Ingestion endpoint rejected or failed a forwarded message.
    #[error("Ingestion failed: {0}")]
    Ingest(String),
}

/// Why a connection attempt was refused.
///
/// Never sent to the client; the transport is simply closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    /// No user identifier in the connection request.
    #[error("missing user identifier")]
    MissingUserId,

    /// User identifier present but not acceptable.
    #[error("malformed user identifier")]
    MalformedUserId,

    /// No token in the connection request.
    #[error("missing token")]
    MissingToken,

    /// Validator explicitly rejected the token.
    #[error("token rejected")]
    InvalidToken,

    /// Token is valid but authorizes a different identity.
    #[error("token identity does not match claimed user")]
    IdentityMismatch,

    /// Validator could not be reached after all retries.
    #[error("validator unreachable after {attempts} attempts")]
    ValidatorUnreachable { attempts: u32 },
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
