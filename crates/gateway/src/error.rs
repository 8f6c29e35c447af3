//! Gateway error taxonomy.
//!
//! Every component returns errors to its caller; nothing crosses a
//! component boundary as a panic. Cache and raw-memory mirror failures are
//! downgraded to warnings inside the dispatcher and never surface here.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Token missing, malformed, expired, or revoked.
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] auth::AuthError),

    /// An active stream already exists for this (owner, conversation).
    #[error("conflict")]
    Conflict,

    /// The bus rejected the request publish; the client should retry.
    #[error("unavailable")]
    Unavailable(#[source] bus_client::BusError),

    /// A ticket timer fired.
    #[error("timeout")]
    Timeout,

    /// Malformed client input; the connection stays open.
    #[error("{0}")]
    BadRequest(String),

    /// Anything unhandled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Short code used in client-facing `{"error": ...}` frames.
    pub fn client_code(&self) -> String {
        match self {
            GatewayError::Unauthenticated(_) => "unauthenticated".to_string(),
            GatewayError::Conflict => "conflict".to_string(),
            GatewayError::Unavailable(_) => "unavailable".to_string(),
            GatewayError::Timeout => "timeout".to_string(),
            GatewayError::BadRequest(reason) => reason.clone(),
            GatewayError::Internal(_) => "internal error".to_string(),
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
