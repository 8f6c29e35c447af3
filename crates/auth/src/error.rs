//! Auth verification errors.

use thiserror::Error;

/// Errors that can occur during token verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid authorization header")]
    InvalidHeader,

    #[error("token expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("unsupported token algorithm")]
    WrongAlgorithm,

    #[error("not an access token")]
    WrongTokenType,

    #[error("token revoked")]
    Revoked,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("invalid verifier configuration: {0}")]
    Config(String),
}
