//! Token claims and the verified identity they yield.

use serde::{Deserialize, Serialize};

/// The only token type accepted on chat surfaces.
pub const ACCESS_TOKEN_TYPE: &str = "access";

/// Claims carried by gateway tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user id).
    pub sub: String,

    /// Expiration time (Unix seconds).
    pub exp: i64,

    /// Issued at (Unix seconds).
    #[serde(default)]
    pub iat: Option<i64>,

    /// Token type: "access" or "refresh".
    #[serde(rename = "type", default)]
    pub token_type: Option<String>,

    /// Token id, checked against the revocation set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// The verified subject of a token. Scoped to a single request or a single
/// WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    /// Unix seconds the token was issued at, when present.
    pub issued_at: Option<i64>,
}
