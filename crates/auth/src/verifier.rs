//! Token verification.

use std::str::FromStr;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::warn;

use crate::claims::{AccessClaims, Identity, ACCESS_TOKEN_TYPE};
use crate::error::AuthError;

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub identity: Identity,
    /// Token id for the revocation check, when the token carries one.
    pub jwt_id: Option<String>,
}

/// Validates signed tokens against a shared secret. CPU-only; safe to call
/// on any task without suspending.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Build a verifier for the given secret and algorithm name ("HS256",
    /// "HS384", "HS512").
    pub fn new(secret: &str, algorithm: &str) -> Result<Self, AuthError> {
        let algorithm = Algorithm::from_str(algorithm)
            .map_err(|_| AuthError::Config(format!("unknown algorithm {}", algorithm)))?;
        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
        })
    }

    /// Verify signature, expiry, and token type; extract the identity.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let validation = Validation::new(self.algorithm);

        let data = decode::<AccessClaims>(token, &self.decoding_key, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => AuthError::WrongAlgorithm,
                _ => {
                    warn!("token validation failed: {}", e);
                    AuthError::Malformed(e.to_string())
                }
            },
        )?;

        let claims = data.claims;
        if claims.token_type.as_deref() != Some(ACCESS_TOKEN_TYPE) {
            return Err(AuthError::WrongTokenType);
        }

        Ok(VerifiedToken {
            identity: Identity {
                subject: claims.sub,
                issued_at: claims.iat,
            },
            jwt_id: claims.jti,
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidHeader)?;
    if token.is_empty() || parts.next().is_some() {
        return Err(AuthError::InvalidHeader);
    }

    Ok(token)
}
