//! Bearer-token verification for the chat gateway.
//!
//! The gateway only *verifies* tokens; issuance lives in a separate auth
//! service. Verification is CPU-only — the revocation-set lookup happens at
//! the edge through the session cache, keyed by the `jti` this crate
//! extracts.

pub mod claims;
pub mod error;
pub mod verifier;

pub use claims::{AccessClaims, Identity, ACCESS_TOKEN_TYPE};
pub use error::AuthError;
pub use verifier::{bearer_token, TokenVerifier, VerifiedToken};
