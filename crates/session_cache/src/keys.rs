//! Cache key derivation.

/// Set of revoked `jti` values maintained by the auth service.
pub const REVOKED_TOKENS_KEY: &str = "auth:revoked";

/// Ordered per-conversation message list: `conv:<conversation_id>:messages`.
pub fn conversation_messages_key(conversation_id: &str) -> String {
    format!("conv:{}:messages", conversation_id)
}

/// Per-user preference slot: `user:<key>:<subject>`.
pub fn user_key(subject: &str, key: &str) -> String {
    format!("user:{}:{}", key, subject)
}
