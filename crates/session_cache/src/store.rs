//! The `SessionStore` trait and shared configuration.

use std::time::Duration;

use async_trait::async_trait;

use crate::entry::HotBufferEntry;
use crate::error::Result;

/// Hot-buffer sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries kept per conversation; older entries are trimmed.
    pub hot_msg_limit: usize,
    /// Time-to-live for a conversation's buffer, refreshed on every append.
    pub hot_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_msg_limit: 200,
            hot_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Short-lived key/value store for hot message buffers and user preferences.
///
/// Individual operations are atomic; no multi-operation transactions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append an entry to the conversation's ordered buffer, trim to the
    /// configured cap, and refresh the TTL.
    async fn append_message(&self, conversation_id: &str, entry: &HotBufferEntry) -> Result<()>;

    /// Up to the last `n` entries in insertion order.
    async fn recent_messages(&self, conversation_id: &str, n: usize)
        -> Result<Vec<HotBufferEntry>>;

    /// Read a per-user preference value.
    async fn get_user_key(&self, subject: &str, key: &str) -> Result<Option<String>>;

    /// Write a per-user preference value.
    async fn set_user_key(&self, subject: &str, key: &str, value: &str) -> Result<()>;

    /// Whether a token id appears in the revocation set.
    async fn is_token_revoked(&self, jwt_id: &str) -> Result<bool>;

    /// Liveness probe, used by strict startup.
    async fn ping(&self) -> Result<()>;
}
