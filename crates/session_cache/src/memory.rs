//! In-process session store for tests and degraded local runs.
//!
//! Honors the hot-buffer cap; TTL eviction is not simulated.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::entry::HotBufferEntry;
use crate::error::Result;
use crate::keys::user_key;
use crate::store::{CacheConfig, SessionStore};

#[derive(Default)]
pub struct MemorySessionCache {
    messages: DashMap<String, Vec<HotBufferEntry>>,
    user_keys: DashMap<String, String>,
    revoked: DashSet<String>,
    config: CacheConfig,
}

impl MemorySessionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            messages: DashMap::new(),
            user_keys: DashMap::new(),
            revoked: DashSet::new(),
            config,
        }
    }

    /// Add a token id to the revocation set (tests).
    pub fn revoke_token(&self, jwt_id: &str) {
        self.revoked.insert(jwt_id.to_string());
    }
}

#[async_trait]
impl SessionStore for MemorySessionCache {
    async fn append_message(&self, conversation_id: &str, entry: &HotBufferEntry) -> Result<()> {
        let mut list = self.messages.entry(conversation_id.to_string()).or_default();
        list.push(entry.clone());
        let overflow = list.len().saturating_sub(self.config.hot_msg_limit);
        if overflow > 0 {
            list.drain(..overflow);
        }
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        n: usize,
    ) -> Result<Vec<HotBufferEntry>> {
        let Some(list) = self.messages.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let start = list.len().saturating_sub(n);
        Ok(list[start..].to_vec())
    }

    async fn get_user_key(&self, subject: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .user_keys
            .get(&user_key(subject, key))
            .map(|v| v.clone()))
    }

    async fn set_user_key(&self, subject: &str, key: &str, value: &str) -> Result<()> {
        self.user_keys.insert(user_key(subject, key), value.to_string());
        Ok(())
    }

    async fn is_token_revoked(&self, jwt_id: &str) -> Result<bool> {
        Ok(self.revoked.contains(jwt_id))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
