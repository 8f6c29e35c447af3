//! Redis-backed session cache.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::entry::HotBufferEntry;
use crate::error::Result;
use crate::keys::{conversation_messages_key, user_key, REVOKED_TOKENS_KEY};
use crate::store::{CacheConfig, SessionStore};

/// Session cache over a Redis instance.
///
/// Connections are multiplexed; each operation grabs the shared async
/// connection on demand, matching how the rest of the services use Redis.
#[derive(Clone)]
pub struct RedisSessionCache {
    client: redis::Client,
    config: CacheConfig,
}

impl RedisSessionCache {
    /// Create a new cache handle. Does not dial until first use.
    pub fn new(redis_url: &str, config: CacheConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, config })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl SessionStore for RedisSessionCache {
    async fn append_message(&self, conversation_id: &str, entry: &HotBufferEntry) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let key = conversation_messages_key(conversation_id);
        let payload = serde_json::to_string(entry)?;

        // LPUSH, cap the list, refresh the TTL in one round trip.
        let _: () = redis::pipe()
            .lpush(&key, payload)
            .ltrim(&key, 0, self.config.hot_msg_limit as isize - 1)
            .expire(&key, self.config.hot_ttl.as_secs() as i64)
            .query_async(&mut conn)
            .await?;

        debug!("appended {:?} entry to {}", entry.role, key);
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        n: usize,
    ) -> Result<Vec<HotBufferEntry>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let key = conversation_messages_key(conversation_id);

        // Newest entries sit at the head; reverse to insertion order.
        let raw: Vec<String> = conn.lrange(&key, 0, n as isize - 1).await?;
        let mut entries = raw
            .iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect::<Result<Vec<HotBufferEntry>>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn get_user_key(&self, subject: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(user_key(subject, key)).await?;
        Ok(value)
    }

    async fn set_user_key(&self, subject: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.set(user_key(subject, key), value).await?;
        Ok(())
    }

    async fn is_token_revoked(&self, jwt_id: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let revoked: bool = conn.sismember(REVOKED_TOKENS_KEY, jwt_id).await?;
        Ok(revoked)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
