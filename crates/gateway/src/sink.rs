//! Chunk sinks: where relayed chunks go.

use async_trait::async_trait;
use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::Chunk;

/// Capability handed to the dispatcher for delivering chunks to a client.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Deliver one chunk. Returns false once the receiver is gone, which the
    /// dispatcher treats as a client disconnect.
    async fn deliver(&self, chunk: &Chunk) -> bool;
}

/// Writes chunks as JSON text frames through the per-socket writer channel,
/// keeping socket writes serialized.
pub struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl WsSink {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChunkSink for WsSink {
    async fn deliver(&self, chunk: &Chunk) -> bool {
        let json = match serde_json::to_string(&chunk.frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(ticket = %chunk.ticket_id, "chunk serialization failed: {}", e);
                return true;
            }
        };
        self.tx.send(Message::Text(json.into())).is_ok()
    }
}

/// Discards chunks. Used by the HTTP enqueue surface, where the relay is
/// fire-and-forget and only the hot-buffer / raw-memory side effects matter.
pub struct NullSink;

#[async_trait]
impl ChunkSink for NullSink {
    async fn deliver(&self, _chunk: &Chunk) -> bool {
        true
    }
}
