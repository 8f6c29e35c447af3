//! Shared helpers for the gateway integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use auth::Identity;
use bus_client::MemoryBus;
use bytes::Bytes;
use gateway::protocol::RawMemoryRecord;
use gateway::{ChatRequest, Chunk, ChunkSink};

/// Sink that records every delivered chunk and can simulate a closed client.
pub struct RecordingSink {
    chunks: Mutex<Vec<Chunk>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkSink for RecordingSink {
    async fn deliver(&self, chunk: &Chunk) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.chunks.lock().unwrap().push(chunk.clone());
        true
    }
}

pub fn identity(subject: &str) -> Identity {
    Identity {
        subject: subject.to_string(),
        issued_at: None,
    }
}

pub fn request(conversation_id: &str, text: &str) -> ChatRequest {
    ChatRequest {
        conversation_id: conversation_id.to_string(),
        text: text.to_string(),
        model_id: None,
        owner: None,
    }
}

/// Worker chunk payload in the streaming wire shape.
pub fn chunk_payload(content: &str, stop: bool) -> Bytes {
    let finish = if stop { r#""stop""# } else { "null" };
    Bytes::from(format!(
        r#"{{"choices":[{{"delta":{{"content":"{}"}},"finish_reason":{}}}]}}"#,
        content, finish
    ))
}

/// Completed records captured on the raw-memory stream (the request-envelope
/// mirror uses a different shape and is filtered out).
pub fn raw_records(bus: &MemoryBus) -> Vec<RawMemoryRecord> {
    bus.stream_messages("memory.raw")
        .iter()
        .filter_map(|msg| serde_json::from_slice(&msg.payload).ok())
        .collect()
}

/// Signed access token for edge tests.
pub fn access_token(secret: &str, sub: &str, expires_in: i64) -> String {
    #[derive(serde::Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        exp: i64,
        iat: i64,
        #[serde(rename = "type")]
        token_type: &'a str,
        jti: &'a str,
    }

    let now = chrono::Utc::now().timestamp();
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims {
            sub,
            exp: now + expires_in,
            iat: now,
            token_type: "access",
            jti: "test-jti",
        },
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
