//! Wire types: client frames, worker chunks, and bus envelopes.
//!
//! Envelopes carry their optional fields explicitly and are parsed once at
//! the edge; nothing downstream re-inspects raw payloads.

use serde::{Deserialize, Serialize};

/// Header carrying the per-ticket reply subject on request publishes.
pub const REPLY_HEADER: &str = "Reply";
/// Header carrying the per-ticket ack subject (reserved, no behavior).
pub const ACK_HEADER: &str = "Ack";
/// Worker-set header marking an error envelope.
pub const ERROR_HEADER: &str = "Error";

/// Reserved client control frame. Accepted and ignored; never emitted.
pub const ACK_FRAME: &str = "+ACK";

/// Inbound chat frame. Field names keep the browser client's aliases
/// (`room_id`, `msg`, `model`).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundChatFrame {
    #[serde(rename = "room_id")]
    pub conversation_id: String,
    #[serde(rename = "msg")]
    pub text: String,
    #[serde(rename = "model", default)]
    pub model_id: Option<String>,
}

/// A chat submission headed for admission.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub text: String,
    pub model_id: Option<String>,
    /// Admission assigns the authenticated subject when unset.
    pub owner: Option<String>,
}

impl From<InboundChatFrame> for ChatRequest {
    fn from(frame: InboundChatFrame) -> Self {
        Self {
            conversation_id: frame.conversation_id,
            text: frame.text,
            model_id: frame.model_id,
            owner: None,
        }
    }
}

/// Envelope published to the request subject and mirrored to the raw-memory
/// stream at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub conversation_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub owner: String,
    pub ticket_id: String,
}

/// Streamed chunk payload: what workers publish on the reply subject and
/// what clients receive as a text frame, with `id` stamped to the ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkFrame {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    /// `null` mid-stream, `"stop"` on the final chunk.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChunkFrame {
    /// True when this chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.error.is_some()
            || self.done == Some(true)
            || self.choices.iter().any(|c| c.finish_reason.is_some())
    }

    /// Concatenated delta text carried by this chunk.
    pub fn delta_text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|c| c.delta.content.as_deref())
            .collect()
    }

    /// Terminal error chunk (timeouts, worker failures).
    pub fn terminal_error(reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            done: Some(true),
            ..Self::default()
        }
    }
}

/// A relayed chunk with its per-ticket sequence position. Sequence numbers
/// are monotonic from 0 and follow bus arrival order.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub ticket_id: String,
    pub sequence: u64,
    pub terminal: bool,
    pub frame: ChunkFrame,
}

/// Completed request/response pair published to the durable raw-memory
/// stream for the memory worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMemoryRecord {
    pub conversation_id: String,
    pub owner: String,
    pub request_text: String,
    pub response_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub requested_at_ms: i64,
    pub completed_at_ms: i64,
}

/// Outbound `{"error": ...}` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}
