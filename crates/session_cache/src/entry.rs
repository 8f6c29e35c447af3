//! Hot-buffer entry model.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a buffered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A recent message cached for downstream consumers (memory worker, history
/// reads). Stored as JSON in the per-conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotBufferEntry {
    /// Fresh identifier for this entry.
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
}

impl HotBufferEntry {
    pub fn new(conversation_id: &str, role: MessageRole, text: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            text: text.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let entry = HotBufferEntry::new("r1", MessageRole::Assistant, "hello");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""role":"assistant""#));

        let parsed: HotBufferEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.role, MessageRole::Assistant);
        assert_eq!(parsed.conversation_id, "r1");
        assert_eq!(parsed.text, "hello");
    }
}
