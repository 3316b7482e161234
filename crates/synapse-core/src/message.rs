//! Conversation messages and the append-only session history.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ContextPatch;
use crate::ids::{message_id, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    Error,
}

/// A single conversation entry. Never mutated once it is in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    #[serde(default = "message_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default = "now_ms")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl SessionMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: message_id(),
            kind,
            content: content.into(),
            timestamp: now_ms(),
            context: None,
            metadata: None,
        }
    }

    pub fn with_context(mut self, context: ContextPatch) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        if !metadata.is_empty() {
            self.metadata = Some(metadata);
        }
        self
    }
}

/// Ordered, append-only record of processed messages.
///
/// `clear` is the only operation that shrinks it.
#[derive(Debug, Default, Clone)]
pub struct MessageHistory {
    messages: Vec<SessionMessage>,
}

impl MessageHistory {
    pub fn push(&mut self, message: SessionMessage) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn to_vec(&self) -> Vec<SessionMessage> {
        self.messages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_message_defaults() {
        let msg: SessionMessage =
            serde_json::from_str(r#"{"type":"assistant","content":"Bonjour"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Assistant);
        assert!(msg.id.starts_with("msg_"));
        assert!(msg.timestamp > 0);
        assert!(msg.metadata.is_none());
    }

    #[test]
    fn test_message_serializes_type_field() {
        let msg = SessionMessage::new(MessageKind::User, "hello")
            .with_context(ContextPatch::company_name("Acme"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["content"], "hello");
        assert_eq!(json["context"]["companyName"], "Acme");
    }

    #[test]
    fn test_history_only_shrinks_on_clear() {
        let mut history = MessageHistory::default();
        history.push(SessionMessage::new(MessageKind::User, "a"));
        history.push(SessionMessage::new(MessageKind::Assistant, "b"));
        assert_eq!(history.len(), 2);
        assert_eq!(history.to_vec()[1].content, "b");
        history.clear();
        assert!(history.is_empty());
    }
}
