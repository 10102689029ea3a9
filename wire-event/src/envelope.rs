//! Framing: every wire message carries `type`, `payload`, optional `conversationId`,
//! `id`, and `timestamp`. The event supplies type + payload; the envelope adds the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::ServerEvent;

/// One framed wire message ready for serialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(
        rename = "conversationId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub conversation_id: Option<String>,
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            conversation_id: None,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_type_payload_and_envelope_fields() {
        let msg = WireMessage::new(ServerEvent::Ping { timestamp: 42 })
            .with_conversation_id("conv-1");
        let v = msg.to_value().unwrap();
        assert_eq!(v["type"], "system.ping");
        assert_eq!(v["payload"]["timestamp"], 42);
        assert_eq!(v["conversationId"], "conv-1");
        assert!(v["id"].is_string());
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn conversation_id_omitted_when_absent() {
        let v = WireMessage::new(ServerEvent::AssistantThinking {})
            .to_value()
            .unwrap();
        assert!(v.get("conversationId").is_none());
    }
}
