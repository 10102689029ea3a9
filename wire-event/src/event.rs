//! Typed wire events: `type` + `payload` pairs for both directions.
//!
//! Payload key casing follows the protocol: `system.*`/`control.*`/`data.*`
//! payloads are camelCase, `event.*` payloads are snake_case.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close reasons form a closed set; unknown strings map to `IdleTimeout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    UserLogout,
    SessionExpired,
    ServerShutdown,
    ConversationComplete,
    IdleTimeout,
}

impl CloseReason {
    /// Maps an external reason string to the closed set; unknown falls back to `IdleTimeout`.
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "user_logout" => Self::UserLogout,
            "session_expired" => Self::SessionExpired,
            "server_shutdown" => Self::ServerShutdown,
            "conversation_complete" => Self::ConversationComplete,
            _ => Self::IdleTimeout,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Client,
    Server,
}

/// Server-to-client wire event: serialized as `{"type": ..., "payload": ...}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "system.connection.established", rename_all = "camelCase")]
    ConnectionEstablished {
        connection_id: String,
        conversation_id: String,
        user_id: String,
        server_capabilities: Vec<String>,
        current_model: String,
        available_models: Vec<String>,
        allow_model_selection: bool,
        tool_count: usize,
    },
    #[serde(rename = "system.ping")]
    Ping { timestamp: i64 },
    #[serde(rename = "system.connection.close")]
    ConnectionClose { reason: CloseReason, code: u16 },
    #[serde(rename = "system.error", rename_all = "camelCase")]
    Error {
        category: ErrorCategory,
        code: String,
        message: String,
        is_retryable: bool,
    },
    #[serde(rename = "control.chatInput.enabled")]
    ChatInputEnabled { enabled: bool },
    #[serde(rename = "data.content.chunk", rename_all = "camelCase")]
    ContentChunk {
        content: String,
        message_id: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    #[serde(rename = "data.content.complete", rename_all = "camelCase")]
    ContentComplete {
        message_id: String,
        role: String,
        full_content: String,
    },
    #[serde(rename = "event.assistant_thinking")]
    AssistantThinking {},
    #[serde(rename = "event.tool_executing")]
    ToolExecuting { call_id: String, tool_name: String },
    #[serde(rename = "event.tool_result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        execution_time_ms: u64,
    },
    #[serde(rename = "event.message_complete")]
    MessageComplete {
        message_id: String,
        role: String,
        content: String,
    },
    #[serde(rename = "control.item_context", rename_all = "camelCase")]
    ItemContext {
        item_index: usize,
        total: usize,
        title: String,
        enable_chat_input: bool,
    },
    #[serde(rename = "control.expiration_warning", rename_all = "camelCase")]
    ExpirationWarning { item_id: String, message: String },
    #[serde(rename = "data.widget.show", rename_all = "camelCase")]
    WidgetShow {
        item_id: String,
        #[serde(rename = "widget_type")]
        widget_type: String,
        props: Value,
    },
}

impl ServerEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// The wire `type` string for this event.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "system.connection.established",
            Self::Ping { .. } => "system.ping",
            Self::ConnectionClose { .. } => "system.connection.close",
            Self::Error { .. } => "system.error",
            Self::ChatInputEnabled { .. } => "control.chatInput.enabled",
            Self::ContentChunk { .. } => "data.content.chunk",
            Self::ContentComplete { .. } => "data.content.complete",
            Self::AssistantThinking {} => "event.assistant_thinking",
            Self::ToolExecuting { .. } => "event.tool_executing",
            Self::ToolResult { .. } => "event.tool_result",
            Self::MessageComplete { .. } => "event.message_complete",
            Self::ItemContext { .. } => "control.item_context",
            Self::ExpirationWarning { .. } => "control.expiration_warning",
            Self::WidgetShow { .. } => "data.widget.show",
        }
    }
}

/// Client-to-server wire event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "system.pong")]
    Pong { timestamp: i64 },
    #[serde(rename = "client.message")]
    Message { content: String },
    #[serde(rename = "client.widget.response", rename_all = "camelCase")]
    WidgetResponse {
        widget_id: String,
        #[serde(default)]
        item_id: Option<String>,
        value: Value,
    },
    #[serde(rename = "client.flow.start")]
    FlowStart {},
    #[serde(rename = "client.flow.pause")]
    FlowPause {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "client.flow.cancel", rename_all = "camelCase")]
    FlowCancel {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename = "client.model.change", rename_all = "camelCase")]
    ModelChange { model_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_type_strings_match_protocol() {
        let v = ServerEvent::AssistantThinking {}.to_value().unwrap();
        assert_eq!(v["type"], "event.assistant_thinking");

        let v = ServerEvent::ContentChunk {
            content: "hi".into(),
            message_id: "m1".into(),
            is_final: false,
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "data.content.chunk");
        assert_eq!(v["payload"]["messageId"], "m1");
        assert_eq!(v["payload"]["final"], false);
    }

    #[test]
    fn established_payload_uses_camel_case() {
        let v = ServerEvent::ConnectionEstablished {
            connection_id: "c1".into(),
            conversation_id: "conv1".into(),
            user_id: "u1".into(),
            server_capabilities: vec!["streaming".into()],
            current_model: "llama3.2:3b".into(),
            available_models: vec![],
            allow_model_selection: false,
            tool_count: 2,
        }
        .to_value()
        .unwrap();
        assert_eq!(v["payload"]["connectionId"], "c1");
        assert_eq!(v["payload"]["toolCount"], 2);
        assert_eq!(v["payload"]["allowModelSelection"], false);
    }

    #[test]
    fn tool_result_payload_stays_snake_case() {
        let v = ServerEvent::ToolResult {
            call_id: "c1".into(),
            tool_name: "math:add".into(),
            success: true,
            result: Some(serde_json::json!({"sum": 5})),
            error: None,
            execution_time_ms: 12,
        }
        .to_value()
        .unwrap();
        assert_eq!(v["payload"]["call_id"], "c1");
        assert_eq!(v["payload"]["execution_time_ms"], 12);
        assert!(v["payload"].get("error").is_none());
    }

    #[test]
    fn client_message_round_trips() {
        let text = r#"{"type":"client.message","payload":{"content":"Hello"}}"#;
        let ev: ClientEvent = serde_json::from_str(text).unwrap();
        match ev {
            ClientEvent::Message { ref content } => assert_eq!(content, "Hello"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn widget_response_accepts_missing_item_id() {
        let text = r#"{"type":"client.widget.response","payload":{"widgetId":"w1","value":2}}"#;
        let ev: ClientEvent = serde_json::from_str(text).unwrap();
        match ev {
            ClientEvent::WidgetResponse {
                widget_id, item_id, ..
            } => {
                assert_eq!(widget_id, "w1");
                assert!(item_id.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_close_reason_maps_to_idle_timeout() {
        assert_eq!(CloseReason::from_reason("user_logout"), CloseReason::UserLogout);
        assert_eq!(CloseReason::from_reason("meteor_strike"), CloseReason::IdleTimeout);
    }
}
