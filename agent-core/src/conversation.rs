//! Event-sourced conversation aggregate: message log plus status, folded from an
//! append-only stream named `conversation-{id}`.
//!
//! Commands guard invariants, register events, and apply them immediately; the
//! same `apply` runs on load, so replaying a stream always reproduces the state
//! the commands produced.

use chrono::{DateTime, Utc};
use eventstore::{Aggregate, AggregateRoot, EventStore, EventStoreError, Mediator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::{ChatMessage, ChatRole, ToolCall};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Completed,
    Failed,
}

impl MessageStatus {
    /// Status transitions are monotone: pending may move to completed or failed;
    /// completed and failed are terminal.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (
                MessageStatus::Pending,
                MessageStatus::Completed | MessageStatus::Failed
            )
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredToolResult {
    pub call_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub tool_calls: Vec<StoredToolCall>,
    pub tool_results: Vec<StoredToolResult>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Progress through a proactive template, persisted so a reconnect resumes
/// where the flow left off.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TemplateProgress {
    pub item_index: usize,
    /// widget_id -> submitted value.
    pub answers: std::collections::BTreeMap<String, Value>,
    pub completed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationEvent {
    ConversationCreated {
        user_id: String,
        system_prompt: String,
        created_at: DateTime<Utc>,
    },
    MessageAdded {
        message_id: String,
        role: ChatRole,
        content: String,
        status: MessageStatus,
        created_at: DateTime<Utc>,
    },
    ToolCallAdded {
        message_id: String,
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResultAdded {
        message_id: String,
        call_id: String,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
        execution_time_ms: u64,
    },
    MessageStatusUpdated {
        message_id: String,
        status: MessageStatus,
    },
    MessagesCleared {
        keep_system: bool,
    },
    TemplateProgressUpdated {
        progress: TemplateProgress,
    },
    ConversationDeleted {
        deleted_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    pub user_id: String,
    pub system_prompt: String,
    pub messages: Vec<StoredMessage>,
    pub status: Option<ConversationStatus>,
    pub template_progress: Option<TemplateProgress>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Aggregate for ConversationState {
    type Event = ConversationEvent;

    fn aggregate_type() -> &'static str {
        "conversation"
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ConversationEvent::ConversationCreated {
                user_id,
                system_prompt,
                created_at,
            } => {
                self.user_id = user_id.clone();
                self.system_prompt = system_prompt.clone();
                self.status = Some(ConversationStatus::Active);
                self.created_at = Some(*created_at);
                self.updated_at = Some(*created_at);
                self.messages.push(StoredMessage {
                    id: "msg-system".to_string(),
                    role: ChatRole::System,
                    content: system_prompt.clone(),
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                    status: MessageStatus::Completed,
                    created_at: *created_at,
                });
            }
            ConversationEvent::MessageAdded {
                message_id,
                role,
                content,
                status,
                created_at,
            } => {
                self.messages.push(StoredMessage {
                    id: message_id.clone(),
                    role: *role,
                    content: content.clone(),
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                    status: *status,
                    created_at: *created_at,
                });
                self.updated_at = Some(*created_at);
            }
            ConversationEvent::ToolCallAdded {
                message_id,
                call_id,
                name,
                arguments,
            } => {
                if let Some(msg) = self.messages.iter_mut().find(|m| &m.id == message_id) {
                    msg.tool_calls.push(StoredToolCall {
                        call_id: call_id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    });
                }
            }
            ConversationEvent::ToolResultAdded {
                message_id,
                call_id,
                success,
                result,
                error,
                execution_time_ms,
            } => {
                if let Some(msg) = self.messages.iter_mut().find(|m| &m.id == message_id) {
                    msg.tool_results.push(StoredToolResult {
                        call_id: call_id.clone(),
                        success: *success,
                        result: result.clone(),
                        error: error.clone(),
                        execution_time_ms: *execution_time_ms,
                    });
                }
            }
            ConversationEvent::MessageStatusUpdated { message_id, status } => {
                if let Some(msg) = self.messages.iter_mut().find(|m| &m.id == message_id) {
                    msg.status = *status;
                }
            }
            ConversationEvent::MessagesCleared { keep_system } => {
                if *keep_system && !self.messages.is_empty() {
                    self.messages.truncate(1);
                } else {
                    self.messages.clear();
                }
            }
            ConversationEvent::TemplateProgressUpdated { progress } => {
                self.template_progress = Some(progress.clone());
            }
            ConversationEvent::ConversationDeleted { deleted_at } => {
                self.status = Some(ConversationStatus::Deleted);
                self.updated_at = Some(*deleted_at);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation is not active")]
    NotActive,
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("message {0} is not an assistant message")]
    NotAssistantMessage(String),
    #[error("duplicate call_id {call_id} on message {message_id}")]
    DuplicateCallId { message_id: String, call_id: String },
    #[error("no tool call {call_id} on message {message_id}")]
    CallNotFound { message_id: String, call_id: String },
    #[error("tool call {0} already has a result")]
    ResultAlreadyRecorded(String),
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidStatusTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// The conversation aggregate root: commands, guards, commit.
pub struct Conversation {
    root: AggregateRoot<ConversationState>,
}

impl Conversation {
    /// Creates a new conversation and registers `ConversationCreated`.
    pub fn create(
        id: impl Into<String>,
        user_id: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let mut root = AggregateRoot::new(id);
        root.register(ConversationEvent::ConversationCreated {
            user_id: user_id.into(),
            system_prompt: system_prompt.into(),
            created_at: Utc::now(),
        });
        Self { root }
    }

    pub async fn load(
        store: &dyn EventStore,
        id: &str,
    ) -> Result<Option<Self>, ConversationError> {
        Ok(AggregateRoot::load(store, id).await?.map(|root| Self { root }))
    }

    pub async fn commit(
        &mut self,
        store: &dyn EventStore,
        mediator: Option<&Mediator>,
    ) -> Result<(), ConversationError> {
        self.root.commit(store, mediator).await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.root.id
    }

    pub fn state(&self) -> &ConversationState {
        &self.root.state
    }

    pub fn pending_events(&self) -> &[ConversationEvent] {
        self.root.pending_events()
    }

    fn ensure_active(&self) -> Result<(), ConversationError> {
        match self.root.state.status {
            Some(ConversationStatus::Active) => Ok(()),
            _ => Err(ConversationError::NotActive),
        }
    }

    /// Adds a user message; returns the new message id.
    pub fn add_user_message(&mut self, text: impl Into<String>) -> Result<String, ConversationError> {
        self.ensure_active()?;
        let message_id = uuid::Uuid::new_v4().to_string();
        self.root.register(ConversationEvent::MessageAdded {
            message_id: message_id.clone(),
            role: ChatRole::User,
            content: text.into(),
            status: MessageStatus::Completed,
            created_at: Utc::now(),
        });
        Ok(message_id)
    }

    /// Adds an assistant message with the given status; returns the new message id.
    pub fn add_assistant_message(
        &mut self,
        text: impl Into<String>,
        status: MessageStatus,
    ) -> Result<String, ConversationError> {
        self.add_assistant_message_with_id(uuid::Uuid::new_v4().to_string(), text, status)
    }

    /// Adds an assistant message under a caller-chosen id, so streamed chunk
    /// frames and the persisted message share one id.
    pub fn add_assistant_message_with_id(
        &mut self,
        message_id: impl Into<String>,
        text: impl Into<String>,
        status: MessageStatus,
    ) -> Result<String, ConversationError> {
        self.ensure_active()?;
        let message_id = message_id.into();
        self.root.register(ConversationEvent::MessageAdded {
            message_id: message_id.clone(),
            role: ChatRole::Assistant,
            content: text.into(),
            status,
            created_at: Utc::now(),
        });
        Ok(message_id)
    }

    /// Records a tool call on an existing assistant message.
    pub fn add_tool_call(
        &mut self,
        message_id: &str,
        name: impl Into<String>,
        arguments: Value,
        call_id: impl Into<String>,
    ) -> Result<(), ConversationError> {
        let call_id = call_id.into();
        let msg = self
            .root
            .state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ConversationError::MessageNotFound(message_id.to_string()))?;
        if msg.role != ChatRole::Assistant {
            return Err(ConversationError::NotAssistantMessage(message_id.to_string()));
        }
        if msg.tool_calls.iter().any(|c| c.call_id == call_id) {
            return Err(ConversationError::DuplicateCallId {
                message_id: message_id.to_string(),
                call_id,
            });
        }
        self.root.register(ConversationEvent::ToolCallAdded {
            message_id: message_id.to_string(),
            call_id,
            name: name.into(),
            arguments,
        });
        Ok(())
    }

    /// Records the result for a previously added tool call. Each call has at
    /// most one result.
    #[allow(clippy::too_many_arguments)]
    pub fn add_tool_result(
        &mut self,
        message_id: &str,
        call_id: &str,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
        execution_time_ms: u64,
    ) -> Result<(), ConversationError> {
        let msg = self
            .root
            .state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ConversationError::MessageNotFound(message_id.to_string()))?;
        if !msg.tool_calls.iter().any(|c| c.call_id == call_id) {
            return Err(ConversationError::CallNotFound {
                message_id: message_id.to_string(),
                call_id: call_id.to_string(),
            });
        }
        if msg.tool_results.iter().any(|r| r.call_id == call_id) {
            return Err(ConversationError::ResultAlreadyRecorded(call_id.to_string()));
        }
        self.root.register(ConversationEvent::ToolResultAdded {
            message_id: message_id.to_string(),
            call_id: call_id.to_string(),
            success,
            result,
            error,
            execution_time_ms,
        });
        Ok(())
    }

    /// Moves a message's status forward. Re-applying the current status is a no-op.
    pub fn update_message_status(
        &mut self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), ConversationError> {
        let msg = self
            .root
            .state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ConversationError::MessageNotFound(message_id.to_string()))?;
        if msg.status == status {
            return Ok(());
        }
        if !msg.status.can_transition_to(status) {
            return Err(ConversationError::InvalidStatusTransition {
                from: msg.status,
                to: status,
            });
        }
        self.root.register(ConversationEvent::MessageStatusUpdated {
            message_id: message_id.to_string(),
            status,
        });
        Ok(())
    }

    /// Truncates the message log. With `keep_system`, the index-0 system message
    /// survives. Clearing an already-clear log emits nothing.
    pub fn clear_messages(&mut self, keep_system: bool) {
        let already_clear = if keep_system {
            self.root.state.messages.len() <= 1
        } else {
            self.root.state.messages.is_empty()
        };
        if already_clear {
            return;
        }
        self.root
            .register(ConversationEvent::MessagesCleared { keep_system });
    }

    pub fn update_template_progress(&mut self, progress: TemplateProgress) {
        self.root
            .register(ConversationEvent::TemplateProgressUpdated { progress });
    }

    /// Soft delete: the stream stays, the conversation leaves the active set.
    pub fn delete(&mut self) -> Result<(), ConversationError> {
        self.ensure_active()?;
        self.root.register(ConversationEvent::ConversationDeleted {
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    /// The most recent ≤ `max` messages in order, expanded into chat form for
    /// prompt assembly: assistant tool calls are inlined, tool results become
    /// `role = tool` messages.
    pub fn get_context_messages(&self, max: usize) -> Vec<ChatMessage> {
        let mut expanded: Vec<ChatMessage> = Vec::new();
        for msg in &self.root.state.messages {
            let mut chat = ChatMessage {
                role: msg.role,
                content: msg.content.clone(),
                tool_calls: msg
                    .tool_calls
                    .iter()
                    .map(|c| ToolCall {
                        call_id: c.call_id.clone(),
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    })
                    .collect(),
                tool_call_id: None,
            };
            if msg.role != ChatRole::Assistant {
                chat.tool_calls.clear();
            }
            expanded.push(chat);
            for result in &msg.tool_results {
                let content = if result.success {
                    result
                        .result
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                } else {
                    result.error.clone().unwrap_or_else(|| "tool failed".into())
                };
                expanded.push(ChatMessage::tool(result.call_id.clone(), content));
            }
        }
        let skip = expanded.len().saturating_sub(max);
        expanded.split_off(skip)
    }
}
