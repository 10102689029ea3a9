//! Per-connection state machine: wires client frames to the agent loop, the
//! conversation aggregate, and template-driven proactive flows.
//!
//! ```text
//! CONNECTING -> AUTHENTICATED -> ACTIVE <-> { PRESENTING, WAITING_FOR_WIDGET,
//! RUNNING_AGENT } -> CLOSING -> CLOSED
//! ```
//!
//! The context lock is held only for state mutation; streaming and sleeps run
//! with cloned data so wire ordering is preserved without blocking handlers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agent_core::conversation::TemplateProgress;
use agent_core::{
    AgentEvent, AgentLoop, ChatMessage, Conversation, ErrorKind, LlmProvider, LlmProviderFactory,
    MessageStatus, ProviderToolExecutor, RunContext, ToolManifest, ToolProviderClient,
};
use dashmap::DashMap;
use eventstore::EventStore;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wire_event::{ErrorCategory, ServerEvent, WireMessage};

use crate::connection::{Connection, ConnectionState};
use crate::manager::ConnectionManager;
use crate::template::{chunk_text, FeedbackRule, Template, TemplateStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorState {
    Active,
    Presenting,
    WaitingForWidget,
    RunningAgent,
    Closing,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub max_tool_calls_per_turn: u32,
    pub max_context_messages: usize,
    /// Template text streams in chunks of this many characters.
    pub chunk_chars: usize,
    pub chunk_interval: Duration,
    pub default_provider: agent_core::ProviderKind,
    pub available_models: Vec<String>,
    pub allow_model_selection: bool,
    pub server_capabilities: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tool_calls_per_turn: 10,
            max_context_messages: 50,
            chunk_chars: 50,
            chunk_interval: Duration::from_millis(50),
            default_provider: agent_core::ProviderKind::Ollama,
            available_models: Vec::new(),
            allow_model_selection: false,
            server_capabilities: vec![
                "streaming".into(),
                "tools".into(),
                "templates".into(),
                "model_selection".into(),
            ],
        }
    }
}

/// Everything one connection's conversation needs between frames.
pub struct ConversationContext {
    pub state: OrchestratorState,
    pub conversation: Conversation,
    pub tools: Vec<ToolManifest>,
    pub executor: Option<Arc<ProviderToolExecutor>>,
    pub provider: Arc<dyn LlmProvider>,
    pub template: Option<Template>,
    pub item_index: usize,
    pub answers: BTreeMap<String, Value>,
    /// Cancels the in-flight agent run or flow step.
    pub run_cancel: CancellationToken,
    /// Cancels the current widget time-limit timer.
    pub widget_timer: Option<CancellationToken>,
    /// Feedback lines deferred to template completion.
    pub deferred_feedback: Vec<String>,
}

pub struct Orchestrator {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn EventStore>,
    factory: Arc<LlmProviderFactory>,
    tools_client: Option<Arc<ToolProviderClient>>,
    templates: Arc<std::sync::RwLock<TemplateStore>>,
    contexts: DashMap<String, Arc<tokio::sync::Mutex<ConversationContext>>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<ConnectionManager>,
        store: Arc<dyn EventStore>,
        factory: Arc<LlmProviderFactory>,
        tools_client: Option<Arc<ToolProviderClient>>,
        templates: Arc<std::sync::RwLock<TemplateStore>>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            store,
            factory,
            tools_client,
            templates,
            contexts: DashMap::new(),
            config,
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    pub fn factory(&self) -> Arc<LlmProviderFactory> {
        Arc::clone(&self.factory)
    }

    pub fn tools_client(&self) -> Option<Arc<ToolProviderClient>> {
        self.tools_client.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn send(&self, connection: &Connection, event: ServerEvent) {
        let message =
            WireMessage::new(event).with_conversation_id(connection.conversation_id.clone());
        self.manager
            .send_to_connection(&connection.connection_id, message);
    }

    fn send_error(&self, connection: &Connection, category: ErrorCategory, kind: ErrorKind, message: impl Into<String>) {
        self.send(
            connection,
            ServerEvent::Error {
                category,
                code: kind.as_str().to_string(),
                message: message.into(),
                is_retryable: kind.is_retryable(),
            },
        );
    }

    /// Frame-parse failures surface as client-category validation errors.
    pub fn send_client_error(&self, connection: &Connection, message: String) {
        self.send_error(
            connection,
            ErrorCategory::Client,
            ErrorKind::ValidationError,
            message,
        );
    }

    fn context(&self, connection_id: &str) -> Option<Arc<tokio::sync::Mutex<ConversationContext>>> {
        self.contexts.get(connection_id).map(|c| Arc::clone(&c))
    }

    /// Loads the conversation and tool catalog, sends
    /// `system.connection.established`, and either starts a proactive template
    /// flow or enables chat input.
    pub async fn initialize(self: &Arc<Self>, connection: Arc<Connection>) {
        let conversation =
            match Conversation::load(self.store.as_ref(), &connection.conversation_id).await {
                Ok(Some(existing)) => existing,
                Ok(None) => Conversation::create(
                    connection.conversation_id.clone(),
                    connection.user_id.clone(),
                    "You are a helpful assistant.",
                ),
                Err(e) => {
                    tracing::error!("conversation load failed: {}", e);
                    self.send_error(
                        &connection,
                        ErrorCategory::Server,
                        ErrorKind::ServerError,
                        "failed to load conversation",
                    );
                    return;
                }
            };

        // Access-filtered tool list; an unreachable provider degrades to zero tools.
        let mut tools = Vec::new();
        let mut executor = None;
        if let Some(client) = &self.tools_client {
            match client.list_tools(&connection.access_token).await {
                Ok(manifest) => tools = manifest,
                Err(e) => {
                    tracing::warn!("tool list unavailable: {}", e);
                }
            }
            let exec = Arc::new(ProviderToolExecutor::new(
                Arc::clone(client),
                connection.access_token.clone(),
            ));
            exec.set_manifest(tools.clone()).await;
            executor = Some(exec);
            self.spawn_tool_subscription(Arc::clone(&connection));
        }

        let provider = self.factory.build(self.config.default_provider, None);

        let template = self
            .templates
            .read()
            .ok()
            .and_then(|store| store.for_conversation(&connection.conversation_id).cloned());
        let resume_index = conversation
            .state()
            .template_progress
            .as_ref()
            .map(|p| p.item_index)
            .unwrap_or(0);

        let proactive = template
            .as_ref()
            .map(|t| t.agent_starts_first && resume_index < t.items.len())
            .unwrap_or(false);

        let context = Arc::new(tokio::sync::Mutex::new(ConversationContext {
            state: OrchestratorState::Active,
            conversation,
            tools: tools.clone(),
            executor,
            provider: Arc::clone(&provider),
            template,
            item_index: resume_index,
            answers: BTreeMap::new(),
            run_cancel: CancellationToken::new(),
            widget_timer: None,
            deferred_feedback: Vec::new(),
        }));
        self.contexts
            .insert(connection.connection_id.clone(), context);

        connection.set_state(ConnectionState::Active);
        self.send(
            &connection,
            ServerEvent::ConnectionEstablished {
                connection_id: connection.connection_id.clone(),
                conversation_id: connection.conversation_id.clone(),
                user_id: connection.user_id.clone(),
                server_capabilities: self.config.server_capabilities.clone(),
                current_model: provider.current_model(),
                available_models: self.config.available_models.clone(),
                allow_model_selection: self.config.allow_model_selection,
                tool_count: tools.len(),
            },
        );

        if proactive {
            self.start_flow(connection).await;
        } else {
            self.send(&connection, ServerEvent::ChatInputEnabled { enabled: true });
        }
    }

    /// Merges `tool_list` pushes from the provider's SSE stream into the
    /// session's tool set.
    fn spawn_tool_subscription(self: &Arc<Self>, connection: Arc<Connection>) {
        let Some(client) = self.tools_client.clone() else {
            return;
        };
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut updates = client.subscribe(&connection.access_token);
            while let Some(update) = updates.recv().await {
                if let agent_core::tools_client::ToolListUpdate::Tools(manifest) = update {
                    let Some(context) = orchestrator.context(&connection.connection_id) else {
                        return;
                    };
                    let mut ctx = context.lock().await;
                    if let Some(executor) = &ctx.executor {
                        executor.set_manifest(manifest.clone()).await;
                    }
                    ctx.tools = manifest;
                    tracing::debug!(
                        connection_id = %connection.connection_id,
                        count = ctx.tools.len(),
                        "tool list updated"
                    );
                }
            }
        });
    }

    pub async fn cleanup(&self, connection_id: &str) {
        if let Some((_, context)) = self.contexts.remove(connection_id) {
            let ctx = context.lock().await;
            ctx.run_cancel.cancel();
            if let Some(timer) = &ctx.widget_timer {
                timer.cancel();
            }
        }
    }

    /// User chat message: rejected while an agent run is in flight, otherwise
    /// persisted and handed to the agent loop.
    pub async fn handle_user_message(self: &Arc<Self>, connection: Arc<Connection>, content: String) {
        connection.touch();
        let Some(context) = self.context(&connection.connection_id) else {
            return;
        };
        let (history, provider, tools, executor, run_cancel) = {
            let mut ctx = context.lock().await;
            if ctx.state == OrchestratorState::RunningAgent {
                self.send(
                    &connection,
                    ServerEvent::Error {
                        category: ErrorCategory::Client,
                        code: "busy".into(),
                        message: "a response is already in progress".into(),
                        is_retryable: true,
                    },
                );
                return;
            }
            let history = ctx
                .conversation
                .get_context_messages(self.config.max_context_messages);
            if let Err(e) = ctx.conversation.add_user_message(&content) {
                self.send_error(
                    &connection,
                    ErrorCategory::Client,
                    ErrorKind::ValidationError,
                    e.to_string(),
                );
                return;
            }
            if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                tracing::error!("conversation commit failed: {}", e);
                self.send_error(
                    &connection,
                    ErrorCategory::Server,
                    ErrorKind::ServerError,
                    "failed to persist message",
                );
                return;
            }
            ctx.state = OrchestratorState::RunningAgent;
            ctx.run_cancel = CancellationToken::new();
            (
                history,
                Arc::clone(&ctx.provider),
                ctx.tools.iter().map(|t| t.to_definition()).collect::<Vec<_>>(),
                ctx.executor.clone(),
                ctx.run_cancel.clone(),
            )
        };

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator
                .run_agent_stream(connection, context, content, history, provider, tools, executor, run_cancel)
                .await;
        });
    }

    /// Drives one agent turn: translates [`AgentEvent`]s to wire frames and
    /// aggregate commands, then returns the machine to `Active` or resumes the
    /// template flow.
    #[allow(clippy::too_many_arguments)]
    async fn run_agent_stream(
        self: Arc<Self>,
        connection: Arc<Connection>,
        context: Arc<tokio::sync::Mutex<ConversationContext>>,
        user_message: String,
        history: Vec<ChatMessage>,
        provider: Arc<dyn LlmProvider>,
        tools: Vec<agent_core::ToolDefinition>,
        executor: Option<Arc<ProviderToolExecutor>>,
        run_cancel: CancellationToken,
    ) {
        let agent = AgentLoop::new(provider);
        let mut ctx_input = RunContext::new(user_message);
        ctx_input.history = history;
        ctx_input.tools = tools;
        ctx_input.executor = executor.map(|e| e as Arc<dyn agent_core::ToolCallExecutor>);
        ctx_input.max_iterations = self.config.max_iterations;
        ctx_input.max_tool_calls_per_turn = self.config.max_tool_calls_per_turn;

        let mut events = agent.run(ctx_input, run_cancel);

        let mut message_id = uuid::Uuid::new_v4().to_string();
        let mut iteration_content = String::new();
        let mut final_content = String::new();
        let mut persisted_current = false;

        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::RunStarted => {
                    self.send(&connection, ServerEvent::AssistantThinking {});
                }
                AgentEvent::IterationStarted { .. } => {
                    message_id = uuid::Uuid::new_v4().to_string();
                    iteration_content.clear();
                    persisted_current = false;
                }
                AgentEvent::LlmRequestStarted => {}
                AgentEvent::LlmResponseChunk { content } => {
                    iteration_content.push_str(&content);
                    self.send(
                        &connection,
                        ServerEvent::ContentChunk {
                            content,
                            message_id: message_id.clone(),
                            is_final: false,
                        },
                    );
                }
                AgentEvent::LlmResponseCompleted {
                    content,
                    tool_calls,
                } => {
                    let mut ctx = context.lock().await;
                    if tool_calls.is_empty() {
                        final_content = content.clone();
                        let _ = ctx.conversation.add_assistant_message_with_id(
                            message_id.clone(),
                            &content,
                            MessageStatus::Completed,
                        );
                        persisted_current = true;
                        self.send(
                            &connection,
                            ServerEvent::ContentComplete {
                                message_id: message_id.clone(),
                                role: "assistant".into(),
                                full_content: content,
                            },
                        );
                    } else {
                        let _ = ctx.conversation.add_assistant_message_with_id(
                            message_id.clone(),
                            &content,
                            MessageStatus::Completed,
                        );
                        persisted_current = true;
                        for call in &tool_calls {
                            if let Err(e) = ctx.conversation.add_tool_call(
                                &message_id,
                                &call.name,
                                call.arguments.clone(),
                                &call.call_id,
                            ) {
                                tracing::warn!("tool call persist failed: {}", e);
                            }
                        }
                    }
                    if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                        tracing::error!("conversation commit failed: {}", e);
                    }
                }
                AgentEvent::ToolCallsDetected { .. } => {}
                AgentEvent::ToolExecutionStarted { call_id, name } => {
                    self.send(
                        &connection,
                        ServerEvent::ToolExecuting {
                            call_id,
                            tool_name: name,
                        },
                    );
                }
                AgentEvent::ToolExecutionCompleted {
                    call_id,
                    name,
                    success,
                    result,
                    error,
                    execution_time_ms,
                } => {
                    let mut ctx = context.lock().await;
                    if let Err(e) = ctx.conversation.add_tool_result(
                        &message_id,
                        &call_id,
                        success,
                        result.clone(),
                        error.clone(),
                        execution_time_ms,
                    ) {
                        tracing::warn!("tool result persist failed: {}", e);
                    }
                    if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                        tracing::error!("conversation commit failed: {}", e);
                    }
                    drop(ctx);
                    self.send(
                        &connection,
                        ServerEvent::ToolResult {
                            call_id,
                            tool_name: name,
                            success,
                            result,
                            error,
                            execution_time_ms,
                        },
                    );
                }
                AgentEvent::ToolExecutionFailed {
                    call_id,
                    name,
                    error,
                } => {
                    let mut ctx = context.lock().await;
                    if let Err(e) = ctx.conversation.add_tool_result(
                        &message_id,
                        &call_id,
                        false,
                        None,
                        Some(error.clone()),
                        0,
                    ) {
                        tracing::warn!("tool result persist failed: {}", e);
                    }
                    if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                        tracing::error!("conversation commit failed: {}", e);
                    }
                    drop(ctx);
                    self.send(
                        &connection,
                        ServerEvent::ToolResult {
                            call_id,
                            tool_name: name,
                            success: false,
                            result: None,
                            error: Some(error),
                            execution_time_ms: 0,
                        },
                    );
                }
                AgentEvent::RunCompleted => {
                    self.send(
                        &connection,
                        ServerEvent::MessageComplete {
                            message_id: message_id.clone(),
                            role: "assistant".into(),
                            content: final_content.clone(),
                        },
                    );
                }
                AgentEvent::RunFailed { kind, message } => {
                    // Partial assistant content already streamed stays in the
                    // conversation, marked failed.
                    let mut ctx = context.lock().await;
                    if !persisted_current && !iteration_content.is_empty() {
                        let _ = ctx.conversation.add_assistant_message_with_id(
                            message_id.clone(),
                            &iteration_content,
                            MessageStatus::Failed,
                        );
                        if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                            tracing::error!("conversation commit failed: {}", e);
                        }
                    }
                    drop(ctx);
                    self.send_error(&connection, ErrorCategory::Server, kind, message);
                }
            }
        }

        // Terminal: back to ACTIVE, or resume the template flow.
        let resume_flow = {
            let mut ctx = context.lock().await;
            ctx.state = OrchestratorState::Active;
            ctx.template.is_some()
                && ctx
                    .template
                    .as_ref()
                    .map(|t| ctx.item_index < t.items.len())
                    .unwrap_or(false)
        };
        if resume_flow {
            self.start_flow(connection).await;
        } else {
            self.send(&connection, ServerEvent::ChatInputEnabled { enabled: true });
        }
    }

    /// Widget answer: records it on the current item, scores it, persists
    /// synthetic messages, then advances the flow.
    pub async fn handle_widget_response(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        widget_id: String,
        item_id: Option<String>,
        value: Value,
    ) {
        connection.touch();
        let Some(context) = self.context(&connection.connection_id) else {
            return;
        };
        {
            let mut ctx = context.lock().await;
            if ctx.state != OrchestratorState::WaitingForWidget {
                self.send_error(
                    &connection,
                    ErrorCategory::Client,
                    ErrorKind::ValidationError,
                    "no widget awaiting a response",
                );
                return;
            }
            if let Some(timer) = ctx.widget_timer.take() {
                timer.cancel();
            }

            let item = ctx
                .template
                .as_ref()
                .and_then(|t| t.items.get(ctx.item_index))
                .cloned();
            let Some(item) = item else {
                ctx.state = OrchestratorState::Active;
                return;
            };
            if let Some(expected_item) = &item_id {
                if expected_item != &item.id {
                    self.send_error(
                        &connection,
                        ErrorCategory::Client,
                        ErrorKind::ValidationError,
                        format!("response targets item {} but {} is current", expected_item, item.id),
                    );
                    return;
                }
            }

            ctx.answers.insert(widget_id.clone(), value.clone());
            let _ = ctx
                .conversation
                .add_user_message(value.to_string());

            // Server-side scoring and feedback.
            if let Some(widget) = &item.widget {
                if let Some(correct) = Template::score_answer(widget, &value) {
                    let mut feedback_lines = Vec::new();
                    if !correct && item.reveal_correct_answer {
                        if let Some(answer) = &widget.correct_answer {
                            feedback_lines.push(format!("The correct answer was {}.", answer));
                        }
                    }
                    match item.feedback {
                        FeedbackRule::Immediate => {
                            let mut text = if correct {
                                "Correct!".to_string()
                            } else {
                                "Not quite.".to_string()
                            };
                            for line in &feedback_lines {
                                text.push(' ');
                                text.push_str(line);
                            }
                            if let Ok(id) = ctx
                                .conversation
                                .add_assistant_message(&text, MessageStatus::Completed)
                            {
                                self.send(
                                    &connection,
                                    ServerEvent::ContentComplete {
                                        message_id: id,
                                        role: "assistant".into(),
                                        full_content: text,
                                    },
                                );
                            }
                        }
                        FeedbackRule::OnCompletion => {
                            ctx.deferred_feedback.push(format!(
                                "{}: {}",
                                item.title,
                                if correct { "correct" } else { "incorrect" }
                            ));
                        }
                        FeedbackRule::None => {
                            for line in feedback_lines {
                                if let Ok(id) = ctx
                                    .conversation
                                    .add_assistant_message(&line, MessageStatus::Completed)
                                {
                                    self.send(
                                        &connection,
                                        ServerEvent::ContentComplete {
                                            message_id: id,
                                            role: "assistant".into(),
                                            full_content: line,
                                        },
                                    );
                                }
                            }
                        }
                    }
                }
            }

            let progress = TemplateProgress {
                item_index: ctx.item_index + 1,
                answers: ctx.answers.clone(),
                completed: false,
            };
            ctx.conversation.update_template_progress(progress);
            if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                tracing::error!("conversation commit failed: {}", e);
            }
            ctx.item_index += 1;
            ctx.state = OrchestratorState::Presenting;
        }
        self.run_flow(connection).await;
    }

    pub async fn handle_flow_start(self: &Arc<Self>, connection: Arc<Connection>) {
        connection.touch();
        let Some(context) = self.context(&connection.connection_id) else {
            return;
        };
        {
            let ctx = context.lock().await;
            if ctx.template.is_none() || ctx.state != OrchestratorState::Active {
                return;
            }
        }
        self.start_flow(connection).await;
    }

    pub async fn handle_flow_pause(&self, connection: Arc<Connection>, _reason: Option<String>) {
        connection.touch();
        let Some(context) = self.context(&connection.connection_id) else {
            return;
        };
        let mut ctx = context.lock().await;
        if matches!(
            ctx.state,
            OrchestratorState::Presenting | OrchestratorState::WaitingForWidget
        ) {
            if let Some(timer) = ctx.widget_timer.take() {
                timer.cancel();
            }
            ctx.run_cancel.cancel();
            ctx.state = OrchestratorState::Active;
            self.send(&connection, ServerEvent::ChatInputEnabled { enabled: true });
        }
    }

    /// Cancel aborts the in-flight agent/tool loop as well as the flow.
    pub async fn handle_flow_cancel(&self, connection: Arc<Connection>, _request_id: Option<String>) {
        connection.touch();
        let Some(context) = self.context(&connection.connection_id) else {
            return;
        };
        let mut ctx = context.lock().await;
        ctx.run_cancel.cancel();
        ctx.run_cancel = CancellationToken::new();
        if let Some(timer) = ctx.widget_timer.take() {
            timer.cancel();
        }
        ctx.state = OrchestratorState::Active;
        self.send(&connection, ServerEvent::ChatInputEnabled { enabled: true });
    }

    /// Qualified `provider:model` ids re-resolve the provider through the
    /// factory; bare ids override the current provider's model.
    pub async fn handle_model_change(&self, connection: Arc<Connection>, model_id: String) {
        connection.touch();
        if !self.config.allow_model_selection {
            self.send_error(
                &connection,
                ErrorCategory::Client,
                ErrorKind::Forbidden,
                "model selection is disabled",
            );
            return;
        }
        let Some(context) = self.context(&connection.connection_id) else {
            return;
        };
        let mut ctx = context.lock().await;
        ctx.provider = self.factory.resolve(&model_id, &ctx.provider);
        tracing::info!(
            connection_id = %connection.connection_id,
            model = %ctx.provider.current_model(),
            "model changed"
        );
    }

    pub async fn handle_pong(&self, connection: &Connection) {
        self.manager.handle_pong(&connection.connection_id);
    }

    async fn start_flow(self: &Arc<Self>, connection: Arc<Connection>) {
        {
            let Some(context) = self.context(&connection.connection_id) else {
                return;
            };
            let mut ctx = context.lock().await;
            ctx.state = OrchestratorState::Presenting;
        }
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_flow(connection).await;
        });
    }

    /// Presents items from the current index until a widget blocks or the
    /// template completes.
    async fn run_flow(self: &Arc<Self>, connection: Arc<Connection>) {
        loop {
            let Some(context) = self.context(&connection.connection_id) else {
                return;
            };
            let (item, index, total, cancel) = {
                let ctx = context.lock().await;
                if ctx.state != OrchestratorState::Presenting {
                    return;
                }
                let Some(template) = &ctx.template else {
                    return;
                };
                match template.items.get(ctx.item_index) {
                    Some(item) => (
                        item.clone(),
                        ctx.item_index,
                        template.items.len(),
                        ctx.run_cancel.clone(),
                    ),
                    None => {
                        drop(ctx);
                        self.complete_flow(connection, context).await;
                        return;
                    }
                }
            };

            self.send(
                &connection,
                ServerEvent::ItemContext {
                    item_index: index,
                    total,
                    title: item.title.clone(),
                    enable_chat_input: item.enable_chat_input,
                },
            );
            self.send(
                &connection,
                ServerEvent::ChatInputEnabled {
                    enabled: item.enable_chat_input,
                },
            );

            if let Some(text) = &item.text {
                if !self
                    .stream_text(&connection, text, &cancel)
                    .await
                {
                    return;
                }
            }

            if let Some(widget) = &item.widget {
                {
                    let mut ctx = context.lock().await;
                    ctx.state = OrchestratorState::WaitingForWidget;
                    if let Some(limit) = item.time_limit_seconds {
                        let timer = CancellationToken::new();
                        ctx.widget_timer = Some(timer.clone());
                        self.spawn_widget_timer(
                            Arc::clone(&connection),
                            item.id.clone(),
                            item.warning_message.clone(),
                            Duration::from_secs(limit),
                            timer,
                        );
                    }
                }
                self.send(
                    &connection,
                    ServerEvent::WidgetShow {
                        item_id: item.id.clone(),
                        widget_type: widget.widget_type.clone(),
                        props: widget.props.clone(),
                    },
                );
                return; // wait for the widget response
            }

            // Text-only item: advance.
            let mut ctx = context.lock().await;
            ctx.item_index += 1;
            let progress = TemplateProgress {
                item_index: ctx.item_index,
                answers: ctx.answers.clone(),
                completed: false,
            };
            ctx.conversation.update_template_progress(progress);
            if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                tracing::error!("conversation commit failed: {}", e);
            }
        }
    }

    /// Streams text in fixed-size chunks at the configured pace, ending with a
    /// `content_complete`. Returns false when cancelled.
    async fn stream_text(
        &self,
        connection: &Connection,
        text: &str,
        cancel: &CancellationToken,
    ) -> bool {
        let message_id = uuid::Uuid::new_v4().to_string();
        for chunk in chunk_text(text, self.config.chunk_chars) {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.chunk_interval) => {}
            }
            self.send(
                connection,
                ServerEvent::ContentChunk {
                    content: chunk,
                    message_id: message_id.clone(),
                    is_final: false,
                },
            );
        }
        self.send(
            connection,
            ServerEvent::ContentComplete {
                message_id,
                role: "assistant".into(),
                full_content: text.to_string(),
            },
        );
        true
    }

    /// Emits the warning near the end of the limit, then forces advancement.
    fn spawn_widget_timer(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        item_id: String,
        warning_message: Option<String>,
        limit: Duration,
        cancel: CancellationToken,
    ) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let warning_lead = limit.min(Duration::from_secs(10));
            let until_warning = limit.saturating_sub(warning_lead);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(until_warning) => {}
            }
            orchestrator.send(
                &connection,
                ServerEvent::ExpirationWarning {
                    item_id: item_id.clone(),
                    message: warning_message
                        .unwrap_or_else(|| "time is almost up".to_string()),
                },
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(warning_lead) => {}
            }
            // Forced advancement: the item expires unanswered.
            let Some(context) = orchestrator.context(&connection.connection_id) else {
                return;
            };
            {
                let mut ctx = context.lock().await;
                if ctx.state != OrchestratorState::WaitingForWidget {
                    return;
                }
                ctx.widget_timer = None;
                ctx.item_index += 1;
                let progress = TemplateProgress {
                    item_index: ctx.item_index,
                    answers: ctx.answers.clone(),
                    completed: false,
                };
                ctx.conversation.update_template_progress(progress);
                if let Err(e) = ctx
                    .conversation
                    .commit(orchestrator.store.as_ref(), None)
                    .await
                {
                    tracing::error!("conversation commit failed: {}", e);
                }
                ctx.state = OrchestratorState::Presenting;
            }
            orchestrator.run_flow(connection).await;
        });
    }

    async fn complete_flow(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        context: Arc<tokio::sync::Mutex<ConversationContext>>,
    ) {
        let completion = {
            let mut ctx = context.lock().await;
            let mut completion = ctx
                .template
                .as_ref()
                .and_then(|t| t.completion_message.clone())
                .unwrap_or_else(|| "That's everything, thanks!".to_string());
            if !ctx.deferred_feedback.is_empty() {
                completion.push('\n');
                completion.push_str(&ctx.deferred_feedback.join("\n"));
            }
            let progress = TemplateProgress {
                item_index: ctx.item_index,
                answers: ctx.answers.clone(),
                completed: true,
            };
            ctx.conversation.update_template_progress(progress);
            let _ = ctx
                .conversation
                .add_assistant_message(&completion, MessageStatus::Completed);
            if let Err(e) = ctx.conversation.commit(self.store.as_ref(), None).await {
                tracing::error!("conversation commit failed: {}", e);
            }
            ctx.state = OrchestratorState::Active;
            completion
        };
        let cancel = CancellationToken::new();
        self.stream_text(&connection, &completion, &cancel).await;
        self.send(&connection, ServerEvent::ChatInputEnabled { enabled: true });
    }
}
