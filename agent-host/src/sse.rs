//! SSE transport: message streaming over `text/event-stream` with the same
//! data events as the WebSocket path, plus per-request cancellation.
//!
//! `stream_started` opens every stream, `stream_complete` closes it, and
//! `cancelled` replaces the tail when `POST /cancel/{request_id}` wins.

use std::convert::Infallible;
use std::sync::Arc;

use agent_core::{
    AgentEvent, AgentLoop, Conversation, MessageStatus, ProviderToolExecutor, RunContext,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use dashmap::DashMap;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;

/// In-flight SSE requests by request id; `POST /cancel/{id}` cancels.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancelRegistry {
    pub fn register(&self, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(request_id.to_string(), token.clone());
        token
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        if let Some((_, token)) = self.tokens.remove(request_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn finish(&self, request_id: &str) {
        self.tokens.remove(request_id);
    }
}

#[derive(Deserialize)]
pub struct SseChatRequest {
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub token: String,
}

fn sse_event(name: &str, data: serde_json::Value) -> Event {
    Event::default().event(name.to_string()).data(data.to_string())
}

pub async fn cancel_request(
    Path(request_id): Path<String>,
    State(state): State<AppState>,
) -> StatusCode {
    if state.cancellations.cancel(&request_id) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn sse_chat(
    State(state): State<AppState>,
    Json(request): Json<SseChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let cancel = state.cancellations.register(&request_id);
    let (tx, rx) = mpsc::channel::<Event>(64);

    let orchestrator = Arc::clone(&state.orchestrator);
    let cancellations = Arc::clone(&state.cancellations);
    let rid = request_id.clone();
    tokio::spawn(async move {
        let _ = tx
            .send(sse_event("stream_started", json!({ "request_id": rid })))
            .await;
        run_sse_turn(orchestrator, request, &tx, cancel.clone()).await;
        if cancel.is_cancelled() {
            let _ = tx
                .send(sse_event("cancelled", json!({ "request_id": rid })))
                .await;
        } else {
            let _ = tx
                .send(sse_event("stream_complete", json!({ "request_id": rid })))
                .await;
        }
        cancellations.finish(&rid);
    });

    Sse::new(tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default())
}

/// One agent turn over SSE: loads (or creates) the conversation, streams the
/// agent events as SSE data events, and persists the outcome.
async fn run_sse_turn(
    orchestrator: Arc<crate::orchestrator::Orchestrator>,
    request: SseChatRequest,
    tx: &mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let store = orchestrator.store();
    let conversation_id = request
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut conversation = match Conversation::load(store.as_ref(), &conversation_id).await {
        Ok(Some(existing)) => existing,
        Ok(None) => Conversation::create(
            conversation_id.clone(),
            request.user_id.clone(),
            "You are a helpful assistant.",
        ),
        Err(e) => {
            let _ = tx
                .send(sse_event("error", json!({ "message": e.to_string() })))
                .await;
            return;
        }
    };

    let history = conversation.get_context_messages(orchestrator.config().max_context_messages);
    if conversation.add_user_message(&request.content).is_err() {
        let _ = tx
            .send(sse_event("error", json!({ "message": "conversation is not active" })))
            .await;
        return;
    }
    if let Err(e) = conversation.commit(store.as_ref(), None).await {
        tracing::error!("conversation commit failed: {}", e);
    }

    let mut tools = Vec::new();
    let mut executor: Option<Arc<ProviderToolExecutor>> = None;
    if let Some(client) = orchestrator.tools_client() {
        if let Ok(manifest) = client.list_tools(&request.token).await {
            let exec = Arc::new(ProviderToolExecutor::new(client, request.token.clone()));
            exec.set_manifest(manifest.clone()).await;
            tools = manifest;
            executor = Some(exec);
        }
    }

    let provider = orchestrator
        .factory()
        .build(orchestrator.config().default_provider, None);
    let agent = AgentLoop::new(provider);
    let mut run = RunContext::new(request.content);
    run.history = history;
    run.tools = tools.iter().map(|t| t.to_definition()).collect();
    run.executor = executor.map(|e| e as Arc<dyn agent_core::ToolCallExecutor>);
    run.max_iterations = orchestrator.config().max_iterations;
    run.max_tool_calls_per_turn = orchestrator.config().max_tool_calls_per_turn;

    let mut events = agent.run(run, cancel.clone());
    let mut message_id = uuid::Uuid::new_v4().to_string();
    let mut final_content = String::new();

    while let Some(event) = events.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        match event {
            AgentEvent::RunStarted => {
                let _ = tx.send(sse_event("event.assistant_thinking", json!({}))).await;
            }
            AgentEvent::IterationStarted { .. } => {
                message_id = uuid::Uuid::new_v4().to_string();
            }
            AgentEvent::LlmResponseChunk { content } => {
                let _ = tx
                    .send(sse_event(
                        "data.content.chunk",
                        json!({ "content": content, "messageId": message_id, "final": false }),
                    ))
                    .await;
            }
            AgentEvent::LlmResponseCompleted {
                content,
                tool_calls,
            } => {
                let _ = conversation.add_assistant_message_with_id(
                    message_id.clone(),
                    &content,
                    MessageStatus::Completed,
                );
                for call in &tool_calls {
                    let _ = conversation.add_tool_call(
                        &message_id,
                        &call.name,
                        call.arguments.clone(),
                        &call.call_id,
                    );
                }
                if tool_calls.is_empty() {
                    final_content = content.clone();
                    let _ = tx
                        .send(sse_event(
                            "data.content.complete",
                            json!({ "messageId": message_id, "role": "assistant", "fullContent": content }),
                        ))
                        .await;
                }
                if let Err(e) = conversation.commit(store.as_ref(), None).await {
                    tracing::error!("conversation commit failed: {}", e);
                }
            }
            AgentEvent::ToolExecutionStarted { call_id, name } => {
                let _ = tx
                    .send(sse_event(
                        "event.tool_executing",
                        json!({ "call_id": call_id, "tool_name": name }),
                    ))
                    .await;
            }
            AgentEvent::ToolExecutionCompleted {
                call_id,
                name,
                success,
                result,
                error,
                execution_time_ms,
            } => {
                let _ = conversation.add_tool_result(
                    &message_id,
                    &call_id,
                    success,
                    result.clone(),
                    error.clone(),
                    execution_time_ms,
                );
                if let Err(e) = conversation.commit(store.as_ref(), None).await {
                    tracing::error!("conversation commit failed: {}", e);
                }
                let _ = tx
                    .send(sse_event(
                        "event.tool_result",
                        json!({
                            "call_id": call_id,
                            "tool_name": name,
                            "success": success,
                            "result": result,
                            "error": error,
                            "execution_time_ms": execution_time_ms,
                        }),
                    ))
                    .await;
            }
            AgentEvent::ToolExecutionFailed {
                call_id,
                name,
                error,
            } => {
                let _ = conversation.add_tool_result(
                    &message_id,
                    &call_id,
                    false,
                    None,
                    Some(error.clone()),
                    0,
                );
                if let Err(e) = conversation.commit(store.as_ref(), None).await {
                    tracing::error!("conversation commit failed: {}", e);
                }
                let _ = tx
                    .send(sse_event(
                        "event.tool_result",
                        json!({ "call_id": call_id, "tool_name": name, "success": false, "error": error }),
                    ))
                    .await;
            }
            AgentEvent::RunCompleted => {
                let _ = tx
                    .send(sse_event(
                        "event.message_complete",
                        json!({ "message_id": message_id, "role": "assistant", "content": final_content }),
                    ))
                    .await;
            }
            AgentEvent::RunFailed { kind, message } => {
                let _ = tx
                    .send(sse_event(
                        "system.error",
                        json!({
                            "category": "server",
                            "code": kind.as_str(),
                            "message": message,
                            "isRetryable": kind.is_retryable(),
                        }),
                    ))
                    .await;
            }
            _ => {}
        }
    }
}
