//! ReAct driver: interleaves LLM calls with tool invocations until a tool-free
//! response is produced, emitting [`AgentEvent`]s over a channel.
//!
//! The consumer reads until the channel closes; closure is the sentinel. The
//! tool executor is an injected capability, not a dependency on the Tools
//! Provider client, so hosts and tests supply their own.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::llm::{LlmProvider, StreamChunk};
use crate::message::{ChatMessage, ToolCall, ToolDefinition};

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_MAX_TOOL_CALLS_PER_TURN: u32 = 10;

#[derive(Clone, Debug)]
pub enum AgentEvent {
    RunStarted,
    IterationStarted {
        iteration: u32,
    },
    LlmRequestStarted,
    LlmResponseChunk {
        content: String,
    },
    LlmResponseCompleted {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolCallsDetected {
        calls: Vec<ToolCall>,
    },
    ToolExecutionStarted {
        call_id: String,
        name: String,
    },
    ToolExecutionCompleted {
        call_id: String,
        name: String,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
        execution_time_ms: u64,
    },
    ToolExecutionFailed {
        call_id: String,
        name: String,
        error: String,
    },
    RunCompleted,
    RunFailed {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Clone, Debug)]
pub struct ToolExecutionRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Capability the host supplies for running tool calls. An `Err` means the
/// executor itself failed (wire error, panic equivalent); a tool that ran and
/// failed returns `Ok` with `success = false`.
#[async_trait]
pub trait ToolCallExecutor: Send + Sync {
    async fn execute(&self, request: ToolExecutionRequest) -> Result<ToolExecutionResult, String>;
}

/// Inputs for one agent turn.
pub struct RunContext {
    pub user_message: String,
    pub history: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub executor: Option<Arc<dyn ToolCallExecutor>>,
    pub max_iterations: u32,
    pub max_tool_calls_per_turn: u32,
}

impl RunContext {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            history: Vec::new(),
            tools: Vec::new(),
            executor: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tool_calls_per_turn: DEFAULT_MAX_TOOL_CALLS_PER_TURN,
        }
    }
}

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Starts the turn. Events arrive on the returned receiver; the channel
    /// closes after the terminal event (`RunCompleted` or `RunFailed`).
    /// Cancelling the token stops the producer without further events.
    pub fn run(&self, ctx: RunContext, cancel: CancellationToken) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(64);
        let provider = Arc::clone(&self.provider);
        tokio::spawn(async move {
            run_turn(provider, ctx, tx, cancel).await;
        });
        rx
    }
}

async fn run_turn(
    provider: Arc<dyn LlmProvider>,
    ctx: RunContext,
    tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) {
    // A send failing means the consumer is gone; stop quietly.
    macro_rules! emit {
        ($event:expr) => {
            if tx.send($event).await.is_err() {
                return;
            }
        };
    }

    let mut prompt = ctx.history.clone();
    prompt.push(ChatMessage::user(ctx.user_message.clone()));

    emit!(AgentEvent::RunStarted);

    let mut iteration: u32 = 0;
    loop {
        if iteration >= ctx.max_iterations {
            emit!(AgentEvent::RunFailed {
                kind: ErrorKind::IterationCap,
                message: format!("agent loop exceeded {} iterations", ctx.max_iterations),
            });
            return;
        }
        emit!(AgentEvent::IterationStarted { iteration });
        emit!(AgentEvent::LlmRequestStarted);

        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            result = provider.chat_stream(&prompt, &ctx.tools) => result,
        };
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                emit!(AgentEvent::RunFailed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                return;
            }
        };

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            let chunk: StreamChunk = match chunk {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    emit!(AgentEvent::RunFailed {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    return;
                }
                None => break,
            };
            if !chunk.content.is_empty() {
                content.push_str(&chunk.content);
                emit!(AgentEvent::LlmResponseChunk {
                    content: chunk.content.clone(),
                });
            }
            if chunk.done {
                tool_calls = chunk.tool_calls;
                break;
            }
        }

        emit!(AgentEvent::LlmResponseCompleted {
            content: content.clone(),
            tool_calls: tool_calls.clone(),
        });

        if tool_calls.is_empty() {
            emit!(AgentEvent::RunCompleted);
            return;
        }

        if tool_calls.len() as u32 > ctx.max_tool_calls_per_turn {
            emit!(AgentEvent::RunFailed {
                kind: ErrorKind::IterationCap,
                message: format!(
                    "model requested {} tool calls, cap is {}",
                    tool_calls.len(),
                    ctx.max_tool_calls_per_turn
                ),
            });
            return;
        }

        emit!(AgentEvent::ToolCallsDetected {
            calls: tool_calls.clone(),
        });

        // Execute sequentially so result ordering matches call order in the
        // history appended below.
        let mut result_messages = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            emit!(AgentEvent::ToolExecutionStarted {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
            });
            let outcome = match &ctx.executor {
                Some(executor) => {
                    let request = ToolExecutionRequest {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        outcome = executor.execute(request) => outcome,
                    }
                }
                None => Err("no tool executor configured".to_string()),
            };
            match outcome {
                Ok(result) => {
                    let content = if result.success {
                        result
                            .result
                            .as_ref()
                            .map(|v| v.to_string())
                            .unwrap_or_default()
                    } else {
                        result
                            .error
                            .clone()
                            .unwrap_or_else(|| "tool failed".to_string())
                    };
                    result_messages.push(ChatMessage::tool(call.call_id.clone(), content));
                    emit!(AgentEvent::ToolExecutionCompleted {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        success: result.success,
                        result: result.result,
                        error: result.error,
                        execution_time_ms: result.execution_time_ms,
                    });
                }
                Err(error) => {
                    result_messages
                        .push(ChatMessage::tool(call.call_id.clone(), error.clone()));
                    emit!(AgentEvent::ToolExecutionFailed {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        error,
                    });
                }
            }
        }

        prompt.push(ChatMessage::assistant_with_tool_calls(
            content,
            tool_calls,
        ));
        prompt.extend(result_messages);
        iteration += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, MockLlm};
    use serde_json::json;

    struct FixedExecutor {
        result: ToolExecutionResult,
    }

    #[async_trait]
    impl ToolCallExecutor for FixedExecutor {
        async fn execute(
            &self,
            _request: ToolExecutionRequest,
        ) -> Result<ToolExecutionResult, String> {
            Ok(self.result.clone())
        }
    }

    async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn tool_free_response_completes_in_one_iteration() {
        let provider = Arc::new(MockLlm::text("Hello!"));
        let agent = AgentLoop::new(provider);
        let events = collect(agent.run(RunContext::new("Hi"), CancellationToken::new())).await;

        assert!(matches!(events.first(), Some(AgentEvent::RunStarted)));
        assert!(matches!(events.last(), Some(AgentEvent::RunCompleted)));
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::LlmResponseChunk { content } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "Hello!");
        assert!(!events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallsDetected { .. })));
    }

    #[tokio::test]
    async fn tool_call_round_trip_feeds_second_llm_turn() {
        let call = ToolCall {
            call_id: "c1".into(),
            name: "math:add".into(),
            arguments: json!({"a": 2, "b": 3}),
        };
        let provider = Arc::new(MockLlm::new(vec![
            Ok(LlmResponse {
                content: String::new(),
                tool_calls: vec![call.clone()],
                ..Default::default()
            }),
            Ok(LlmResponse {
                content: "The answer is 5".into(),
                ..Default::default()
            }),
        ]));
        let calls_log = Arc::clone(&provider.calls);
        let agent = AgentLoop::new(provider);
        let mut ctx = RunContext::new("what is 2+3?");
        ctx.executor = Some(Arc::new(FixedExecutor {
            result: ToolExecutionResult {
                success: true,
                result: Some(json!({"sum": 5})),
                error: None,
                execution_time_ms: 3,
            },
        }));
        let events = collect(agent.run(ctx, CancellationToken::new())).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolExecutionStarted { call_id, .. } if call_id == "c1")));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolExecutionCompleted { success: true, .. }
        )));
        assert!(matches!(events.last(), Some(AgentEvent::RunCompleted)));

        // Second LLM call saw the assistant tool-call message and the tool result.
        let prompts = calls_log.lock().await;
        assert_eq!(prompts.len(), 2);
        let second = &prompts[1];
        let assistant_idx = second
            .iter()
            .position(|m| !m.tool_calls.is_empty())
            .expect("assistant tool-call message in prompt");
        assert_eq!(second[assistant_idx + 1].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn iteration_cap_produces_run_failed() {
        let call = ToolCall {
            call_id: "loop".into(),
            name: "noop".into(),
            arguments: json!({}),
        };
        // Every turn requests another tool call; the loop must stop at the cap.
        let responses: Vec<_> = (0..5)
            .map(|_| {
                Ok(LlmResponse {
                    content: String::new(),
                    tool_calls: vec![call.clone()],
                    ..Default::default()
                })
            })
            .collect();
        let agent = AgentLoop::new(Arc::new(MockLlm::new(responses)));
        let mut ctx = RunContext::new("go");
        ctx.max_iterations = 2;
        ctx.executor = Some(Arc::new(FixedExecutor {
            result: ToolExecutionResult {
                success: true,
                result: None,
                error: None,
                execution_time_ms: 0,
            },
        }));
        let events = collect(agent.run(ctx, CancellationToken::new())).await;
        match events.last() {
            Some(AgentEvent::RunFailed { kind, .. }) => {
                assert_eq!(*kind, ErrorKind::IterationCap)
            }
            other => panic!("expected RunFailed, got {:?}", other),
        }
        let iterations = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::IterationStarted { .. }))
            .count();
        assert_eq!(iterations, 2);
    }

    #[tokio::test]
    async fn llm_error_translates_to_run_failed_with_kind() {
        let agent = AgentLoop::new(Arc::new(MockLlm::new(vec![Err(
            crate::llm::LlmError::RateLimited("slow down".into()),
        )])));
        let events = collect(agent.run(RunContext::new("hi"), CancellationToken::new())).await;
        match events.last() {
            Some(AgentEvent::RunFailed { kind, .. }) => {
                assert_eq!(*kind, ErrorKind::RateLimited)
            }
            other => panic!("expected RunFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn executor_error_emits_tool_execution_failed_and_continues() {
        struct FailingExecutor;
        #[async_trait]
        impl ToolCallExecutor for FailingExecutor {
            async fn execute(
                &self,
                _request: ToolExecutionRequest,
            ) -> Result<ToolExecutionResult, String> {
                Err("executor blew up".into())
            }
        }

        let call = ToolCall {
            call_id: "c1".into(),
            name: "flaky".into(),
            arguments: json!({}),
        };
        let agent = AgentLoop::new(Arc::new(MockLlm::new(vec![
            Ok(LlmResponse {
                content: String::new(),
                tool_calls: vec![call],
                ..Default::default()
            }),
            Ok(LlmResponse {
                content: "I could not run the tool".into(),
                ..Default::default()
            }),
        ])));
        let mut ctx = RunContext::new("go");
        ctx.executor = Some(Arc::new(FailingExecutor));
        let events = collect(agent.run(ctx, CancellationToken::new())).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolExecutionFailed { .. })));
        assert!(matches!(events.last(), Some(AgentEvent::RunCompleted)));
    }

    #[tokio::test]
    async fn cancellation_stops_event_stream() {
        let provider = Arc::new(MockLlm::text("a long response that streams"));
        let agent = AgentLoop::new(provider);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rx = agent.run(RunContext::new("hi"), cancel);
        // Producer may emit RunStarted before observing cancellation, but must
        // not reach a terminal event.
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(!events
            .iter()
            .any(|e| matches!(e, AgentEvent::RunCompleted | AgentEvent::RunFailed { .. })));
    }
}
