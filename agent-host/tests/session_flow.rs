//! Session-level flows: wire events produced by the orchestrator for chat and
//! proactive template sessions, against a scripted LLM.

use std::sync::Arc;
use std::time::Duration;

use agent_core::{
    Conversation, LlmProviderFactory, LlmResponse, MockLlm, ToolCall,
};
use agent_host::{
    Connection, ConnectionManager, ManagerConfig, Orchestrator, OrchestratorConfig, Template,
    TemplateStore,
};
use eventstore::InMemoryEventStore;
use tokio::sync::mpsc;
use wire_event::{ServerEvent, WireMessage};

struct Session {
    orchestrator: Arc<Orchestrator>,
    connection: Arc<Connection>,
    rx: mpsc::Receiver<WireMessage>,
    store: Arc<InMemoryEventStore>,
}

async fn start_session(
    mock: MockLlm,
    templates: TemplateStore,
    conversation_id: &str,
) -> Session {
    let manager = ConnectionManager::new(ManagerConfig::default());
    let store = Arc::new(InMemoryEventStore::new());
    let factory = Arc::new(LlmProviderFactory::fixed(Arc::new(mock)));
    let orchestrator = Orchestrator::new(
        Arc::clone(&manager),
        store.clone(),
        factory,
        None,
        Arc::new(std::sync::RwLock::new(templates)),
        OrchestratorConfig {
            chunk_interval: Duration::from_millis(1),
            ..Default::default()
        },
    );

    let (tx, rx) = mpsc::channel(256);
    let connection = Arc::new(Connection::new(
        "c1",
        "user-1",
        conversation_id,
        "bearer-token",
        tx,
    ));
    manager.connect(Arc::clone(&connection));
    orchestrator.initialize(Arc::clone(&connection)).await;
    Session {
        orchestrator,
        connection,
        rx,
        store,
    }
}

/// Drains events until the predicate matches or the timeout hits.
async fn collect_until(
    rx: &mut mpsc::Receiver<WireMessage>,
    done: impl Fn(&ServerEvent) -> bool,
) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for wire events")
            .expect("connection channel closed");
        let is_done = done(&message.event);
        events.push(message.event);
        if is_done {
            return events;
        }
    }
}

#[tokio::test]
async fn zero_tool_chat_streams_and_persists() {
    let mut session = start_session(
        MockLlm::text("Hello there!"),
        TemplateStore::new(),
        "conv-chat",
    )
    .await;

    let setup = collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::ChatInputEnabled { enabled: true })
    })
    .await;
    assert!(setup
        .iter()
        .any(|e| matches!(e, ServerEvent::ConnectionEstablished { .. })));

    session
        .orchestrator
        .handle_user_message(Arc::clone(&session.connection), "Hello".into())
        .await;
    let events = collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::MessageComplete { .. })
    })
    .await;

    // Order: thinking, chunks, content complete, message complete.
    let thinking = events
        .iter()
        .position(|e| matches!(e, ServerEvent::AssistantThinking {}))
        .expect("assistant_thinking");
    let complete = events
        .iter()
        .position(|e| matches!(e, ServerEvent::ContentComplete { .. }))
        .expect("content complete");
    assert!(thinking < complete);

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ContentChunk { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Hello there!");

    match events.iter().last().unwrap() {
        ServerEvent::MessageComplete { role, content, .. } => {
            assert_eq!(role, "assistant");
            assert_eq!(content, "Hello there!");
        }
        other => panic!("expected message complete, got {:?}", other),
    }

    // Aggregate: system + user + assistant, all completed.
    let conversation = Conversation::load(session.store.as_ref(), "conv-chat")
        .await
        .unwrap()
        .unwrap();
    let messages = &conversation.state().messages;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(messages[2].content, "Hello there!");
    assert!(messages
        .iter()
        .all(|m| m.status == agent_core::MessageStatus::Completed));
}

#[tokio::test]
async fn run_failed_surfaces_system_error_with_kind() {
    let mut session = start_session(
        MockLlm::new(vec![Err(agent_core::LlmError::RateLimited(
            "too many requests".into(),
        ))]),
        TemplateStore::new(),
        "conv-err",
    )
    .await;
    collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::ChatInputEnabled { enabled: true })
    })
    .await;

    session
        .orchestrator
        .handle_user_message(Arc::clone(&session.connection), "Hi".into())
        .await;
    let events = collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::Error { .. })
    })
    .await;
    match events.last().unwrap() {
        ServerEvent::Error {
            code, is_retryable, ..
        } => {
            assert_eq!(code, "rate_limited");
            assert!(*is_retryable);
        }
        other => panic!("expected error event, got {:?}", other),
    }
}

#[tokio::test]
async fn tool_call_turn_emits_tool_events_and_persists_results() {
    // No tools-provider client is configured, so the executor capability is
    // absent and the call fails; the wire contract still holds: a tool_result
    // with success=false, then a second LLM turn completes the message.
    let call = ToolCall {
        call_id: "c1".into(),
        name: "math:add".into(),
        arguments: serde_json::json!({"a": 2, "b": 3}),
    };
    let mock = MockLlm::new(vec![
        Ok(LlmResponse {
            content: String::new(),
            tool_calls: vec![call],
            ..Default::default()
        }),
        Ok(LlmResponse {
            content: "I could not reach the tool.".into(),
            ..Default::default()
        }),
    ]);
    let mut session = start_session(mock, TemplateStore::new(), "conv-tools").await;
    collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::ChatInputEnabled { enabled: true })
    })
    .await;

    session
        .orchestrator
        .handle_user_message(Arc::clone(&session.connection), "what is 2+3?".into())
        .await;
    let events = collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::MessageComplete { .. })
    })
    .await;

    let executing = events
        .iter()
        .position(|e| matches!(e, ServerEvent::ToolExecuting { call_id, .. } if call_id == "c1"))
        .expect("tool_executing");
    let result = events
        .iter()
        .position(
            |e| matches!(e, ServerEvent::ToolResult { call_id, success: false, .. } if call_id == "c1"),
        )
        .expect("tool_result");
    assert!(executing < result);

    let conversation = Conversation::load(session.store.as_ref(), "conv-tools")
        .await
        .unwrap()
        .unwrap();
    let with_calls = conversation
        .state()
        .messages
        .iter()
        .find(|m| !m.tool_calls.is_empty())
        .expect("assistant message with tool calls");
    assert_eq!(with_calls.tool_calls[0].call_id, "c1");
    assert_eq!(with_calls.tool_results.len(), 1);
    assert!(!with_calls.tool_results[0].success);
}

fn quiz_template() -> Template {
    serde_yaml::from_str(
        r#"
id: quiz
name: Quick quiz
agent_starts_first: true
completion_message: "Done!"
items:
  - id: intro
    title: Intro
    text: "Welcome."
  - id: q1
    title: Question
    text: "Pick five."
    widget:
      widget_id: w1
      widget_type: multiple_choice
      props:
        options: ["4", "5"]
      correct_answer: "5"
    feedback: immediate
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn proactive_template_presents_items_and_scores_widget() {
    let mut templates = TemplateStore::new();
    templates.insert(quiz_template());
    templates.assign("conv-quiz", "quiz");
    let mut session = start_session(MockLlm::text("unused"), templates, "conv-quiz").await;

    // Flow runs proactively: intro text streams, then the widget shows.
    let events = collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::WidgetShow { .. })
    })
    .await;
    assert!(events.iter().any(
        |e| matches!(e, ServerEvent::ItemContext { item_index: 0, total: 2, .. })
    ));
    let intro: String = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ContentChunk { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    assert!(intro.contains("Welcome."));
    match events.last().unwrap() {
        ServerEvent::WidgetShow {
            item_id,
            widget_type,
            ..
        } => {
            assert_eq!(item_id, "q1");
            assert_eq!(widget_type, "multiple_choice");
        }
        other => panic!("expected widget, got {:?}", other),
    }

    // Correct answer: immediate feedback, then completion.
    session
        .orchestrator
        .handle_widget_response(
            Arc::clone(&session.connection),
            "w1".into(),
            Some("q1".into()),
            serde_json::json!("5"),
        )
        .await;
    let events = collect_until(&mut session.rx, |e| {
        matches!(e, ServerEvent::ChatInputEnabled { enabled: true })
    })
    .await;
    let feedback: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ContentComplete { full_content, .. } => Some(full_content.as_str()),
            _ => None,
        })
        .collect();
    assert!(
        feedback.iter().any(|f| f.contains("Correct!")),
        "feedback events: {:?}",
        feedback
    );
    assert!(feedback.iter().any(|f| f.contains("Done!")));

    // Progress persisted as completed with the answer recorded.
    let conversation = Conversation::load(session.store.as_ref(), "conv-quiz")
        .await
        .unwrap()
        .unwrap();
    let progress = conversation.state().template_progress.as_ref().unwrap();
    assert!(progress.completed);
    assert_eq!(progress.answers.get("w1"), Some(&serde_json::json!("5")));
}
