//! Axum app: state, router, and WebSocket upgrade handler.
//!
//! Each socket gets a writer task draining the connection's outbound queue and
//! a read loop that parses client frames and dispatches to the orchestrator.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use wire_event::{ClientEvent, WireMessage};

use crate::connection::Connection;
use crate::manager::CLOSE_NORMAL;
use crate::orchestrator::Orchestrator;
use crate::sse::{cancel_request, sse_chat};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub cancellations: Arc<crate::sse::CancelRegistry>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            cancellations: Arc::new(crate::sse::CancelRegistry::default()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/sse/messages", post(sse_chat))
        .route("/cancel/:request_id", post(cancel_request))
        .route("/stats", get(stats))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn stats(State(state): State<AppState>) -> Json<crate::manager::ManagerStats> {
    Json(state.orchestrator.manager().get_stats())
}

#[derive(Deserialize)]
pub struct ConnectParams {
    pub user_id: String,
    pub conversation_id: String,
    /// End-user bearer token, forwarded to the Tools Provider.
    #[serde(default)]
    pub token: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state.orchestrator))
}

pub(crate) async fn handle_socket(
    socket: WebSocket,
    params: ConnectParams,
    orchestrator: Arc<Orchestrator>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(128);

    let connection = Arc::new(Connection::new(
        uuid::Uuid::new_v4().to_string(),
        params.user_id,
        params.conversation_id,
        params.token,
        outbound_tx,
    ));

    // Writer: drains the outbound queue in order.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.to_json_string() {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!("frame serialization failed: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    orchestrator.manager().connect(Arc::clone(&connection));
    orchestrator.initialize(Arc::clone(&connection)).await;

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("read error (client closed?): {}", e);
                break;
            }
        };
        let text = match &message {
            Message::Text(t) => t.clone(),
            Message::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        dispatch_frame(&orchestrator, &connection, &text).await;
    }

    orchestrator
        .manager()
        .disconnect(&connection.connection_id, Some("user_logout"), CLOSE_NORMAL);
    orchestrator.cleanup(&connection.connection_id).await;
    writer.abort();
}

async fn dispatch_frame(orchestrator: &Arc<Orchestrator>, connection: &Arc<Connection>, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(
                connection_id = %connection.connection_id,
                "unparseable client frame: {}", e
            );
            orchestrator.send_client_error(connection, format!("invalid frame: {}", e));
            return;
        }
    };
    match event {
        ClientEvent::Pong { .. } => orchestrator.handle_pong(connection).await,
        ClientEvent::Message { content } => {
            orchestrator
                .handle_user_message(Arc::clone(connection), content)
                .await
        }
        ClientEvent::WidgetResponse {
            widget_id,
            item_id,
            value,
        } => {
            orchestrator
                .handle_widget_response(Arc::clone(connection), widget_id, item_id, value)
                .await
        }
        ClientEvent::FlowStart {} => {
            orchestrator.handle_flow_start(Arc::clone(connection)).await
        }
        ClientEvent::FlowPause { reason } => {
            orchestrator
                .handle_flow_pause(Arc::clone(connection), reason)
                .await
        }
        ClientEvent::FlowCancel { request_id } => {
            orchestrator
                .handle_flow_cancel(Arc::clone(connection), request_id)
                .await
        }
        ClientEvent::ModelChange { model_id } => {
            orchestrator
                .handle_model_change(Arc::clone(connection), model_id)
                .await
        }
    }
}
