//! Agent-facing HTTP surface: tool manifest, change-stream SSE, and the call
//! endpoint. Every route authenticates by bearer JWT claims.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use agent_core::{ErrorKind, ToolManifest};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt as _;

use crate::access::{decode_claims, AccessResolver};
use crate::breaker::BreakerRegistry;
use crate::catalog::{Catalog, CatalogNotification, ToolRow};
use crate::exchange::TokenExchanger;
use crate::executor::ToolExecutor;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct ApiState {
    pub catalog: Arc<Catalog>,
    pub resolver: Arc<AccessResolver>,
    pub executor: Arc<ToolExecutor>,
    pub exchanger: Arc<TokenExchanger>,
    pub breakers: Arc<BreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/agent/tools", get(list_tools))
        .route("/agent/sse", get(subscribe))
        .route("/agent/tools/call", post(call_tool))
        .route("/app/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let (tools, sources, groups, policies) = state.catalog.stats();
    Json(json!({
        "status": "ok",
        "tools": tools,
        "sources": sources,
        "groups": groups,
        "policies": policies,
        "token_exchange": state.exchanger.get_state(),
    }))
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn error_body(kind: ErrorKind, message: &str) -> Json<Value> {
    Json(json!({
        "status": "failed",
        "error": message,
        "error_code": kind.as_str(),
        "is_retryable": kind.is_retryable(),
    }))
}

fn status_of(kind: ErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

struct Authenticated {
    bearer: String,
    claims: Value,
    granted: BTreeSet<String>,
}

fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Authenticated, (StatusCode, Json<Value>)> {
    let Some(bearer) = bearer_from_headers(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            error_body(ErrorKind::AuthError, "missing bearer token"),
        ));
    };
    let claims = decode_claims(&bearer).map_err(|e| {
        (
            StatusCode::UNAUTHORIZED,
            error_body(ErrorKind::AuthError, &e.to_string()),
        )
    })?;
    let granted = state.resolver.resolve_agent_access(&claims, false);
    Ok(Authenticated {
        bearer,
        claims,
        granted,
    })
}

fn manifest_entry(row: &ToolRow) -> Option<ToolManifest> {
    let definition = row.state.definition.as_ref()?;
    Some(ToolManifest {
        tool_id: row.tool_id.clone(),
        name: row.state.tool_name.clone(),
        description: definition.description.clone(),
        input_schema: definition.input_schema.clone(),
        source_id: row.state.source_id.clone(),
        source_path: definition.source_path.clone(),
        tags: definition.tags.clone(),
        version: definition.version.clone(),
    })
}

/// `GET /agent/tools`: the caller's access-filtered manifest.
async fn list_tools(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let auth = match authenticate(&state, &headers) {
        Ok(auth) => auth,
        Err(rejection) => return rejection.into_response(),
    };
    let manifest: Vec<ToolManifest> = state
        .catalog
        .tools_for_groups(&auth.granted)
        .iter()
        .filter_map(manifest_entry)
        .collect();
    Json(manifest).into_response()
}

/// `GET /agent/sse`: `connected`, then `tool_list` on catalog changes and
/// periodic `heartbeat`s.
async fn subscribe(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let auth = authenticate(&state, &headers)?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(16);
    let catalog = Arc::clone(&state.catalog);
    let resolver = Arc::clone(&state.resolver);
    let claims = auth.claims.clone();
    tokio::spawn(async move {
        let _ = tx
            .send(Event::default().event("connected").data("{}"))
            .await;
        let send_tool_list = |tx: tokio::sync::mpsc::Sender<Event>,
                              catalog: Arc<Catalog>,
                              resolver: Arc<AccessResolver>,
                              claims: Value| async move {
            let granted = resolver.resolve_agent_access(&claims, true);
            let manifest: Vec<ToolManifest> = catalog
                .tools_for_groups(&granted)
                .iter()
                .filter_map(manifest_entry)
                .collect();
            let data = serde_json::to_string(&manifest).unwrap_or_else(|_| "[]".into());
            tx.send(Event::default().event("tool_list").data(data))
                .await
                .is_ok()
        };
        // Initial list, then push on every change notification.
        if !send_tool_list(
            tx.clone(),
            Arc::clone(&catalog),
            Arc::clone(&resolver),
            claims.clone(),
        )
        .await
        {
            return;
        }

        let mut notifications = match catalog.subscribe() {
            Some(rx) => rx,
            None => return,
        };
        let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if tx
                        .send(Event::default().event("heartbeat").data("{}"))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                notification = notifications.recv() => {
                    match notification {
                        Ok(CatalogNotification::ToolsUpdated)
                        | Ok(CatalogNotification::GroupsUpdated) => {
                            if !send_tool_list(
                                tx.clone(),
                                Arc::clone(&catalog),
                                Arc::clone(&resolver),
                                claims.clone(),
                            )
                            .await
                            {
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            let _ = tx
                                .send(Event::default().event("error").data("\"catalog closed\""))
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    });

    Ok(
        Sse::new(tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok))
            .keep_alive(KeepAlive::default()),
    )
}

#[derive(Deserialize)]
struct CallRequest {
    #[serde(default)]
    tool_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    validate_schema: Option<bool>,
}

/// `POST /agent/tools/call`: membership check, rate limit, then proxied
/// execution. A denied tool never reaches the upstream.
async fn call_tool(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CallRequest>,
) -> impl IntoResponse {
    let auth = match authenticate(&state, &headers) {
        Ok(auth) => auth,
        Err(rejection) => return rejection.into_response(),
    };

    let user = auth
        .claims
        .get("sub")
        .and_then(|v| v.as_str())
        .unwrap_or("anonymous");
    if !state.limiter.try_acquire(user) {
        return (
            status_of(ErrorKind::RateLimited),
            error_body(ErrorKind::RateLimited, "per-user rate limit exceeded"),
        )
            .into_response();
    }

    let row = match (&request.tool_id, &request.name) {
        (Some(tool_id), _) => state.catalog.tool(tool_id),
        (None, Some(name)) => state.catalog.tool_by_name(name),
        (None, None) => {
            return (
                status_of(ErrorKind::ValidationError),
                error_body(ErrorKind::ValidationError, "tool_id or name is required"),
            )
                .into_response()
        }
    };
    let Some(row) = row else {
        return (
            status_of(ErrorKind::NotFound),
            error_body(ErrorKind::NotFound, "tool not found"),
        )
            .into_response();
    };

    if !state.catalog.is_callable(&row.tool_id, &auth.granted) {
        tracing::warn!(tool_id = %row.tool_id, user, "tool call denied");
        return (
            status_of(ErrorKind::Forbidden),
            error_body(ErrorKind::Forbidden, "access to this tool is not granted"),
        )
            .into_response();
    }
    let Some(definition) = row.state.definition.clone() else {
        return (
            status_of(ErrorKind::NotFound),
            error_body(ErrorKind::NotFound, "tool has no definition"),
        )
            .into_response();
    };

    match state
        .executor
        .execute(
            &row.tool_id,
            &definition,
            &request.arguments,
            &auth.bearer,
            Some(&row.state.source_id),
            request.validate_schema,
        )
        .await
    {
        Ok(output) => Json(json!({
            "tool_id": output.tool_id,
            "status": output.status,
            "result": output.result,
            "execution_time_ms": output.execution_time_ms,
            "upstream_status": output.upstream_status,
            "metadata": output.metadata,
        }))
        .into_response(),
        Err(e) => (
            status_of(e.error_code),
            Json(json!({
                "tool_id": e.tool_id,
                "status": "failed",
                "error": e.message,
                "error_code": e.error_code.as_str(),
                "is_retryable": e.is_retryable,
                "details": e.details,
                "upstream_status": e.upstream_status,
                "execution_time_ms": 0,
            })),
        )
            .into_response(),
    }
}
