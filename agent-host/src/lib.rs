//! Agent Host: WebSocket/SSE server that orchestrates streaming conversations
//! and delegates tool execution to the Tools Provider.
//!
//! - [`connection`]: per-socket state and outbound queue.
//! - [`manager`]: connection lifecycle, heartbeat, idle reaper, fan-out.
//! - [`orchestrator`]: per-connection state machine bridging wire frames to the
//!   agent loop and the conversation aggregate.
//! - [`template`]: proactive template flows (items, widgets, pacing).
//! - [`app`]: axum router and WebSocket upgrade.
//! - [`sse`]: SSE message-streaming transport with cancellation.

pub mod app;
pub mod connection;
pub mod manager;
pub mod orchestrator;
pub mod sse;
pub mod template;

pub use app::{build_router, AppState};
pub use connection::{Connection, ConnectionState};
pub use manager::{ConnectionManager, ManagerConfig, ManagerStats};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorState};
pub use sse::CancelRegistry;
pub use template::{FeedbackRule, Template, TemplateItem, TemplateStore, WidgetDef};
