//! Wire protocol for agent-host sessions: type + payload + envelope.
//!
//! This crate defines the wire shape of framed session messages and the SSE
//! line format. It does not depend on agent-core; the orchestrator bridges
//! agent events into [`ServerEvent`] and frames them with [`WireMessage`].

pub mod envelope;
pub mod event;
pub mod sse;

pub use envelope::WireMessage;
pub use event::{ClientEvent, CloseReason, ErrorCategory, ServerEvent};
pub use sse::sse_frame;
