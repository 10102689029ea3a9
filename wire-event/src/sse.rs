//! SSE line format: `event: <type>\ndata: <json>\n\n`.

use serde_json::Value;

/// Renders one SSE frame for the given event type and JSON payload.
pub fn sse_frame(event_type: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event_type, data)
}
