//! Stdio MCP transport: spawn the server process and speak line-delimited
//! JSON-RPC over its stdin/stdout. Responses are routed back to callers by
//! request id; server stderr is discarded.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

use super::{initialize_params, parse_tools_list, McpError, McpToolInfo, McpTransport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct StdioTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawns `command args...` with the given extra environment and wires the
    /// JSON-RPC reader. Call [`McpTransport::initialize`] before use.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Spawn(format!("{} ({})", e, command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Spawn("child stdout unavailable".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let message: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                // Route responses by id; notifications from the server are ignored.
                let Some(id) = message.get("id").and_then(|v| v.as_u64()) else {
                    continue;
                };
                if let Some(tx) = reader_pending.lock().await.remove(&id) {
                    let _ = tx.send(message);
                }
            }
        });

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn write_message(&self, message: &Value) -> Result<(), McpError> {
        let mut line = message.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_message(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(McpError::Transport("reader closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(McpError::Timeout(timeout));
            }
        };

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(McpError::Protocol(message.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn initialize(&self) -> Result<(), McpError> {
        self.request("initialize", initialize_params(), INITIALIZE_TIMEOUT)
            .await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let result = self
            .request("tools/list", json!({}), REQUEST_TIMEOUT)
            .await?;
        parse_tools_list(&result)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
            REQUEST_TIMEOUT,
        )
        .await
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A `cat` child echoes nothing useful, but spawn/shutdown must not hang
    /// or leak the process.
    #[tokio::test]
    async fn spawn_and_shutdown_do_not_hang() {
        let transport = match StdioTransport::spawn("cat", &[], &[]) {
            Ok(t) => t,
            Err(_) => return, // environment without `cat`
        };
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let result = StdioTransport::spawn("definitely-not-a-real-mcp-server", &[], &[]);
        assert!(matches!(result, Err(McpError::Spawn(_))));
    }

    #[tokio::test]
    async fn request_resolves_or_times_out_quickly() {
        let transport = match StdioTransport::spawn("cat", &[], &[]) {
            Ok(t) => t,
            Err(_) => return,
        };
        // `cat` echoes the request line back: it carries our id with no
        // `error`, so the call resolves; the point is it must not hang.
        let outcome = transport
            .request("tools/list", json!({}), Duration::from_millis(200))
            .await;
        assert!(outcome.is_ok() || matches!(outcome, Err(McpError::Timeout(_))));
        transport.shutdown().await;
    }
}
