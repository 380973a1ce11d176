//! Stdio protocol session.
//!
//! Spawns a tool-server process and drives exactly one request over
//! newline-delimited JSON-RPC on its standard streams. The child's stderr is
//! drained to the log; the process is killed and reaped in `close`, which is
//! reached on every path out of the session.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::platform::Invocation;

use super::types::{ToolDefinition, ToolsListResult};
use super::{McpError, SessionState, PROTOCOL_VERSION};

/// One process-backed protocol session.
pub struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<()>>,
    timeout: Duration,
    next_id: i64,
    state: SessionState,
}

impl StdioSession {
    /// Spawn the tool server and run the protocol handshake.
    ///
    /// On any failure after the spawn, the child is torn down before the
    /// error is returned; no process outlives a failed connect.
    pub async fn connect(invocation: &Invocation, timeout: Duration) -> Result<Self, McpError> {
        let mut env = invocation.env.clone();
        // Interpreter-based servers buffer stdout unless told otherwise,
        // which stalls the first response.
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        tracing::debug!(
            command = %invocation.command,
            args = ?invocation.args,
            "Spawning tool server"
        );

        let mut child = Command::new(&invocation.command)
            .args(&invocation.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| McpError::Spawn {
                command: invocation.command.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Protocol("child stderr unavailable".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line = %line, "Tool server stderr");
            }
        });

        let mut session = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_task: Some(stderr_task),
            timeout,
            next_id: 0,
            state: SessionState::Created,
        };

        match tokio::time::timeout(timeout, session.initialize()).await {
            Ok(Ok(())) => {
                session.state = SessionState::Connected;
                Ok(session)
            }
            Ok(Err(e)) => {
                session.close().await;
                Err(e)
            }
            Err(_) => {
                session.close().await;
                Err(McpError::Timeout(timeout))
            }
        }
    }

    async fn initialize(&mut self) -> Result<(), McpError> {
        let id = self.take_id();
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {
                    "name": "toolhost",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {},
            },
        }))
        .await?;
        self.read_response(id).await?;

        self.send(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        }))
        .await
    }

    /// Issue the single `tools/list` exchange of this session.
    pub async fn list_tools(&mut self) -> Result<Vec<ToolDefinition>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        let listed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tools/list result: {}", e)))?;
        Ok(listed.tools)
    }

    /// Issue the single `tools/call` exchange of this session.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        self.state = SessionState::AwaitingResponse;
        let outcome = tokio::time::timeout(self.timeout, self.round_trip(method, params)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(self.timeout)),
        };
        self.state = if result.is_ok() {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        result
    }

    async fn round_trip(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.take_id();
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        self.read_response(id).await
    }

    async fn send(&mut self, message: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read frames until the response carrying `id` arrives. Server-initiated
    /// notifications and unrelated frames are skipped.
    async fn read_response(&mut self, id: i64) -> Result<Value, McpError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or(McpError::Disconnected)?;
            if line.trim().is_empty() {
                continue;
            }

            let frame: Value = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unparseable frame from tool server");
                    continue;
                }
            };
            if frame.get("id").and_then(Value::as_i64) != Some(id) {
                continue;
            }

            if let Some(error) = frame.get("error") {
                return Err(McpError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                });
            }
            return Ok(frame.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    fn take_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Kill and reap the child. Idempotent; failures are logged, never
    /// returned, so cleanup cannot mask the primary result.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        let _ = self.stdin.shutdown().await;
        if let Err(e) = self.child.start_kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!(error = %e, "Failed to kill tool server");
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(status = %status, "Tool server exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to reap tool server"),
            Err(_) => tracing::warn!("Tool server did not exit after kill"),
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.state = SessionState::Closed;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}
