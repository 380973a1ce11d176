//! Event-stream protocol session.
//!
//! Connects to a remote tool server over SSE: the server's first `endpoint`
//! event names the URL requests are POSTed to, and responses arrive as
//! `message` events on the stream, correlated by request id. No process is
//! spawned; `close` drops the stream.

use std::time::Duration;

use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde_json::{json, Value};
use url::Url;

use super::types::{ToolDefinition, ToolsListResult};
use super::{McpError, SessionState, PROTOCOL_VERSION};

/// One network-backed protocol session.
pub struct SseSession {
    events: EventSource,
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    next_id: i64,
    state: SessionState,
}

impl SseSession {
    /// Open the event stream, wait for the server's endpoint announcement
    /// and run the protocol handshake.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, McpError> {
        let base = Url::parse(url).map_err(|e| McpError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(url = %url, "Connecting to event-stream tool server");
        let mut events = EventSource::get(url);

        let endpoint =
            match tokio::time::timeout(timeout, wait_for_endpoint(&mut events, &base, url)).await {
                Ok(Ok(endpoint)) => endpoint,
                Ok(Err(e)) => {
                    events.close();
                    return Err(e);
                }
                Err(_) => {
                    events.close();
                    return Err(McpError::Timeout(timeout));
                }
            };

        tracing::debug!(endpoint = %endpoint, "Event-stream endpoint announced");

        let mut session = Self {
            events,
            http: reqwest::Client::new(),
            endpoint,
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
        self.post(&json!({
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

        self.post(&json!({
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
        let outcome = tokio::time::timeout(self.timeout, async {
            let id = self.take_id();
            self.post(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await?;
            self.read_response(id).await
        })
        .await;
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

    async fn post(&self, message: &Value) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| McpError::Connect {
                url: self.endpoint.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(McpError::Protocol(format!(
                "endpoint rejected request with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Read stream messages until the response carrying `id` arrives.
    async fn read_response(&mut self, id: i64) -> Result<Value, McpError> {
        while let Some(event) = self.events.next().await {
            let message = match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => message,
                Err(e) => {
                    return Err(McpError::Connect {
                        url: self.endpoint.to_string(),
                        reason: e.to_string(),
                    })
                }
            };
            if message.event != "message" {
                continue;
            }

            let frame: Value = match serde_json::from_str(&message.data) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unparseable frame from event stream");
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
        Err(McpError::Disconnected)
    }

    fn take_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Drop the event stream. Idempotent and infallible.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.events.close();
        self.state = SessionState::Closed;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

/// The first protocol event on the stream names the request endpoint, either
/// absolute or relative to the stream URL.
async fn wait_for_endpoint(
    events: &mut EventSource,
    base: &Url,
    url: &str,
) -> Result<Url, McpError> {
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Open) => continue,
            Ok(Event::Message(message)) if message.event == "endpoint" => {
                return base.join(message.data.trim()).map_err(|e| McpError::Connect {
                    url: url.to_string(),
                    reason: format!("bad endpoint announcement: {}", e),
                });
            }
            Ok(Event::Message(_)) => continue,
            Err(e) => {
                return Err(McpError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
    Err(McpError::Disconnected)
}
