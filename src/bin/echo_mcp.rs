//! Minimal stdio tool server used as a test double.
//!
//! Speaks just enough JSON-RPC 2.0 over stdio to exercise a full session:
//! initialize handshake, `tools/list` with a single echo tool, and
//! `tools/call`. Environment knobs shape its behavior in tests:
//! `ECHO_MCP_STALL=1` makes it read requests but never answer,
//! `ECHO_MCP_STALL_AFTER_INIT=1` answers the handshake and then goes
//! silent, and `ECHO_MCP_SLEEP_MS` delays each response.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(json!({ "code": code, "message": message.into() })),
        }
    }
}

fn handle_request(request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
    match request.method.as_str() {
        "initialize" => Some(JsonRpcResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {
                    "name": "echo-mcp",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": {
                        "listChanged": false
                    }
                }
            }),
        )),
        "notifications/initialized" | "initialized" => None,
        "tools/list" => Some(JsonRpcResponse::success(
            request.id.clone(),
            json!({
                "tools": [{
                    "name": "echo",
                    "description": "Echo a message back to the caller.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "message": { "type": "string" }
                        },
                        "required": ["message"]
                    }
                }]
            }),
        )),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if name != "echo" {
                return Some(JsonRpcResponse::error(
                    request.id.clone(),
                    -32602,
                    format!("Unknown tool: {}", name),
                ));
            }
            let message = request
                .params
                .get("arguments")
                .and_then(|v| v.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            Some(JsonRpcResponse::success(
                request.id.clone(),
                json!({
                    "content": [{ "type": "text", "text": message }],
                    "isError": false
                }),
            ))
        }
        _ => Some(JsonRpcResponse::error(
            request.id.clone(),
            -32601,
            format!("Method not found: {}", request.method),
        )),
    }
}

fn main() {
    let stall = std::env::var("ECHO_MCP_STALL").ok().as_deref() == Some("1");
    let stall_after_init =
        std::env::var("ECHO_MCP_STALL_AFTER_INIT").ok().as_deref() == Some("1");
    let sleep = std::env::var("ECHO_MCP_SLEEP_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("echo-mcp ready");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let response = JsonRpcResponse::error(Value::Null, -32700, e.to_string());
                if let Ok(resp) = serde_json::to_string(&response) {
                    let _ = writeln!(stdout, "{}", resp);
                    let _ = stdout.flush();
                }
                continue;
            }
        };

        if stall {
            continue;
        }
        if stall_after_init
            && request.method != "initialize"
            && request.method != "notifications/initialized"
            && request.method != "initialized"
        {
            continue;
        }
        if let Some(delay) = sleep {
            std::thread::sleep(delay);
        }

        if let Some(response) = handle_request(&request) {
            if let Ok(resp) = serde_json::to_string(&response) {
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
            }
        }
    }
}
