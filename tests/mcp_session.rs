//! End-to-end session tests against the bundled echo-mcp test double.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use toolhost::mcp::types::{McpServerConfig, ServerToolsRequest, ToolCallRequest};
use toolhost::mcp::{CallReply, McpRegistry, McpToolManager, SessionState, StdioSession, ToolsReply};
use toolhost::platform::Invocation;
use toolhost::runtime::{EnvSnapshot, LinuxRuntime};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn echo_server(env: HashMap<String, String>) -> Invocation {
    Invocation::new(env!("CARGO_BIN_EXE_echo-mcp"), vec![], env)
}

async fn manager(dir: &Path) -> McpToolManager {
    let runtime = Arc::new(LinuxRuntime::new(dir.to_path_buf(), EnvSnapshot::empty()));
    McpToolManager::with_runtime(dir.to_path_buf(), runtime, EnvSnapshot::empty())
        .await
        .with_request_timeout(Duration::from_secs(10))
}

#[tokio::test]
async fn test_list_tools_round_trip() {
    init_tracing();
    let mut session = StdioSession::connect(&echo_server(HashMap::new()), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    let tools = session.list_tools().await.unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    session.close().await;
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_call_tool_round_trip() {
    init_tracing();
    let mut session = StdioSession::connect(&echo_server(HashMap::new()), Duration::from_secs(10))
        .await
        .unwrap();

    let result = session
        .call_tool("echo", json!({"message": "hello"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "hello");
    assert_eq!(result["isError"], false);

    session.close().await;
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_stalled_server_times_out_and_closes() {
    init_tracing();
    let mut env = HashMap::new();
    env.insert("ECHO_MCP_STALL".to_string(), "1".to_string());

    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    let result = StdioSession::connect(&echo_server(env), timeout).await;
    let elapsed = started.elapsed();

    assert!(result.is_err());
    // Bounded by the request timeout, not by the child's lifetime.
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_request_timeout_still_closes_session() {
    init_tracing();
    let mut env = HashMap::new();
    env.insert("ECHO_MCP_STALL_AFTER_INIT".to_string(), "1".to_string());

    // The handshake succeeds; only the tools/list request goes unanswered.
    let mut session = StdioSession::connect(&echo_server(env), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    let started = Instant::now();
    let result = session.list_tools().await;
    assert!(result.is_err());
    assert_eq!(session.state(), SessionState::Failed);
    assert!(started.elapsed() < Duration::from_secs(5));

    session.close().await;
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_slow_server_within_timeout_succeeds() {
    init_tracing();
    let mut env = HashMap::new();
    env.insert("ECHO_MCP_SLEEP_MS".to_string(), "100".to_string());

    let mut session = StdioSession::connect(&echo_server(env), Duration::from_secs(10))
        .await
        .unwrap();
    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools[0].name, "echo");

    session.close().await;
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_spawn_failure_is_an_error_not_a_hang() {
    init_tracing();
    let invocation = Invocation::new("/nonexistent/tool-server", vec![], HashMap::new());
    let result = StdioSession::connect(&invocation, Duration::from_secs(2)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_manager_lists_tools_of_adhoc_command() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path()).await;

    let reply = mgr
        .get_server_tools(&ServerToolsRequest {
            command: env!("CARGO_BIN_EXE_echo-mcp").to_string(),
            args: vec![],
        })
        .await;
    match reply {
        ToolsReply::Tools { tools } => {
            assert_eq!(tools.len(), 1);
            assert_eq!(tools[0].name, "echo");
        }
        ToolsReply::Error(e) => panic!("unexpected error reply: {}", e.message),
    }
}

#[tokio::test]
async fn test_manager_calls_tool_of_registered_server() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let registry = McpRegistry::new(dir.path()).await;
    registry
        .upsert(
            "echo",
            McpServerConfig::Stdio {
                command: env!("CARGO_BIN_EXE_echo-mcp").to_string(),
                args: vec![],
                type_tag: None,
            },
        )
        .await
        .unwrap();

    let mgr = manager(dir.path()).await;
    let reply = mgr
        .call_tool(&ToolCallRequest {
            server_id: "echo".to_string(),
            name: "echo".to_string(),
            arguments: json!({"message": "round trip"}),
            args: vec![],
        })
        .await;
    match reply {
        CallReply::Result(result) => assert_eq!(result["content"][0]["text"], "round trip"),
        CallReply::Error(e) => panic!("unexpected error reply: {}", e.message),
    }
}

#[tokio::test]
async fn test_manager_timeout_is_a_typed_error() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(LinuxRuntime::new(
        dir.path().to_path_buf(),
        EnvSnapshot::empty(),
    ));
    let mgr = McpToolManager::with_runtime(
        dir.path().to_path_buf(),
        runtime,
        [("ECHO_MCP_STALL".to_string(), "1".to_string())]
            .into_iter()
            .collect::<EnvSnapshot>(),
    )
    .await
    .with_request_timeout(Duration::from_millis(500));

    let started = Instant::now();
    let reply = mgr
        .get_server_tools(&ServerToolsRequest {
            command: env!("CARGO_BIN_EXE_echo-mcp").to_string(),
            args: vec![],
        })
        .await;
    assert!(started.elapsed() < Duration::from_secs(5));
    match reply {
        ToolsReply::Error(e) => {
            assert_eq!(e.kind, "error");
            assert!(e.message.contains("timed out"), "message: {}", e.message);
        }
        ToolsReply::Tools { .. } => panic!("expected timeout error"),
    }
}
