//! Caller-facing tool-server facade.
//!
//! Every operation the UI boundary consumes lives here. Failures never
//! escape as errors: each request resolves to a result payload or a typed
//! `{type: "error", message}` reply, and whatever session a request opened
//! is closed before the reply is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use crate::platform::{adapt_invocation, Invocation, PlatformFamily};
use crate::runtime::{runtime_for_host, EnvSnapshot, PlatformRuntime};

use super::installer::McpInstaller;
use super::registry::McpRegistry;
use super::resolver::CommandResolver;
use super::sse_client::SseSession;
use super::stdio_client::StdioSession;
use super::types::{
    CallReply, ErrorReply, McpServerConfig, ServerToolsRequest, ToolCallRequest, ToolDefinition,
    ToolsReply,
};
use super::McpError;

/// Default bound on one protocol exchange, spawn to response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Facade over the registry, resolver, installer and protocol sessions.
pub struct McpToolManager {
    data_dir: PathBuf,
    registry: Arc<McpRegistry>,
    runtime: Arc<dyn PlatformRuntime>,
    resolver: CommandResolver,
    installer: McpInstaller,
    request_timeout: Duration,
}

impl McpToolManager {
    /// Build a manager rooted at the per-user data directory, selecting the
    /// provisioning strategy for the host OS.
    pub async fn new(data_dir: PathBuf, base_env: EnvSnapshot) -> Self {
        let runtime = runtime_for_host(data_dir.clone(), base_env.clone());
        Self::with_runtime(data_dir, runtime, base_env).await
    }

    /// Build a manager with an explicit provisioning strategy.
    pub async fn with_runtime(
        data_dir: PathBuf,
        runtime: Arc<dyn PlatformRuntime>,
        base_env: EnvSnapshot,
    ) -> Self {
        let registry = Arc::new(McpRegistry::new(&data_dir).await);
        let resolver = CommandResolver::new(runtime.clone(), base_env);
        let installer = McpInstaller::new(registry.clone(), runtime.clone());
        Self {
            data_dir,
            registry,
            runtime,
            resolver,
            installer,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The per-user data directory configs and environments live under.
    pub fn working_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn resolve_path(&self, base: &Path, relative: &str) -> PathBuf {
        base.join(relative)
    }

    pub async fn list_servers(&self) -> Vec<String> {
        self.registry.list_servers().await
    }

    pub async fn get_server_config(&self, server_id: &str) -> Option<McpServerConfig> {
        self.registry.get(server_id).await
    }

    /// Install a tool server; `false` on validation or install failure.
    pub async fn install_tool(&self, spec: &str, server_id: &str) -> bool {
        self.installer.install_tool(spec, server_id).await
    }

    /// Ensure the base runtimes for the host OS are provisioned.
    pub async fn initialize_runtimes(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.data_dir.join("runtime")).await?;
        self.runtime.install().await
    }

    /// List the tools of an ad-hoc command line.
    pub async fn get_server_tools(&self, request: &ServerToolsRequest) -> ToolsReply {
        match self.fetch_server_tools(request).await {
            Ok(tools) => ToolsReply::Tools { tools },
            Err(e) => {
                tracing::error!(command = %request.command, error = %e, "Failed to list server tools");
                ToolsReply::Error(e.into())
            }
        }
    }

    async fn fetch_server_tools(
        &self,
        request: &ServerToolsRequest,
    ) -> Result<Vec<ToolDefinition>, McpError> {
        let command = request.command.as_str();
        let resolved = if command == "npx" || command.starts_with("npx ") {
            let mut args = tail_tokens(command);
            args.extend(request.args.iter().cloned());
            self.resolver.resolve_command("npx", &args)
        } else {
            // Isolated environments for ad-hoc requests are keyed by the
            // package argument.
            let tool_id = request
                .args
                .first()
                .cloned()
                .unwrap_or_else(|| "default".to_string());
            self.resolver
                .parse_command(&tool_id, command, &request.args)
        };

        let invocation = adapt_invocation(resolved.invocation(), PlatformFamily::host());
        self.run_list(invocation).await
    }

    /// Invoke one tool of a registered server.
    pub async fn call_tool(&self, request: &ToolCallRequest) -> CallReply {
        match self.dispatch_tool_call(request).await {
            Ok(result) => CallReply::Result(result),
            Err(e) => {
                tracing::error!(
                    server = %request.server_id,
                    tool = %request.name,
                    error = %e,
                    "Tool call failed"
                );
                CallReply::Error(e.into())
            }
        }
    }

    async fn dispatch_tool_call(&self, request: &ToolCallRequest) -> Result<Value, McpError> {
        let config = self.registry.get(&request.server_id).await.ok_or_else(|| {
            McpError::Protocol(format!("unknown tool server: {}", request.server_id))
        })?;

        match config {
            McpServerConfig::Sse { url, .. } => {
                let mut session = SseSession::connect(&url, self.request_timeout).await?;
                let result = session
                    .call_tool(&request.name, request.arguments.clone())
                    .await;
                session.close().await;
                result
            }
            McpServerConfig::Stdio { command, args, .. } => {
                let mut merged = args;
                merged.extend(request.args.iter().cloned());

                let resolved = if command == "npx" || command == "sse" {
                    self.resolver.resolve_command(&command, &merged)
                } else {
                    self.resolver
                        .parse_command(&request.server_id, &command, &merged)
                };
                let invocation = adapt_invocation(resolved.invocation(), PlatformFamily::host());
                self.run_call(invocation, &request.name, request.arguments.clone())
                    .await
            }
        }
    }

    async fn run_list(&self, invocation: Invocation) -> Result<Vec<ToolDefinition>, McpError> {
        if invocation.command == "sse" {
            let url = stream_url(&invocation)?;
            let mut session = SseSession::connect(&url, self.request_timeout).await?;
            let result = session.list_tools().await;
            session.close().await;
            result
        } else {
            let mut session = StdioSession::connect(&invocation, self.request_timeout).await?;
            let result = session.list_tools().await;
            session.close().await;
            result
        }
    }

    async fn run_call(
        &self,
        invocation: Invocation,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        if invocation.command == "sse" {
            let url = stream_url(&invocation)?;
            let mut session = SseSession::connect(&url, self.request_timeout).await?;
            let result = session.call_tool(name, arguments).await;
            session.close().await;
            result
        } else {
            let mut session = StdioSession::connect(&invocation, self.request_timeout).await?;
            let result = session.call_tool(name, arguments).await;
            session.close().await;
            result
        }
    }
}

fn stream_url(invocation: &Invocation) -> Result<String, McpError> {
    invocation
        .args
        .first()
        .cloned()
        .ok_or_else(|| McpError::Protocol("event-stream command without a URL".to_string()))
}

fn tail_tokens(command: &str) -> Vec<String> {
    command.split_whitespace().skip(1).map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::runtime::LinuxRuntime;

    async fn manager(dir: &Path) -> McpToolManager {
        let runtime = Arc::new(LinuxRuntime::new(dir.to_path_buf(), EnvSnapshot::empty()));
        McpToolManager::with_runtime(dir.to_path_buf(), runtime, EnvSnapshot::empty())
            .await
            .with_request_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_unknown_server_yields_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let reply = mgr
            .call_tool(&ToolCallRequest {
                server_id: "missing".to_string(),
                name: "anything".to_string(),
                arguments: json!({}),
                args: vec![],
            })
            .await;
        match reply {
            CallReply::Error(e) => assert!(e.message.contains("missing")),
            CallReply::Result(_) => panic!("expected error reply"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let reply = mgr
            .get_server_tools(&ServerToolsRequest {
                command: "/nonexistent/tool-server".to_string(),
                args: vec![],
            })
            .await;
        match reply {
            ToolsReply::Error(e) => {
                assert_eq!(e.kind, "error");
                assert!(e.message.contains("spawn"));
            }
            ToolsReply::Tools { .. } => panic!("expected error reply"),
        }
    }

    #[tokio::test]
    async fn test_sse_invocation_without_url_yields_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let reply = mgr
            .get_server_tools(&ServerToolsRequest {
                command: "sse".to_string(),
                args: vec![],
            })
            .await;
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_install_then_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        assert!(mgr.install_tool("npx -y server-github", "github").await);
        let config = mgr.get_server_config("github").await.unwrap();
        assert_eq!(
            config,
            McpServerConfig::Stdio {
                command: "npx".to_string(),
                args: vec!["-y".to_string(), "server-github".to_string()],
                type_tag: Some("normal".to_string()),
            }
        );
        assert_eq!(mgr.list_servers().await, vec!["github".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_path_joins() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        assert_eq!(
            mgr.resolve_path(Path::new("/a"), "b/c"),
            PathBuf::from("/a/b/c")
        );
    }
}
