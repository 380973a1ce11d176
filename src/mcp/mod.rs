//! Tool-server orchestration.
//!
//! Turns declarative tool-server configs ("run this package with this
//! runner", "connect to this event stream") into concrete child processes or
//! network connections, runs exactly one protocol exchange per request, and
//! guarantees teardown of whatever was spawned.
//!
//! Layering, bottom up: [`registry`] persists `serverId -> config`,
//! [`resolver`] maps logical commands to provisioned executables,
//! [`installer`] writes new registry entries, [`stdio_client`] and
//! [`sse_client`] each drive one protocol session, and [`manager`] is the
//! caller-facing facade that never lets an error escape untyped.

pub mod installer;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod sse_client;
pub mod stdio_client;
pub mod types;

use std::time::Duration;

use thiserror::Error;

pub use installer::McpInstaller;
pub use manager::McpToolManager;
pub use registry::McpRegistry;
pub use resolver::{CommandResolver, ResolvedCommand};
pub use sse_client::SseSession;
pub use stdio_client::StdioSession;
pub use types::{
    CallReply, ErrorReply, McpServerConfig, McpServersFile, ServerToolsRequest, ToolCallRequest,
    ToolDefinition, ToolsReply,
};

/// Protocol version spoken to tool servers.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Lifecycle of one protocol session. `Closed` is terminal and reached via
/// an unconditional cleanup path even when the session never connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connected,
    AwaitingResponse,
    Completed,
    Failed,
    Closed,
}

/// Failures inside a protocol session. The manager converts every one of
/// these into an [`ErrorReply`] before it reaches a caller.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool server closed the connection")]
    Disconnected,
    #[error("tool server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<McpError> for ErrorReply {
    fn from(error: McpError) -> Self {
        ErrorReply::new(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_converts_to_typed_reply() {
        let reply: ErrorReply = McpError::Timeout(Duration::from_secs(3)).into();
        assert_eq!(reply.kind, "error");
        assert!(reply.message.contains("timed out"));
    }
}
