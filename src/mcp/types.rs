//! Wire and configuration types for the tool-server boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared configuration of one tool server.
///
/// Transport-homogeneous by construction: a stdio entry always carries a
/// command line, an event-stream entry always carries a URL, and the serde
/// tag makes a mixed entry unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        type_tag: Option<String>,
    },
    Sse {
        url: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        type_tag: Option<String>,
    },
}

/// On-disk shape of the registry file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

/// One tool advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Payload of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// Typed error reply. Every failure crossing the caller boundary is rendered
/// as one of these, never as a raised error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            message: message.into(),
        }
    }
}

/// Caller request for the tool list of an ad-hoc command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerToolsRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Caller request to invoke one tool of a registered server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(rename = "serverId")]
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Extra arguments appended to the server's configured command line.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Outcome of a `get_server_tools` call.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolsReply {
    Tools { tools: Vec<ToolDefinition> },
    Error(ErrorReply),
}

impl ToolsReply {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Outcome of a `call_tool` call.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CallReply {
    Result(Value),
    Error(ErrorReply),
}

impl CallReply {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}
