//! Tool installation.
//!
//! "Installing" a tool server mostly means writing its registry entry; only
//! the isolated-runner family materializes anything on disk (a virtual
//! environment keyed by the server id). Every failure is reported as a
//! boolean `false` with a log line, never an error, so callers can retry
//! freely.

use std::sync::Arc;

use url::Url;

use crate::runtime::PlatformRuntime;

use super::registry::McpRegistry;
use super::types::McpServerConfig;

/// Logical families an install spec can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Npx,
    Sse,
    Uvx,
    Default,
}

/// A parsed install spec: family, remaining arguments and a derived package
/// identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInstall {
    pub family: CommandFamily,
    pub args: Vec<String>,
    pub package_id: String,
}

/// Installs tool servers into the registry.
pub struct McpInstaller {
    registry: Arc<McpRegistry>,
    runtime: Arc<dyn PlatformRuntime>,
}

impl McpInstaller {
    pub fn new(registry: Arc<McpRegistry>, runtime: Arc<dyn PlatformRuntime>) -> Self {
        Self { registry, runtime }
    }

    /// Install a tool server from a package spec or command line.
    ///
    /// Validation failures and install failures both return `false` and
    /// leave the registry untouched.
    pub async fn install_tool(&self, spec: &str, server_id: &str) -> bool {
        let spec = spec.trim();
        let server_id = server_id.trim();
        if spec.is_empty() {
            tracing::error!("Tool install rejected: empty package spec");
            return false;
        }
        if server_id.is_empty() {
            tracing::error!("Tool install rejected: empty server id");
            return false;
        }

        let parsed = parse_install_command(spec);
        tracing::info!(
            server = %server_id,
            family = ?parsed.family,
            package = %parsed.package_id,
            "Installing tool server"
        );

        if parsed.family == CommandFamily::Uvx {
            if let Err(e) = self.runtime.envs().create_virtual_env(server_id).await {
                tracing::error!(server = %server_id, error = %e, "Failed to create isolated environment");
                return false;
            }
        }

        // --verbose belongs to the runner invocation, not the declared
        // command line.
        let args: Vec<String> = parsed
            .args
            .iter()
            .filter(|arg| arg.as_str() != "--verbose")
            .cloned()
            .collect();

        let config = match parsed.family {
            CommandFamily::Npx => McpServerConfig::Stdio {
                command: "npx".to_string(),
                args,
                type_tag: Some("normal".to_string()),
            },
            CommandFamily::Sse => match args.first().filter(|arg| is_stream_url(arg)) {
                Some(url) => McpServerConfig::Sse {
                    url: url.clone(),
                    type_tag: None,
                },
                None => {
                    tracing::warn!(server = %server_id, "Event-stream install without a URL argument");
                    McpServerConfig::Stdio {
                        command: "sse".to_string(),
                        args,
                        type_tag: Some("normal".to_string()),
                    }
                }
            },
            CommandFamily::Uvx => McpServerConfig::Stdio {
                command: "uvx".to_string(),
                args,
                type_tag: Some("normal".to_string()),
            },
            CommandFamily::Default => McpServerConfig::Stdio {
                command: "uvx".to_string(),
                args: vec![spec.to_string()],
                type_tag: Some("normal".to_string()),
            },
        };

        match self.registry.upsert(server_id, config).await {
            Ok(()) => {
                tracing::info!(server = %server_id, "Tool server installed");
                true
            }
            Err(e) => {
                tracing::error!(server = %server_id, error = %e, "Failed to write tool-server config");
                false
            }
        }
    }
}

/// Split an install spec into its command family, arguments and package id.
pub fn parse_install_command(spec: &str) -> ParsedInstall {
    let parts: Vec<String> = spec.split_whitespace().map(String::from).collect();
    let head = parts.first().map(String::as_str).unwrap_or("");

    if head == "npx" || head == "uvx" {
        let family = if head == "npx" {
            CommandFamily::Npx
        } else {
            CommandFamily::Uvx
        };
        let args = parts[1..].to_vec();
        let package_id = extract_package_id(family, &args);
        return ParsedInstall {
            family,
            args,
            package_id,
        };
    }

    if is_stream_url(head) {
        let package_id = Url::parse(head)
            .ok()
            .and_then(|url| url.host_str().map(|host| format!("sse-{}", host)))
            .unwrap_or_else(|| "sse-default".to_string());
        return ParsedInstall {
            family: CommandFamily::Sse,
            args: parts,
            package_id,
        };
    }

    // Legacy spellings: "sse <url>" and "sse-<name>".
    if head == "sse" || head.starts_with("sse-") {
        let args: Vec<String> = if head == "sse" {
            parts[1..].to_vec()
        } else {
            let mut args = vec![head[4..].to_string()];
            args.extend(parts[1..].iter().cloned());
            args
        };
        let package_id = args
            .first()
            .cloned()
            .unwrap_or_else(|| "sse-default".to_string());
        return ParsedInstall {
            family: CommandFamily::Sse,
            args,
            package_id,
        };
    }

    ParsedInstall {
        family: CommandFamily::Default,
        args: vec![spec.to_string()],
        package_id: spec.to_string(),
    }
}

/// Derive a package id from runner arguments: the first non-flag argument,
/// with any npm version suffix stripped.
fn extract_package_id(family: CommandFamily, args: &[String]) -> String {
    let Some(package) = args.iter().find(|arg| !arg.starts_with('-')) else {
        let joined = args.join("_");
        return joined
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
    };

    if family == CommandFamily::Npx && package.contains('@') {
        return strip_version(package);
    }
    package.clone()
}

/// "pkg@1.2" -> "pkg", "@scope/pkg@1.2" -> "@scope/pkg"; a bare scope marker
/// is left alone.
fn strip_version(package: &str) -> String {
    match package.rfind('@') {
        Some(idx) if idx > 0 => package[..idx].to_string(),
        _ => package.to_string(),
    }
}

fn is_stream_url(token: &str) -> bool {
    ["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|scheme| token.starts_with(scheme))
}
