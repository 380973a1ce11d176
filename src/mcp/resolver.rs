//! Logical-command resolution.
//!
//! Maps a declared command line to a concrete invocation backed by the
//! provisioned runtimes. Three families are recognized: the
//! interpreter-isolated runner (`uvx`), the package runner (`npx`) and the
//! event-stream sentinel (`sse`). Anything else passes through unchanged
//! with the caller's environment. Resolution never fails; at worst it
//! degrades to a passthrough.

use std::sync::Arc;

use crate::platform::Invocation;
use crate::runtime::{EnvSnapshot, PlatformRuntime};

/// Outcome of resolving a logical command.
///
/// The two variants carry the same payload but let callers and tests tell a
/// real resolution apart from a best-effort passthrough.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedCommand {
    /// The command was recognized and mapped to a provisioned executable or
    /// transport sentinel.
    Resolved(Invocation),
    /// The command was not recognized (or could not be resolved) and is
    /// returned unchanged.
    Passthrough(Invocation),
}

impl ResolvedCommand {
    pub fn invocation(self) -> Invocation {
        match self {
            Self::Resolved(invocation) | Self::Passthrough(invocation) => invocation,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// Resolver for declared tool-server command lines.
pub struct CommandResolver {
    runtime: Arc<dyn PlatformRuntime>,
    base_env: EnvSnapshot,
}

impl CommandResolver {
    pub fn new(runtime: Arc<dyn PlatformRuntime>, base_env: EnvSnapshot) -> Self {
        Self { runtime, base_env }
    }

    /// Resolve a command declared for `server_id`.
    ///
    /// The command token may itself be a full "runner subcommand..." line;
    /// both `uvx pkg` and `command: "uvx", args: ["pkg"]` forms are accepted.
    pub fn parse_command(
        &self,
        server_id: &str,
        command: &str,
        args: &[String],
    ) -> ResolvedCommand {
        if command == "uvx" || command.starts_with("uvx ") {
            return self.parse_uvx(server_id, command, args);
        }

        if command == "npx" || command.starts_with("npx ") {
            let mut full_args = tail_tokens(command);
            full_args.extend(args.iter().cloned());
            return ResolvedCommand::Resolved(Invocation::new(
                self.runtime.npx_path().display().to_string(),
                full_args,
                self.base_env.to_map(),
            ));
        }

        if command == "sse" || command.starts_with("sse ") {
            let mut full_args = tail_tokens(command);
            full_args.extend(args.iter().cloned());
            return ResolvedCommand::Resolved(Invocation::new(
                "sse",
                full_args,
                self.base_env.to_map(),
            ));
        }

        ResolvedCommand::Passthrough(Invocation::new(
            command,
            args.to_vec(),
            self.base_env.to_map(),
        ))
    }

    /// Resolve an isolated-runner command: the package executes inside the
    /// environment keyed by `server_id`, with the provisioned interpreter,
    /// git and bin directories merged into the child environment and a
    /// verbose diagnostic flag prepended.
    fn parse_uvx(&self, server_id: &str, command: &str, args: &[String]) -> ResolvedCommand {
        let (package, trailing) = if command == "uvx" {
            match args.split_first() {
                Some((package, rest)) => (package.clone(), rest.to_vec()),
                None => {
                    tracing::warn!(server = %server_id, "uvx command without a package, passing through");
                    return ResolvedCommand::Passthrough(Invocation::new(
                        command,
                        args.to_vec(),
                        self.base_env.to_map(),
                    ));
                }
            }
        } else {
            let tokens = tail_tokens(command);
            match tokens.split_first() {
                Some((package, rest)) => {
                    let mut trailing = rest.to_vec();
                    trailing.extend(args.iter().cloned());
                    (package.clone(), trailing)
                }
                None => {
                    tracing::warn!(server = %server_id, "uvx command without a package, passing through");
                    return ResolvedCommand::Passthrough(Invocation::new(
                        command,
                        args.to_vec(),
                        self.base_env.to_map(),
                    ));
                }
            }
        };

        let mut full_args = vec!["--verbose".to_string(), package];
        full_args.extend(trailing);

        ResolvedCommand::Resolved(Invocation::new(
            self.runtime.uvx_path().display().to_string(),
            full_args,
            self.runtime.server_env(server_id),
        ))
    }

    /// Secondary resolution path for registry-declared commands: package
    /// runners map to the provisioned executable, everything else passes
    /// through.
    pub fn resolve_command(&self, command: &str, args: &[String]) -> ResolvedCommand {
        if command == "npx" {
            return ResolvedCommand::Resolved(Invocation::new(
                self.runtime.npx_path().display().to_string(),
                args.to_vec(),
                self.base_env.to_map(),
            ));
        }
        ResolvedCommand::Passthrough(Invocation::new(
            command,
            args.to_vec(),
            self.base_env.to_map(),
        ))
    }
}

fn tail_tokens(command: &str) -> Vec<String> {
    command.split_whitespace().skip(1).map(String::from).collect()
}
