//! Platform-specific command rewriting.
//!
//! `adapt_invocation` is a pure function from a resolved invocation plus a
//! platform family to the invocation actually handed to the spawner. All
//! OS-conditional behavior lives here so call sites never branch on the host
//! OS themselves.

use std::collections::HashMap;

/// The three operating-system families a tool invocation can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    MacOs,
    Windows,
    Linux,
}

impl PlatformFamily {
    /// Detect the family of the host OS.
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Linux => "linux",
        }
    }
}

/// A concrete child-process invocation: executable, argument vector and the
/// full environment map the child inherits. Computed per call, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Invocation {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            env,
        }
    }
}

/// Rewrite an invocation for the quirks of the given platform family.
///
/// - macOS: interpreter commands get UTF-8 stdio encoding, Node-based
///   commands get warning suppression; the `sse` sentinel passes through.
/// - Windows: `.cmd`/`.bat` scripts cannot be spawned directly and are
///   wrapped in `cmd.exe /c`.
/// - Linux: `.sh` scripts are handed to `/bin/bash -c`.
///
/// Anything else passes through unchanged. This function performs no I/O.
pub fn adapt_invocation(invocation: Invocation, family: PlatformFamily) -> Invocation {
    let Invocation { command, args, mut env } = invocation;

    match family {
        PlatformFamily::MacOs => {
            if command == "sse" {
                return Invocation::new(command, args, env);
            }
            if command.contains("python") || command.ends_with(".py") {
                env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
                return Invocation::new(command, args, env);
            }
            if command.contains("node") || command.contains("npm") || command.contains("npx") {
                env.insert("NODE_OPTIONS".to_string(), "--no-warnings".to_string());
                return Invocation::new(command, args, env);
            }
            Invocation::new(command, args, env)
        }
        PlatformFamily::Windows => {
            if command.ends_with(".cmd") || command.ends_with(".bat") {
                let mut wrapped = vec!["/c".to_string(), command];
                wrapped.extend(args);
                return Invocation::new("cmd.exe", wrapped, env);
            }
            Invocation::new(command, args, env)
        }
        PlatformFamily::Linux => {
            if command.ends_with(".sh") {
                let mut line = command;
                for arg in &args {
                    line.push(' ');
                    line.push_str(arg);
                }
                return Invocation::new(
                    "/bin/bash",
                    vec!["-c".to_string(), line],
                    env,
                );
            }
            Invocation::new(command, args, env)
        }
    }
}
