//! Child-process execution helper for provisioning and package installs.
//!
//! Every subprocess started here runs with an explicitly supplied environment
//! map rather than inheriting the live process environment, so concurrent
//! installs cannot observe each other's mutations.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Captured output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command to completion, capturing stdout and stderr.
///
/// The child inherits exactly `env` and nothing else. A missing exit code
/// (killed by signal) is reported as -1.
pub async fn execute_command(
    command: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<CommandOutput> {
    tracing::debug!(command = %command, args = ?args, "Executing command");

    let mut cmd = Command::new(command);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", command))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    };

    if !result.success() {
        tracing::debug!(
            command = %command,
            exit_code = result.exit_code,
            stderr = %result.stderr.trim(),
            "Command finished with non-zero exit"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let out = execute_command("sh", &["-c".into(), "echo hello".into()], None, &HashMap::new())
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let out = execute_command("sh", &["-c".into(), "exit 3".into()], None, &HashMap::new())
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let result =
            execute_command("definitely-not-a-binary", &[], None, &HashMap::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_env_is_exactly_what_was_passed() {
        let mut env = HashMap::new();
        env.insert("TOOLHOST_EXEC_MARKER".to_string(), "present".to_string());
        let out = execute_command(
            "sh",
            &["-c".into(), "printf '%s' \"$TOOLHOST_EXEC_MARKER\"".into()],
            None,
            &env,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "present");
    }

    #[tokio::test]
    async fn test_parent_env_is_not_inherited() {
        // HOME is set in any interactive or CI parent environment; it must
        // not leak into a child spawned with an explicit map.
        if std::env::var_os("HOME").is_none() {
            return;
        }
        let out = execute_command(
            "sh",
            &["-c".into(), "printf '%s' \"${HOME:+inherited}\"".into()],
            None,
            &HashMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "");
    }
}
