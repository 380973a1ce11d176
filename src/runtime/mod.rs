//! Base-runtime provisioning.
//!
//! A tool server declared as `uvx ...` or `npx ...` needs a working Python,
//! Node.js, git and uv on the machine before anything can be spawned. This
//! module provisions those runtime assets into a per-user directory, exposes
//! computed paths to them, and builds the environment maps spawned tool
//! processes inherit.
//!
//! One [`PlatformRuntime`] strategy is selected at startup from the host OS;
//! shared call sites never branch on the OS themselves (see
//! [`crate::platform`] for the one remaining pure rewrite step).

mod download;
mod envs;
mod exec;
mod linux;
mod macos;
mod windows;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::platform::PlatformFamily;

pub use download::{download_and_extract, download_file, DownloadError, DownloadOptions};
pub use envs::{EnvLayout, InstallOptions, IsolatedEnvs};
pub use exec::{execute_command, CommandOutput};
pub use linux::LinuxRuntime;
pub use macos::MacRuntime;
pub use windows::WindowsRuntime;

/// Immutable snapshot of the process environment, captured once at startup.
///
/// Every child environment map is built from this snapshot rather than from
/// the live process environment, so concurrent spawns never observe each
/// other's mutations.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// An empty snapshot, mainly for tests.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// A fresh mutable copy of the snapshot.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.vars.clone()
    }
}

impl FromIterator<(String, String)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Kinds of base runtime assets provisioned per machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Interpreter,
    JsRuntime,
    VersionControl,
    FastPackageInstaller,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interpreter => "interpreter",
            Self::JsRuntime => "js-runtime",
            Self::VersionControl => "version-control",
            Self::FastPackageInstaller => "fast-package-installer",
        }
    }
}

/// A provisionable runtime asset. Presence of `install_path` on disk is the
/// idempotence gate: an existing target executable is never reinstalled or
/// auto-upgraded.
#[derive(Debug, Clone)]
pub struct RuntimeAsset {
    pub kind: AssetKind,
    pub install_path: PathBuf,
    /// Archive URL, if the asset is downloadable on this platform. Assets
    /// without a source are provisioned as a side effect of another asset's
    /// first-run setup, or ship with the application bundle.
    pub download_source: Option<String>,
}

impl RuntimeAsset {
    pub fn installed(&self) -> bool {
        self.install_path.exists()
    }
}

/// One per-OS provisioning strategy.
///
/// Path accessors are computed, not cached; `server_env` builds the full
/// environment map a spawned tool process inherits.
#[async_trait]
pub trait PlatformRuntime: Send + Sync {
    /// The OS family this strategy serves.
    fn family(&self) -> PlatformFamily;

    /// The runtime assets this strategy manages, with their gating paths.
    fn assets(&self) -> Vec<RuntimeAsset>;

    /// Ensure every runtime asset is present; download and configure the
    /// missing ones. Idempotent: gating is on target-executable existence,
    /// so a failed attempt never corrupts a later retry.
    async fn install(&self) -> Result<()>;

    /// Base interpreter executable.
    fn python_path(&self) -> PathBuf;

    /// JS runtime executable.
    fn node_path(&self) -> PathBuf;

    /// Fast package runner (uvx) executable.
    fn uvx_path(&self) -> PathBuf;

    /// Node package runner (npx) executable.
    fn npx_path(&self) -> PathBuf;

    /// Version-control client executable.
    fn git_path(&self) -> PathBuf;

    /// Environment map for a tool server process: all provisioned bin
    /// directories prepended to the search path, the isolated-env
    /// interpreter pinned via `UV_PYTHON`, and the managed git pinned for
    /// libraries that shell out to it.
    fn server_env(&self, server_id: &str) -> HashMap<String, String>;

    /// The isolated-environment manager backed by this runtime.
    fn envs(&self) -> &IsolatedEnvs;
}

/// Select the provisioning strategy for the host OS.
pub fn runtime_for_host(data_dir: PathBuf, base_env: EnvSnapshot) -> Arc<dyn PlatformRuntime> {
    match PlatformFamily::host() {
        PlatformFamily::Windows => Arc::new(WindowsRuntime::new(data_dir, base_env)),
        PlatformFamily::MacOs => Arc::new(MacRuntime::new(data_dir, base_env)),
        PlatformFamily::Linux => Arc::new(LinuxRuntime::new(data_dir, base_env)),
    }
}

/// Create the per-user runtime directory and install the host's runtimes.
pub async fn initialize_runtimes(data_dir: &Path, base_env: &EnvSnapshot) -> Result<()> {
    tokio::fs::create_dir_all(data_dir.join("runtime")).await?;
    let runtime = runtime_for_host(data_dir.to_path_buf(), base_env.clone());
    runtime.install().await
}

/// Shared layout of the per-user data directory.
#[derive(Debug, Clone)]
pub(crate) struct RuntimePaths {
    data_dir: PathBuf,
}

impl RuntimePaths {
    pub(crate) fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub(crate) fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join("runtime")
    }

    pub(crate) fn extensions_dir(&self) -> PathBuf {
        self.data_dir.join("extensions")
    }
}

/// Mark a file executable on unix; a no-op elsewhere.
pub(crate) async fn mark_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            let mut perms = tokio::fs::metadata(path).await?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            tokio::fs::set_permissions(path, perms).await?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_snapshot_is_detached_copy() {
        let snapshot = EnvSnapshot::empty();
        let mut map = snapshot.to_map();
        map.insert("INJECTED".to_string(), "1".to_string());
        assert!(snapshot.get("INJECTED").is_none());
    }

    #[tokio::test]
    async fn test_asset_presence_gates_on_target_executable() {
        // The gate is the executable path itself: a directory left behind by
        // a failed install does not mark the asset installed.
        let dir = tempfile::tempdir().unwrap();
        let runtime = LinuxRuntime::new(dir.path().to_path_buf(), EnvSnapshot::empty());

        let interpreter = runtime
            .assets()
            .into_iter()
            .find(|a| a.kind == AssetKind::Interpreter)
            .unwrap();
        assert!(!interpreter.installed());

        tokio::fs::create_dir_all(interpreter.install_path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&interpreter.install_path, b"").await.unwrap();
        assert!(interpreter.installed());
    }

    #[test]
    fn test_host_strategy_matches_host_family() {
        let runtime = runtime_for_host(PathBuf::from("/tmp/toolhost"), EnvSnapshot::empty());
        assert_eq!(runtime.family(), PlatformFamily::host());
    }
}
