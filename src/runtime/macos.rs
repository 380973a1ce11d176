//! macOS runtime provisioning strategy.
//!
//! Python comes from a standalone relocatable CPython build, Node.js from the
//! upstream release tarballs. uv is installed into the managed interpreter
//! with pip, which puts `uvx` next to the interpreter binary. git is expected
//! to ship with the application bundle and is only presence-checked.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::platform::PlatformFamily;

use super::{
    download_and_extract, download_file, execute_command, mark_executable, AssetKind,
    DownloadOptions, EnvLayout, EnvSnapshot, IsolatedEnvs, PlatformRuntime, RuntimeAsset,
    RuntimePaths,
};

const PYTHON_VERSION: &str = "3.13.2";
const PYTHON_BUILD: &str = "20250212";
const NODE_VERSION: &str = "22.11.0";
const GET_PIP_URL: &str = "https://bootstrap.pypa.io/get-pip.py";

pub struct MacRuntime {
    paths: RuntimePaths,
    base_env: EnvSnapshot,
    envs: IsolatedEnvs,
}

impl MacRuntime {
    pub fn new(data_dir: PathBuf, base_env: EnvSnapshot) -> Self {
        let paths = RuntimePaths::new(data_dir);
        let runtime = paths.runtime_dir();
        let python_path = runtime.join("python").join("bin").join("python3");
        let uvx_path = runtime.join("python").join("bin").join("uvx");
        let site_packages = runtime
            .join("python")
            .join("lib")
            .join(format!("python{}", python_minor(PYTHON_VERSION)))
            .join("site-packages");
        let envs = IsolatedEnvs::new(
            paths.extensions_dir(),
            python_path,
            uvx_path,
            site_packages,
            EnvLayout::unix(),
            base_env.clone(),
        );
        Self {
            paths,
            base_env,
            envs,
        }
    }

    fn python_dir(&self) -> PathBuf {
        self.paths.runtime_dir().join("python")
    }

    fn node_dir(&self) -> PathBuf {
        self.paths.runtime_dir().join("nodejs")
    }

    fn git_dir(&self) -> PathBuf {
        self.paths.runtime_dir().join("git")
    }

    fn site_packages(&self) -> PathBuf {
        self.python_dir()
            .join("lib")
            .join(format!("python{}", python_minor(PYTHON_VERSION)))
            .join("site-packages")
    }

    fn python_archive_url(&self) -> String {
        let arch = if cfg!(target_arch = "aarch64") {
            "aarch64"
        } else {
            "x86_64"
        };
        format!(
            "https://github.com/astral-sh/python-build-standalone/releases/download/{build}/cpython-{version}+{build}-{arch}-apple-darwin-install_only.tar.gz",
            build = PYTHON_BUILD,
            version = PYTHON_VERSION,
            arch = arch,
        )
    }

    fn node_archive_root(&self) -> String {
        let arch = if cfg!(target_arch = "aarch64") {
            "arm64"
        } else {
            "x64"
        };
        format!("node-v{}-darwin-{}", NODE_VERSION, arch)
    }

    fn node_archive_url(&self) -> String {
        format!(
            "https://nodejs.org/dist/v{}/{}.tar.gz",
            NODE_VERSION,
            self.node_archive_root()
        )
    }

    async fn install_python(&self, options: &DownloadOptions) -> Result<()> {
        download_and_extract(&self.python_archive_url(), &self.paths.runtime_dir(), options)
            .await
            .context("Failed to provision the Python runtime")?;
        mark_executable(&self.python_path()).await?;
        tokio::fs::create_dir_all(self.site_packages()).await?;
        tokio::fs::create_dir_all(self.paths.extensions_dir()).await?;
        self.ensure_pip(options).await?;
        tracing::info!(path = %self.python_path().display(), "Python runtime provisioned");
        Ok(())
    }

    async fn ensure_pip(&self, options: &DownloadOptions) -> Result<()> {
        let python = self.python_path();
        let check = execute_command(
            &python.to_string_lossy(),
            &["-m".to_string(), "pip".to_string(), "--version".to_string()],
            None,
            &self.base_env.to_map(),
        )
        .await?;
        if check.success() {
            return Ok(());
        }

        tracing::info!("Bootstrapping pip into the managed interpreter");
        let script = options
            .temp_dir
            .join(format!("get-pip-{}.py", Uuid::new_v4()));
        download_file(GET_PIP_URL, &script, options)
            .await
            .context("Failed to download the pip bootstrap script")?;
        let result = execute_command(
            &python.to_string_lossy(),
            &[script.to_string_lossy().to_string()],
            None,
            &self.base_env.to_map(),
        )
        .await;
        let _ = tokio::fs::remove_file(&script).await;

        let output = result?;
        if !output.success() {
            bail!("pip bootstrap failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn install_node(&self, options: &DownloadOptions) -> Result<()> {
        download_and_extract(&self.node_archive_url(), &self.paths.runtime_dir(), options)
            .await
            .context("Failed to provision the Node.js runtime")?;

        // The release tarball carries a versioned top-level directory.
        let extracted = self.paths.runtime_dir().join(self.node_archive_root());
        if extracted.exists() {
            tokio::fs::rename(&extracted, self.node_dir()).await?;
        }
        for bin in ["node", "npm", "npx"] {
            mark_executable(&self.node_dir().join("bin").join(bin)).await?;
        }
        tracing::info!(path = %self.node_path().display(), "Node.js runtime provisioned");
        Ok(())
    }

    /// Install uv into the managed interpreter; `uvx` lands next to it. If
    /// the install succeeds but the launcher is still missing, a forwarding
    /// wrapper is synthesized so `uvx ...` commands keep working.
    async fn install_uv(&self) -> Result<()> {
        let python = self.python_path();
        if !python.exists() {
            bail!("Cannot install uv before the Python runtime is provisioned");
        }

        let output = execute_command(
            &python.to_string_lossy(),
            &[
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "uv".to_string(),
            ],
            None,
            &self.base_env.to_map(),
        )
        .await?;
        if !output.success() {
            tracing::warn!(stderr = %output.stderr.trim(), "pip install uv failed");
        }

        if !self.uvx_path().exists() {
            self.write_uvx_wrapper().await?;
        }
        tracing::info!(path = %self.uvx_path().display(), "uv provisioned");
        Ok(())
    }

    async fn write_uvx_wrapper(&self) -> Result<()> {
        let wrapper = self.uvx_path();
        let script = format!(
            "#!/bin/sh\nexec \"{}\" -m uv tool run \"$@\"\n",
            self.python_path().display()
        );
        tokio::fs::write(&wrapper, script).await?;
        mark_executable(&wrapper).await
    }
}

#[async_trait]
impl PlatformRuntime for MacRuntime {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::MacOs
    }

    fn assets(&self) -> Vec<RuntimeAsset> {
        vec![
            RuntimeAsset {
                kind: AssetKind::Interpreter,
                install_path: self.python_path(),
                download_source: Some(self.python_archive_url()),
            },
            RuntimeAsset {
                kind: AssetKind::JsRuntime,
                install_path: self.node_path(),
                download_source: Some(self.node_archive_url()),
            },
            RuntimeAsset {
                kind: AssetKind::VersionControl,
                install_path: self.git_path(),
                download_source: None,
            },
            RuntimeAsset {
                kind: AssetKind::FastPackageInstaller,
                install_path: self.uvx_path(),
                download_source: None,
            },
        ]
    }

    async fn install(&self) -> Result<()> {
        let options = DownloadOptions::new(std::env::temp_dir());
        for asset in self.assets() {
            if asset.installed() {
                tracing::debug!(asset = asset.kind.as_str(), "Runtime asset already installed");
                continue;
            }
            match asset.kind {
                AssetKind::Interpreter => self.install_python(&options).await?,
                AssetKind::JsRuntime => self.install_node(&options).await?,
                AssetKind::VersionControl => {
                    tracing::warn!(
                        path = %asset.install_path.display(),
                        "Managed git not found; tools will fall back to the system git"
                    );
                }
                AssetKind::FastPackageInstaller => self.install_uv().await?,
            }
        }
        Ok(())
    }

    fn python_path(&self) -> PathBuf {
        self.python_dir().join("bin").join("python3")
    }

    fn node_path(&self) -> PathBuf {
        self.node_dir().join("bin").join("node")
    }

    fn uvx_path(&self) -> PathBuf {
        self.python_dir().join("bin").join("uvx")
    }

    fn npx_path(&self) -> PathBuf {
        self.node_dir().join("bin").join("npx")
    }

    fn git_path(&self) -> PathBuf {
        self.git_dir().join("bin").join("git")
    }

    fn server_env(&self, server_id: &str) -> HashMap<String, String> {
        let mut env = self.base_env.to_map();

        let mut search: Vec<String> = [
            self.python_dir().join("bin"),
            self.node_dir().join("bin"),
            self.git_dir().join("bin"),
        ]
        .iter()
        .map(|p| p.display().to_string())
        .collect();
        if let Some(existing) = env.get("PATH") {
            search.push(existing.clone());
        }
        env.insert("PATH".to_string(), search.join(":"));

        let venv_python = self.envs.venv_python_path(server_id);
        let uv_python = if venv_python.exists() {
            venv_python
        } else {
            self.python_path()
        };
        env.insert("UV_PYTHON".to_string(), uv_python.display().to_string());
        env.insert(
            "GIT_PYTHON_GIT_EXECUTABLE".to_string(),
            self.git_path().display().to_string(),
        );
        env.insert(
            "NODE_PATH".to_string(),
            self.node_dir().join("lib").join("node_modules").display().to_string(),
        );
        env
    }

    fn envs(&self) -> &IsolatedEnvs {
        &self.envs
    }
}

fn python_minor(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}
