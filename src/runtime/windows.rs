//! Windows runtime provisioning strategy.
//!
//! Python comes from the upstream embeddable zip, which ships without pip and
//! with site imports disabled; first-run setup rewrites the `._pth` file and
//! bootstraps pip. Node.js, MinGit and uv come from their upstream release
//! zips. Missing `npm.cmd`/`npx.cmd` launchers are synthesized as thin
//! forwarding scripts.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::platform::PlatformFamily;

use super::{
    download_and_extract, download_file, execute_command, AssetKind, DownloadOptions, EnvLayout,
    EnvSnapshot, IsolatedEnvs, PlatformRuntime, RuntimeAsset, RuntimePaths,
};

const PYTHON_VERSION: &str = "3.13.2";
const NODE_VERSION: &str = "22.11.0";
const GIT_VERSION: &str = "2.47.1";
const UV_VERSION: &str = "0.5.4";
const GET_PIP_URL: &str = "https://bootstrap.pypa.io/get-pip.py";

pub struct WindowsRuntime {
    paths: RuntimePaths,
    base_env: EnvSnapshot,
    envs: IsolatedEnvs,
}

impl WindowsRuntime {
    pub fn new(data_dir: PathBuf, base_env: EnvSnapshot) -> Self {
        let paths = RuntimePaths::new(data_dir);
        let runtime = paths.runtime_dir();
        let python_path = runtime.join("python").join("python.exe");
        let uvx_path = runtime.join("uv").join("uvx.exe");
        let site_packages = runtime.join("python").join("Lib").join("site-packages");
        let envs = IsolatedEnvs::new(
            paths.extensions_dir(),
            python_path,
            uvx_path,
            site_packages,
            EnvLayout::windows(),
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

    fn uv_dir(&self) -> PathBuf {
        self.paths.runtime_dir().join("uv")
    }

    fn site_packages(&self) -> PathBuf {
        self.python_dir().join("Lib").join("site-packages")
    }

    fn python_archive_url(&self) -> String {
        format!(
            "https://www.python.org/ftp/python/{version}/python-{version}-embed-amd64.zip",
            version = PYTHON_VERSION,
        )
    }

    fn node_archive_root(&self) -> String {
        format!("node-v{}-win-x64", NODE_VERSION)
    }

    fn node_archive_url(&self) -> String {
        format!(
            "https://nodejs.org/dist/v{}/{}.zip",
            NODE_VERSION,
            self.node_archive_root()
        )
    }

    fn git_archive_url(&self) -> String {
        format!(
            "https://github.com/git-for-windows/git/releases/download/v{version}.windows.1/MinGit-{version}-64-bit.zip",
            version = GIT_VERSION,
        )
    }

    fn uv_archive_url(&self) -> String {
        format!(
            "https://github.com/astral-sh/uv/releases/download/{}/uv-x86_64-pc-windows-msvc.zip",
            UV_VERSION,
        )
    }

    async fn install_python(&self, options: &DownloadOptions) -> Result<()> {
        download_and_extract(&self.python_archive_url(), &self.python_dir(), options)
            .await
            .context("Failed to provision the Python runtime")?;
        self.enable_site_packages().await?;
        tokio::fs::create_dir_all(self.site_packages()).await?;
        tokio::fs::create_dir_all(self.paths.extensions_dir()).await?;
        self.ensure_pip(options).await?;
        tracing::info!(path = %self.python_path().display(), "Python runtime provisioned");
        Ok(())
    }

    /// The embeddable distribution ships a `pythonXY._pth` file that disables
    /// site imports, which breaks pip and every installed package. Uncomment
    /// `import site` and make sure `Lib\site-packages` is on the module path.
    async fn enable_site_packages(&self) -> Result<()> {
        let pth = self
            .python_dir()
            .join(format!("python{}._pth", python_compact(PYTHON_VERSION)));
        if !pth.exists() {
            return Ok(());
        }

        let contents = tokio::fs::read_to_string(&pth).await?;
        let mut rewritten = contents.replace("#import site", "import site");
        if !rewritten.contains("import site") {
            rewritten.push_str("import site\n");
        }
        if !rewritten.contains("Lib\\site-packages") {
            rewritten.push_str("Lib\\site-packages\n");
        }
        if rewritten != contents {
            tokio::fs::write(&pth, rewritten).await?;
            tracing::info!(path = %pth.display(), "Enabled site-packages for the embeddable runtime");
        }
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

        let extracted = self.paths.runtime_dir().join(self.node_archive_root());
        if extracted.exists() {
            tokio::fs::rename(&extracted, self.node_dir()).await?;
        }
        self.write_npm_wrappers().await?;
        tracing::info!(path = %self.node_path().display(), "Node.js runtime provisioned");
        Ok(())
    }

    /// Synthesize `npm.cmd`/`npx.cmd` forwarding to the bundled CLI scripts
    /// when the release zip did not carry them.
    async fn write_npm_wrappers(&self) -> Result<()> {
        let node_dir = self.node_dir();
        for (name, cli) in [("npm", "npm-cli.js"), ("npx", "npx-cli.js")] {
            let wrapper = node_dir.join(format!("{}.cmd", name));
            if wrapper.exists() {
                continue;
            }
            let script = format!(
                "@ECHO OFF\r\n\"%~dp0\\node.exe\" \"%~dp0\\node_modules\\npm\\bin\\{}\" %*\r\n",
                cli
            );
            tokio::fs::write(&wrapper, script).await?;
            tracing::info!(path = %wrapper.display(), "Synthesized package-runner wrapper");
        }
        Ok(())
    }

    async fn install_git(&self, options: &DownloadOptions) -> Result<()> {
        download_and_extract(&self.git_archive_url(), &self.git_dir(), options)
            .await
            .context("Failed to provision git")?;
        tracing::info!(path = %self.git_path().display(), "git provisioned");
        Ok(())
    }

    async fn install_uv(&self, options: &DownloadOptions) -> Result<()> {
        download_and_extract(&self.uv_archive_url(), &self.uv_dir(), options)
            .await
            .context("Failed to provision uv")?;
        tracing::info!(path = %self.uvx_path().display(), "uv provisioned");
        Ok(())
    }
}

#[async_trait]
impl PlatformRuntime for WindowsRuntime {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Windows
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
                download_source: Some(self.git_archive_url()),
            },
            RuntimeAsset {
                kind: AssetKind::FastPackageInstaller,
                install_path: self.uvx_path(),
                download_source: Some(self.uv_archive_url()),
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
                AssetKind::VersionControl => self.install_git(&options).await?,
                AssetKind::FastPackageInstaller => self.install_uv(&options).await?,
            }
        }
        Ok(())
    }

    fn python_path(&self) -> PathBuf {
        self.python_dir().join("python.exe")
    }

    fn node_path(&self) -> PathBuf {
        self.node_dir().join("node.exe")
    }

    fn uvx_path(&self) -> PathBuf {
        self.uv_dir().join("uvx.exe")
    }

    fn npx_path(&self) -> PathBuf {
        self.node_dir().join("npx.cmd")
    }

    fn git_path(&self) -> PathBuf {
        self.git_dir().join("cmd").join("git.exe")
    }

    fn server_env(&self, server_id: &str) -> HashMap<String, String> {
        let mut env = self.base_env.to_map();

        let mut search: Vec<String> = [
            self.python_dir(),
            self.python_dir().join("Scripts"),
            self.node_dir(),
            self.git_dir().join("cmd"),
            self.uv_dir(),
        ]
        .iter()
        .map(|p| p.display().to_string())
        .collect();
        if let Some(existing) = env.get("PATH") {
            search.push(existing.clone());
        }
        env.insert("PATH".to_string(), search.join(";"));

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
        env
    }

    fn envs(&self) -> &IsolatedEnvs {
        &self.envs
    }
}

/// "3.13.2" -> "313", the version tag used in the `._pth` file name.
fn python_compact(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> WindowsRuntime {
        WindowsRuntime::new(PathBuf::from("C:\\data"), EnvSnapshot::empty())
    }

    #[test]
    fn test_python_archive_is_embeddable_zip() {
        let url = runtime().python_archive_url();
        assert!(url.ends_with("-embed-amd64.zip"));
    }

    #[test]
    fn test_every_asset_has_a_download_source() {
        assert!(runtime().assets().iter().all(|a| a.download_source.is_some()));
    }

    #[test]
    fn test_npx_resolves_to_cmd_launcher() {
        let npx = runtime().npx_path();
        assert_eq!(npx.extension().and_then(|e| e.to_str()), Some("cmd"));
    }

    #[test]
    fn test_python_compact_version_tag() {
        assert_eq!(python_compact("3.13.2"), "313");
    }

    #[tokio::test]
    async fn test_pth_rewrite_enables_site_imports() {
        let dir = tempfile::tempdir().unwrap();
        let rt = WindowsRuntime::new(dir.path().to_path_buf(), EnvSnapshot::empty());
        let pth = rt
            .python_dir()
            .join(format!("python{}._pth", python_compact(PYTHON_VERSION)));
        tokio::fs::create_dir_all(pth.parent().unwrap()).await.unwrap();
        tokio::fs::write(&pth, "python313.zip\n.\n\n#import site\n")
            .await
            .unwrap();

        rt.enable_site_packages().await.unwrap();

        let rewritten = tokio::fs::read_to_string(&pth).await.unwrap();
        assert!(rewritten.contains("\nimport site"));
        assert!(rewritten.contains("Lib\\site-packages"));
        assert!(!rewritten.contains("#import site"));
    }

    #[tokio::test]
    async fn test_pth_rewrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let rt = WindowsRuntime::new(dir.path().to_path_buf(), EnvSnapshot::empty());
        let pth = rt
            .python_dir()
            .join(format!("python{}._pth", python_compact(PYTHON_VERSION)));
        tokio::fs::create_dir_all(pth.parent().unwrap()).await.unwrap();
        tokio::fs::write(&pth, "#import site\n").await.unwrap();

        rt.enable_site_packages().await.unwrap();
        let first = tokio::fs::read_to_string(&pth).await.unwrap();
        rt.enable_site_packages().await.unwrap();
        let second = tokio::fs::read_to_string(&pth).await.unwrap();
        assert_eq!(first, second);
    }
}
