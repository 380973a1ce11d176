//! Per-tool isolated environments.
//!
//! Every tool server gets its own directory under `{data_dir}/extensions`,
//! optionally with a `.venv` virtual interpreter environment inside it.
//! Directory existence is the source of truth: creation is lazy and
//! idempotent, and nothing here ever deletes an environment implicitly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::exec::{execute_command, CommandOutput};
use super::EnvSnapshot;

/// Platform-dependent layout of a virtual environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvLayout {
    /// Subdirectory of a venv holding executables (`bin` or `Scripts`).
    pub venv_bin_dir: &'static str,
    /// Name of the interpreter binary inside that subdirectory.
    pub python_binary: &'static str,
    /// Separator for `PATH`-style variables.
    pub path_separator: char,
}

impl EnvLayout {
    pub fn unix() -> Self {
        Self {
            venv_bin_dir: "bin",
            python_binary: "python3",
            path_separator: ':',
        }
    }

    pub fn windows() -> Self {
        Self {
            venv_bin_dir: "Scripts",
            python_binary: "python.exe",
            path_separator: ';',
        }
    }
}

/// Options for [`IsolatedEnvs::install_package`].
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Install with pip directly instead of the fast installer.
    pub use_pip: bool,
    /// Extra arguments appended to the installer invocation.
    pub extra_args: Vec<String>,
}

/// Manager for per-tool isolated directories and virtual environments.
#[derive(Debug, Clone)]
pub struct IsolatedEnvs {
    extensions_dir: PathBuf,
    python_path: PathBuf,
    uv_path: PathBuf,
    site_packages: PathBuf,
    layout: EnvLayout,
    base_env: EnvSnapshot,
}

impl IsolatedEnvs {
    pub fn new(
        extensions_dir: PathBuf,
        python_path: PathBuf,
        uv_path: PathBuf,
        site_packages: PathBuf,
        layout: EnvLayout,
        base_env: EnvSnapshot,
    ) -> Self {
        Self {
            extensions_dir,
            python_path,
            uv_path,
            site_packages,
            layout,
            base_env,
        }
    }

    /// Root directory of the environment keyed by `env_id`.
    pub fn env_root(&self, env_id: &str) -> PathBuf {
        self.extensions_dir.join(env_id)
    }

    /// Path the isolated interpreter will have once the venv exists.
    pub fn venv_python_path(&self, env_id: &str) -> PathBuf {
        self.env_root(env_id)
            .join(".venv")
            .join(self.layout.venv_bin_dir)
            .join(self.layout.python_binary)
    }

    /// Create the environment directory if it does not exist yet.
    ///
    /// Idempotent: an existing environment is returned as-is.
    pub async fn create(&self, env_id: &str) -> Result<PathBuf> {
        let root = self.env_root(env_id);
        if root.exists() {
            tracing::debug!(env = %env_id, root = %root.display(), "Isolated environment already exists");
            return Ok(root);
        }

        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create isolated environment {}", env_id))?;
        tracing::info!(env = %env_id, root = %root.display(), "Created isolated environment");
        Ok(root)
    }

    /// Materialize `{root}/.venv` with the base interpreter's venv module.
    ///
    /// Idempotent: an existing venv is returned without rerunning the module.
    pub async fn create_virtual_env(&self, env_id: &str) -> Result<PathBuf> {
        let root = self.create(env_id).await?;
        let venv = root.join(".venv");
        if venv.exists() {
            tracing::debug!(env = %env_id, venv = %venv.display(), "Virtual environment already exists");
            return Ok(venv);
        }

        tracing::info!(env = %env_id, venv = %venv.display(), "Creating virtual environment");
        let output = execute_command(
            &self.python_path.to_string_lossy(),
            &["-m".to_string(), "venv".to_string(), venv.to_string_lossy().to_string()],
            Some(&root),
            &self.base_env.to_map(),
        )
        .await
        .context("Failed to run the venv module")?;

        if !output.success() {
            anyhow::bail!("venv creation failed: {}", output.stderr.trim());
        }
        Ok(venv)
    }

    /// Install a package into the isolated directory.
    ///
    /// Prefers the fast installer (uv); `use_pip` forces pip. The installer
    /// runs with `UV_PYTHON` pointed at the isolated interpreter so the
    /// shared base environment is never touched. A non-zero installer exit
    /// is reported as `false`, not an error, so install flows stay
    /// retryable.
    pub async fn install_package(
        &self,
        env_id: &str,
        package: &str,
        options: &InstallOptions,
    ) -> bool {
        let root = match self.create(env_id).await {
            Ok(root) => root,
            Err(e) => {
                tracing::error!(env = %env_id, error = %e, "Failed to prepare isolated environment");
                return false;
            }
        };

        let (command, mut args) = if options.use_pip {
            (
                self.python_path.to_string_lossy().to_string(),
                vec!["-m".to_string(), "pip".to_string(), "install".to_string(), package.to_string()],
            )
        } else {
            (
                self.uv_path.to_string_lossy().to_string(),
                vec!["--verbose".to_string(), package.to_string()],
            )
        };
        args.extend(options.extra_args.iter().cloned());

        let env = self.install_env(&root, env_id);

        match execute_command(&command, &args, None, &env).await {
            Ok(output) if output.success() => {
                tracing::info!(env = %env_id, package = %package, "Installed package");
                true
            }
            Ok(output) => {
                tracing::error!(
                    env = %env_id,
                    package = %package,
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Package install failed"
                );
                false
            }
            Err(e) => {
                tracing::error!(env = %env_id, package = %package, error = %e, "Package installer did not start");
                false
            }
        }
    }

    /// Install every requirement listed in a requirements file.
    pub async fn install_requirements(&self, env_id: &str, requirements: &Path) -> bool {
        if !requirements.exists() {
            tracing::error!(
                env = %env_id,
                path = %requirements.display(),
                "Requirements file does not exist"
            );
            return false;
        }
        let root = match self.create(env_id).await {
            Ok(root) => root,
            Err(e) => {
                tracing::error!(env = %env_id, error = %e, "Failed to prepare isolated environment");
                return false;
            }
        };
        let args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "-r".to_string(),
            requirements.to_string_lossy().to_string(),
        ];
        let env = self.install_env(&root, env_id);

        match execute_command(&self.python_path.to_string_lossy(), &args, None, &env).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::error!(env = %env_id, stderr = %output.stderr.trim(), "Requirements install failed");
                false
            }
            Err(e) => {
                tracing::error!(env = %env_id, error = %e, "Requirements install did not start");
                false
            }
        }
    }

    /// Run a command inside the environment.
    ///
    /// The tool directory shadows the base interpreter's site-packages on
    /// `PYTHONPATH` so tool-specific dependencies win. A bare `uvx` command
    /// is rewritten to the base interpreter's `-m uv`.
    pub async fn run_in_env(
        &self,
        env_id: &str,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput> {
        let root = self.env_root(env_id);
        if !root.exists() {
            anyhow::bail!("isolated environment does not exist: {}", env_id);
        }

        let mut env = self.base_env.to_map();
        let inherited = env.get("PYTHONPATH").cloned().unwrap_or_default();
        let mut python_path = vec![
            root.to_string_lossy().to_string(),
            self.site_packages.to_string_lossy().to_string(),
        ];
        if !inherited.is_empty() {
            python_path.push(inherited);
        }
        env.insert(
            "PYTHONPATH".to_string(),
            python_path.join(&self.layout.path_separator.to_string()),
        );

        let (command, args) = if command == "uvx" {
            let mut rewritten = vec!["-m".to_string(), "uv".to_string()];
            rewritten.extend(args.iter().cloned());
            (self.python_path.to_string_lossy().to_string(), rewritten)
        } else {
            (command.to_string(), args.to_vec())
        };

        execute_command(&command, &args, cwd, &env).await
    }

    /// List package names installed in the environment's venv.
    ///
    /// Any failure (missing venv, pip error) yields an empty list.
    pub async fn list_packages(&self, env_id: &str) -> Vec<String> {
        let python = self.venv_python_path(env_id);
        if !python.exists() {
            tracing::debug!(env = %env_id, "No venv interpreter, reporting no packages");
            return Vec::new();
        }

        let args = vec!["-m".to_string(), "pip".to_string(), "list".to_string()];
        match execute_command(&python.to_string_lossy(), &args, None, &self.base_env.to_map()).await
        {
            Ok(output) if output.success() => parse_pip_list(&output.stdout),
            Ok(output) => {
                tracing::warn!(env = %env_id, stderr = %output.stderr.trim(), "pip list failed");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(env = %env_id, error = %e, "pip list did not start");
                Vec::new()
            }
        }
    }

    fn install_env(&self, root: &Path, env_id: &str) -> HashMap<String, String> {
        let mut env = self.base_env.to_map();

        // Point the fast installer at the isolated interpreter when one
        // exists; fall back to the base interpreter otherwise.
        let venv_python = self.venv_python_path(env_id);
        let uv_python = if venv_python.exists() {
            venv_python
        } else {
            self.python_path.clone()
        };
        env.insert("UV_PYTHON".to_string(), uv_python.to_string_lossy().to_string());

        let inherited = env.get("PYTHONPATH").cloned().unwrap_or_default();
        let python_path = if inherited.is_empty() {
            root.to_string_lossy().to_string()
        } else {
            format!(
                "{}{}{}",
                root.to_string_lossy(),
                self.layout.path_separator,
                inherited
            )
        };
        env.insert("PYTHONPATH".to_string(), python_path);
        env
    }
}

/// Parse `pip list` output into package names, skipping the header rows.
fn parse_pip_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(2)
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(extensions_dir: &Path) -> IsolatedEnvs {
        IsolatedEnvs::new(
            extensions_dir.to_path_buf(),
            PathBuf::from("/nonexistent/python3"),
            PathBuf::from("/nonexistent/uvx"),
            PathBuf::from("/nonexistent/site-packages"),
            EnvLayout::unix(),
            EnvSnapshot::empty(),
        )
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let envs = envs(dir.path());

        let first = envs.create("server-a").await.unwrap();
        let second = envs.create("server-a").await.unwrap();
        assert_eq!(first, second);
        assert!(first.exists());
    }

    #[tokio::test]
    async fn test_venv_python_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let envs = envs(dir.path());
        let path = envs.venv_python_path("srv");
        assert_eq!(path, dir.path().join("srv").join(".venv").join("bin").join("python3"));
    }

    #[tokio::test]
    async fn test_install_failure_is_false_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let envs = envs(dir.path());
        let ok = envs
            .install_package("srv", "mcp-server-time", &InstallOptions::default())
            .await;
        assert!(!ok);
        // The environment directory itself was still created lazily.
        assert!(envs.env_root("srv").exists());
    }

    #[tokio::test]
    async fn test_run_in_missing_env_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let envs = envs(dir.path());
        assert!(envs.run_in_env("ghost", "true", &[], None).await.is_err());
    }

    #[tokio::test]
    async fn test_list_packages_without_venv_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let envs = envs(dir.path());
        assert!(envs.list_packages("srv").await.is_empty());
    }

    #[test]
    fn test_parse_pip_list_skips_header() {
        let stdout = "Package    Version\n---------- -------\npip        24.0\nuv         0.4.1\n";
        assert_eq!(parse_pip_list(stdout), vec!["pip", "uv"]);
    }
}
