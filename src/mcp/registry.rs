//! Tool-server registry.
//!
//! Persists the `serverId -> config` map to disk at
//! `{data_dir}/extensions/mcp_servers.config.json`. A missing or corrupt
//! file yields an empty registry, never an error. Mutation rewrites the
//! whole file; last writer wins (single-writer-per-session assumption, no
//! file locking).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use super::types::{McpServerConfig, McpServersFile};

/// In-memory registry of declared tool servers with disk persistence.
#[derive(Debug)]
pub struct McpRegistry {
    servers: RwLock<BTreeMap<String, McpServerConfig>>,
    storage_path: PathBuf,
}

impl McpRegistry {
    /// Create a registry backed by the per-user data directory, loading any
    /// existing config file.
    pub async fn new(data_dir: &Path) -> Self {
        let storage_path = data_dir.join("extensions").join("mcp_servers.config.json");
        let servers = Self::load_from_path(&storage_path).await;
        Self {
            servers: RwLock::new(servers),
            storage_path,
        }
    }

    async fn load_from_path(path: &Path) -> BTreeMap<String, McpServerConfig> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No tool-server config file, starting empty");
                return BTreeMap::new();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read tool-server config, starting empty");
                return BTreeMap::new();
            }
        };

        match serde_json::from_str::<McpServersFile>(&contents) {
            Ok(file) => {
                tracing::info!(
                    path = %path.display(),
                    servers = file.mcp_servers.len(),
                    "Loaded tool-server config"
                );
                file.mcp_servers
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt tool-server config, starting empty");
                BTreeMap::new()
            }
        }
    }

    /// Declared server ids, in stable order.
    pub async fn list_servers(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }

    /// Config for one server; unknown ids yield `None`.
    pub async fn get(&self, server_id: &str) -> Option<McpServerConfig> {
        self.servers.read().await.get(server_id).cloned()
    }

    /// Insert or overwrite one entry and rewrite the whole file.
    pub async fn upsert(
        &self,
        server_id: &str,
        config: McpServerConfig,
    ) -> Result<(), std::io::Error> {
        let mut servers = self.servers.write().await;
        servers.insert(server_id.to_string(), config);
        let file = McpServersFile {
            mcp_servers: servers.clone(),
        };
        drop(servers);
        self.save_to_disk(&file).await
    }

    async fn save_to_disk(&self, file: &McpServersFile) -> Result<(), std::io::Error> {
        if let Some(parent) = self.storage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.storage_path, contents).await?;
        tracing::debug!(path = %self.storage_path.display(), "Saved tool-server config");
        Ok(())
    }

    /// Re-read the config file, replacing the in-memory map.
    pub async fn reload(&self) {
        let loaded = Self::load_from_path(&self.storage_path).await;
        *self.servers.write().await = loaded;
    }
}
