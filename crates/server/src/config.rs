use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weaver_core::events::{EventLog, MemoryEventLog};
use weaver_core::storage::{JsonlEventLog, MemoryWorkflowStore, RedbWorkflowStore, WorkflowStore};
use weaver_core::workflow::{SimulatedRemoteClient, StepRegistry};
use weaver_core::{EngineSettings, WorkflowService};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub server: HttpConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Keep workflows, states and events in memory only
    #[serde(default)]
    pub in_memory: bool,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "workflows.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the workflow index path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WorkflowService>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let (store, event_log): (Arc<dyn WorkflowStore>, Arc<dyn EventLog>) =
            if config.storage.in_memory {
                tracing::info!("Using in-memory storage");
                (
                    Arc::new(MemoryWorkflowStore::new()),
                    Arc::new(MemoryEventLog::new()),
                )
            } else {
                let store = RedbWorkflowStore::new(config.index_path())
                    .context("Failed to create workflow store")?;
                let event_log = JsonlEventLog::new(config.event_log_path())
                    .context("Failed to create event log")?;
                (Arc::new(store), Arc::new(event_log))
            };

        // The remote ML service is simulated in-process.
        let registry = StepRegistry::with_builtin_steps(Arc::new(SimulatedRemoteClient::new()));

        let service = WorkflowService::new(
            config.engine.clone(),
            Arc::new(registry),
            store,
            event_log,
        );

        Ok(Self {
            service: Arc::new(service),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config =
            ServerConfig::load(&temp_dir.path().join("weaver.toml"), temp_dir.path().join("data"))
                .unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(!config.storage.in_memory);
        assert_eq!(config.engine, EngineSettings::default());
        assert!(temp_dir.path().join("data").exists());
    }

    #[test]
    fn test_partial_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("weaver.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9200

[engine]
multi_tenancy_enabled = true
max_active_provisions_per_tenant = 5
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path, temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.engine.multi_tenancy_enabled);
        assert_eq!(config.engine.max_active_provisions_per_tenant, 5);
        assert_eq!(config.engine.max_workflow_steps, 50);
        assert_eq!(config.index_path(), temp_dir.path().join("workflows.redb"));
    }

    #[tokio::test]
    async fn test_app_state_with_persistent_storage() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let state = AppState::new(&config).unwrap();
        assert!(!state.service.list_step_types().unwrap().is_empty());
        assert!(temp_dir.path().join("events").exists());
    }
}
