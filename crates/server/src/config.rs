use crate::capabilities;
use anyhow::{Context, Result};
use dagrun_core::capability::InMemoryCapabilityRegistry;
use dagrun_core::events::{EventLog, InMemoryEventLog};
use dagrun_core::storage::JsonlEventLog;
use dagrun_core::workflow::{register_workflow_capabilities, WorkflowDefinition, WorkflowEngine};
use dagrun_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Where run events are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLogKind {
    #[default]
    Memory,
    Jsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub event_log: EventLogKind,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    /// Directory of `*.json` workflow definitions registered at startup
    #[serde(default)]
    pub workflows_dir: Option<String>,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log: EventLogKind::default(),
            event_log_dir: default_event_log_dir(),
            workflows_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

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

    /// Get the workflow definitions directory, relative paths resolved against the data dir
    pub fn workflows_path(&self) -> Option<PathBuf> {
        self.storage
            .workflows_dir
            .as_ref()
            .map(|dir| self.data_dir.join(dir))
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub capabilities: Arc<InMemoryCapabilityRegistry>,
}

impl AppState {
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let event_log: Arc<dyn EventLog> = match config.storage.event_log {
            EventLogKind::Memory => Arc::new(InMemoryEventLog::new()),
            EventLogKind::Jsonl => Arc::new(
                JsonlEventLog::new(config.event_log_path())
                    .context("Failed to create event log")?,
            ),
        };

        let capabilities = Arc::new(InMemoryCapabilityRegistry::new());
        capabilities::register_builtins(&capabilities);

        let engine = Arc::new(
            WorkflowEngine::new(capabilities.clone())
                .with_config(config.engine.clone())
                .with_event_log(event_log),
        );
        register_workflow_capabilities(&engine, &capabilities);

        if let Some(dir) = config.workflows_path() {
            for definition in load_workflow_definitions(&dir)? {
                let id = definition.id.clone();
                engine
                    .register(definition)
                    .await
                    .with_context(|| format!("Failed to register workflow {}", id))?;
            }
        }

        Ok(Self {
            engine,
            capabilities,
        })
    }
}

/// Read every `*.json` workflow definition under a directory
pub fn load_workflow_definitions(dir: &Path) -> Result<Vec<WorkflowDefinition>> {
    if !dir.exists() {
        tracing::warn!("Workflows directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "json")
        })
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let definition: WorkflowDefinition = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        tracing::info!("Loaded workflow {} from {}", definition.id, path.display());
        definitions.push(definition);
    }

    Ok(definitions)
}
