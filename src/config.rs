use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The single environment variable the core observes.
pub const DB_PATH_ENV: &str = "CORECLAW_DB_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// sandbox disables outbound effects entirely; the other modes progressively
/// widen what runs without human confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Sandbox,
    #[default]
    Suggest,
    Assist,
    Autonomous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub retry_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub timeout_ms: u64,
    pub kill_grace_ms: u64,
    pub runtime: String,
    pub image: String,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub allow_network: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            kill_grace_ms: 10_000,
            runtime: "docker".to_string(),
            image: "coreclaw-worker".to_string(),
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("1".to_string()),
            allow_network: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConductorSettings {
    pub briefing_interval_ms: u64,
    pub learning_interval_ms: u64,
    pub correction_buffer_limit: usize,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            briefing_interval_ms: 300_000,
            learning_interval_ms: 300_000,
            correction_buffer_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub state_root: PathBuf,
    pub mode: OperationMode,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub conductors: ConductorSettings,
}

impl Settings {
    pub fn with_state_root(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Store path, honouring the one environment override the core knows.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        self.state_root.join("core.db")
    }

    pub fn ipc_root(&self) -> PathBuf {
        self.state_root.join("ipc")
    }
}
