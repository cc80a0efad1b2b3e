//! Configuration System
//!
//! Layered configuration for the queue, the job pipeline, generation endpoints, storage and
//! logging. Sources are merged in order: built-in defaults, the global config file, the
//! workspace `config/` directory, then `GENFORGE__*` environment variables.

use crate::jobs::JobsConfig;
use crate::logging::{validate_logging_config, LoggingConfig};
use crate::provider::EndpointsConfig;
use crate::queue::QueueConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod facade;
mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use facade::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenforgeConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub endpoints: EndpointsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the job database; defaults to the platform data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("", "", "genforge")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".genforge"))
        })
    }

    /// Location of the sled database holding the job snapshot.
    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir().join("jobs")
    }

    pub fn validate(&self) -> Result<(), String> {
        match &self.data_dir {
            Some(dir) if dir.as_os_str().is_empty() => {
                Err("data_dir cannot be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Queue(String),
    Jobs(String),
    Endpoints(String),
    Storage(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Queue(msg) => write!(f, "Queue: {}", msg),
            ValidationError::Jobs(msg) => write!(f, "Jobs: {}", msg),
            ValidationError::Endpoints(msg) => write!(f, "Endpoints: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl GenforgeConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.queue.validate() {
            errors.push(ValidationError::Queue(e));
        }
        if let Err(e) = self.jobs.validate() {
            errors.push(ValidationError::Jobs(e));
        }
        if let Err(e) = self.endpoints.validate() {
            errors.push(ValidationError::Endpoints(e));
        }
        if let Err(e) = self.storage.validate() {
            errors.push(ValidationError::Storage(e));
        }
        if let Err(e) = validate_logging_config(&self.logging) {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Render as TOML, for `config show`.
    pub fn to_toml(&self) -> Result<String, crate::error::ApiError> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::error::ApiError::ConfigError(format!("Failed to render: {}", e)))
    }
}
