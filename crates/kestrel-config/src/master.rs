use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid config: {message}")]
  Invalid { message: String },
}

/// Settings for one master process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
  /// Identity recorded as the owner of every instance this master runs.
  pub master_id: String,
  /// Instances allowed to run at once; further submissions queue.
  pub max_concurrent_workflows: usize,
  /// Task attempts (including those in retry backoff) one instance may hold.
  pub max_parallel_tasks_per_instance: usize,
  pub timeout_sweep_interval_ms: u64,
  /// How long a kill waits for the worker before terminating locally.
  pub kill_wait_ms: u64,
  /// Capacity of each instance's event queue.
  pub event_buffer_size: usize,
  pub dependent_check_interval_ms: u64,
  /// Attempts made for every store write before the error is surfaced.
  pub store_write_attempts: u32,
  pub store_retry_interval_ms: u64,
}

impl Default for MasterConfig {
  fn default() -> Self {
    Self {
      master_id: format!("master-{}", uuid::Uuid::new_v4()),
      max_concurrent_workflows: 16,
      max_parallel_tasks_per_instance: 8,
      timeout_sweep_interval_ms: 1_000,
      kill_wait_ms: 5_000,
      event_buffer_size: 100,
      dependent_check_interval_ms: 1_000,
      store_write_attempts: 3,
      store_retry_interval_ms: 100,
    }
  }
}

impl MasterConfig {
  /// Load from a JSON file; missing fields take their defaults.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let invalid = |message: &str| {
      Err(ConfigError::Invalid {
        message: message.to_string(),
      })
    };
    if self.master_id.is_empty() {
      return invalid("master_id must not be empty");
    }
    if self.max_concurrent_workflows == 0 {
      return invalid("max_concurrent_workflows must be at least 1");
    }
    if self.max_parallel_tasks_per_instance == 0 {
      return invalid("max_parallel_tasks_per_instance must be at least 1");
    }
    if self.event_buffer_size == 0 {
      return invalid("event_buffer_size must be at least 1");
    }
    if self.timeout_sweep_interval_ms == 0 {
      return invalid("timeout_sweep_interval_ms must be positive");
    }
    if self.store_write_attempts == 0 {
      return invalid("store_write_attempts must be at least 1");
    }
    Ok(())
  }
}
