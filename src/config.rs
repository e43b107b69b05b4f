//! Configuration loader and validator for the batch change store.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::worker::WorkerStoreOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub resolution_worker: ResolutionWorker,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Retention of changeset specs that never made it into an applied batch
/// change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSettings {
    pub changeset_spec_ttl_hours: i64,
    pub batch_spec_ttl_hours: i64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            changeset_spec_ttl_hours: crate::model::changeset_spec::CHANGESET_SPEC_TTL_HOURS,
            batch_spec_ttl_hours: crate::model::changeset_spec::BATCH_SPEC_TTL_HOURS,
        }
    }
}

impl StoreSettings {
    pub fn changeset_spec_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.changeset_spec_ttl_hours)
    }

    pub fn batch_spec_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.batch_spec_ttl_hours)
    }
}

/// Settings handed to the job-queue engine that leases resolution jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionWorker {
    pub stalled_max_age_secs: u64,
    pub max_num_resets: i64,
    pub retry_after_secs: u64,
}

impl Default for ResolutionWorker {
    fn default() -> Self {
        Self {
            stalled_max_age_secs: 60,
            max_num_resets: 60,
            retry_after_secs: 5,
        }
    }
}

impl ResolutionWorker {
    /// Queue options for the resolution job table with these timings.
    pub fn store_options(&self) -> WorkerStoreOptions {
        WorkerStoreOptions {
            stalled_max_age: Duration::from_secs(self.stalled_max_age_secs),
            max_num_resets: self.max_num_resets,
            retry_after: Duration::from_secs(self.retry_after_secs),
            ..WorkerStoreOptions::batch_spec_resolution()
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Default SQLite location inside the data directory.
    pub fn default_database_url(&self) -> String {
        format!(
            "sqlite://{}/batch_changes.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let store = &cfg.store;
    if store.changeset_spec_ttl_hours <= 0 {
        return Err(ConfigError::Invalid(
            "store.changeset_spec_ttl_hours must be > 0",
        ));
    }
    if store.batch_spec_ttl_hours <= 0 {
        return Err(ConfigError::Invalid("store.batch_spec_ttl_hours must be > 0"));
    }
    if store.batch_spec_ttl_hours < store.changeset_spec_ttl_hours {
        return Err(ConfigError::Invalid(
            "store.batch_spec_ttl_hours must be >= store.changeset_spec_ttl_hours",
        ));
    }

    let worker = &cfg.resolution_worker;
    if worker.stalled_max_age_secs == 0 {
        return Err(ConfigError::Invalid(
            "resolution_worker.stalled_max_age_secs must be > 0",
        ));
    }
    if worker.max_num_resets < 0 {
        return Err(ConfigError::Invalid(
            "resolution_worker.max_num_resets must be >= 0",
        ));
    }

    Ok(())
}

/// Returns the example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

store:
  # unattached changeset spec TTL
  changeset_spec_ttl_hours: 48
  # attached-but-unapplied TTL
  batch_spec_ttl_hours: 168

resolution_worker:
  stalled_max_age_secs: 60
  max_num_resets: 60
  retry_after_secs: 5
"#
}
