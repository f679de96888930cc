//! Configuration of the sync engine, the search limits and the stream source
//!
//! Every section has working defaults (`#[serde(default)]`), so a YAML file
//! only needs the fields it overrides:
//!
//! ```yaml
//! data_root_dir: /var/lib/scheduler-admin
//! indexer:
//!   batch_size: 500
//! source:
//!   recheck_interval_ms: 10000
//!   remove_stale_owners: true
//! ```
//!
//! Environment variables override the file: `DATA_ROOT_DIR`, `GROUP_ID`,
//! `RECHECK_INTERVAL` and `SHUTDOWN_TIMEOUT`. Durations are written with
//! units (`500ms`, `1m30s`, `1h`); an unparseable duration keeps the current
//! value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use scheduler_admin_store::{BatchOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Cross-field validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create a range error with a hint
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }
}

fn at_least_one(field: &str, value: u64, hint: &str) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::range_with_hint(field, value, 1, u64::MAX, hint));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

/// Index write path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Operations per index commit
    pub batch_size: usize,
    /// Idle flush timer, in milliseconds
    pub flush_interval_ms: u64,
    /// Capacity of the indexer queue (producers block when full)
    pub queue_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval_ms: 500,
            queue_capacity: 10_000,
        }
    }
}

impl IndexerConfig {
    /// Idle flush timer, never zero.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        at_least_one("indexer.batch_size", self.batch_size as u64, "Commit at least one operation")?;
        at_least_one(
            "indexer.flush_interval_ms",
            self.flush_interval_ms,
            "The idle timer bounds index staleness",
        )?;
        at_least_one(
            "indexer.queue_capacity",
            self.queue_capacity as u64,
            "Queues are bounded",
        )
    }
}

/// Record store write path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Capacity of the updater queue
    pub queue_capacity: usize,
    /// Capacity of the stream feeding the store's batch API
    pub forward_capacity: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            forward_capacity: 1000,
        }
    }
}

impl UpdaterConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        at_least_one(
            "updater.queue_capacity",
            self.queue_capacity as u64,
            "Queues are bounded",
        )?;
        at_least_one(
            "updater.forward_capacity",
            self.forward_capacity as u64,
            "Queues are bounded",
        )
    }
}

/// Batching of the versioned store transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub error_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let defaults = BatchOptions::default();
        Self {
            batch_size: defaults.batch_size,
            flush_interval_ms: defaults.flush_interval_ms,
            error_capacity: defaults.error_capacity,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        at_least_one("store.batch_size", self.batch_size as u64, "Commit at least one event")?;
        at_least_one(
            "store.flush_interval_ms",
            self.flush_interval_ms,
            "The idle timer bounds store staleness",
        )?;
        at_least_one(
            "store.error_capacity",
            self.error_capacity as u64,
            "Queues are bounded",
        )
    }
}

/// Page sizes of search results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Page size when the query has no positive `max`
    pub default_page_size: usize,
    /// Hard ceiling of a page
    pub max_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 1000,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        at_least_one(
            "search.default_page_size",
            self.default_page_size as u64,
            "A page holds at least one record",
        )?;
        if self.default_page_size > self.max_page_size {
            return Err(ConfigError::range_with_hint(
                "search.default_page_size",
                self.default_page_size,
                1,
                self.max_page_size,
                "The default page cannot exceed max_page_size",
            ));
        }
        Ok(())
    }
}

/// Topology-aware stream source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Period of topology re-resolution, in milliseconds
    pub recheck_interval_ms: u64,
    /// Consumer poll timeout, in milliseconds
    pub poll_timeout_ms: u64,
    /// Capacity of the shared work queue fed by the consumers
    pub queue_capacity: usize,
    /// Capacity of the watch stream
    pub watch_capacity: usize,
    /// Upper bound of `close()`, in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Stop the consumer of an owner missing from a complete resolution
    pub remove_stale_owners: bool,
    /// Consumer group used against the brokers
    pub group_id: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            recheck_interval_ms: 30_000,
            poll_timeout_ms: 100,
            queue_capacity: 10_000,
            watch_capacity: 1000,
            shutdown_timeout_ms: 5_000,
            remove_stale_owners: false,
            group_id: "scheduler-admin-cg".to_string(),
        }
    }
}

impl SourceConfig {
    /// Recheck period, never zero.
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        at_least_one(
            "source.recheck_interval_ms",
            self.recheck_interval_ms,
            "Topology is re-resolved periodically",
        )?;
        at_least_one(
            "source.poll_timeout_ms",
            self.poll_timeout_ms,
            "Consumers must observe the stop signal",
        )?;
        at_least_one(
            "source.queue_capacity",
            self.queue_capacity as u64,
            "Queues are bounded",
        )?;
        at_least_one(
            "source.watch_capacity",
            self.watch_capacity as u64,
            "Queues are bounded",
        )?;
        at_least_one(
            "source.shutdown_timeout_ms",
            self.shutdown_timeout_ms,
            "Shutdown waits are bounded",
        )?;
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "source.group_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Root
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Parent of the per-tier database directories
    pub data_root_dir: PathBuf,
    pub indexer: IndexerConfig,
    pub updater: UpdaterConfig,
    pub store: StoreConfig,
    pub search: SearchConfig,
    pub source: SourceConfig,
    /// Retry of index commits and store transactions
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_root_dir: PathBuf::from("./.db"),
            indexer: IndexerConfig::default(),
            updater: UpdaterConfig::default(),
            store: StoreConfig::default(),
            search: SearchConfig::default(),
            source: SourceConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: SyncConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (an environment stand-in).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("DATA_ROOT_DIR") {
            self.data_root_dir = PathBuf::from(dir);
        }
        if let Some(group_id) = lookup("GROUP_ID") {
            self.source.group_id = group_id;
        }
        if let Some(value) = lookup("RECHECK_INTERVAL") {
            override_millis(&mut self.source.recheck_interval_ms, "RECHECK_INTERVAL", &value);
        }
        if let Some(value) = lookup("SHUTDOWN_TIMEOUT") {
            override_millis(&mut self.source.shutdown_timeout_ms, "SHUTDOWN_TIMEOUT", &value);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.indexer.validate()?;
        self.updater.validate()?;
        self.store.validate()?;
        self.search.validate()?;
        self.source.validate()?;
        at_least_one(
            "retry.max_attempts",
            self.retry.max_attempts as u64,
            "The first attempt counts",
        )
    }

    /// Batch options of the versioned store, with the shared retry policy.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.store.batch_size,
            flush_interval_ms: self.store.flush_interval_ms,
            error_capacity: self.store.error_capacity,
            retry: self.retry,
        }
    }

    /// Directory of one logical database (tier).
    pub fn tier_dir(&self, tier: &str) -> PathBuf {
        self.data_root_dir.join(tier)
    }
}

/// Replace `target` with `value` in milliseconds; a bad or zero duration
/// leaves it as is.
fn override_millis(target: &mut u64, name: &str, value: &str) {
    match humantime::parse_duration(value.trim()) {
        Ok(duration) if !duration.is_zero() => {
            *target = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        }
        Ok(_) => warn!(name, value, "zero duration ignored, keeping default"),
        Err(err) => warn!(name, value, error = %err, "invalid duration ignored, keeping default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();

        assert_eq!(config.indexer.batch_size, 1000);
        assert_eq!(config.indexer.flush_interval(), Duration::from_millis(500));
        assert_eq!(config.search.default_page_size, 100);
        assert_eq!(config.search.max_page_size, 1000);
        assert_eq!(config.source.recheck_interval(), Duration::from_secs(30));
        assert_eq!(config.source.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.source.group_id, "scheduler-admin-cg");
        assert!(!config.source.remove_stale_owners);
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
data_root_dir: /tmp/admin
indexer:
  batch_size: 10
source:
  remove_stale_owners: true
"#;
        let config = SyncConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.data_root_dir, PathBuf::from("/tmp/admin"));
        assert_eq!(config.indexer.batch_size, 10);
        assert_eq!(config.indexer.queue_capacity, 10_000);
        assert!(config.source.remove_stale_owners);
    }

    #[test]
    fn test_yaml_file_loading() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "search:\n  default_page_size: 50").unwrap();

        let config = SyncConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.search.default_page_size, 50);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = SyncConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(SyncConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let yaml = "indexer:\n  queue_capacity: 0\n";
        let err = SyncConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Range { ref field, .. } if field == "indexer.queue_capacity"));
    }

    #[test]
    fn test_default_page_above_ceiling_rejected() {
        let mut config = SyncConfig::default();
        config.search.default_page_size = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATA_ROOT_DIR", "/data"),
            ("GROUP_ID", "admin-test"),
            ("RECHECK_INTERVAL", "1m30s"),
            ("SHUTDOWN_TIMEOUT", "500ms"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_env_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.data_root_dir, PathBuf::from("/data"));
        assert_eq!(config.source.group_id, "admin-test");
        assert_eq!(config.source.recheck_interval(), Duration::from_secs(90));
        assert_eq!(config.source.shutdown_timeout(), Duration::from_millis(500));
        assert_eq!(config.tier_dir("cold"), PathBuf::from("/data/cold"));
        config.validate().unwrap();
    }

    #[test]
    fn test_env_duration_in_hours() {
        let mut config = SyncConfig::default();
        config.apply_env_from(|name| (name == "RECHECK_INTERVAL").then(|| "1h".to_string()));
        assert_eq!(config.source.recheck_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_env_duration_keeps_default() {
        for bad in ["soon", "2", "0s", ""] {
            let mut config = SyncConfig::default();
            config.apply_env_from(|name| (name == "SHUTDOWN_TIMEOUT").then(|| bad.to_string()));
            assert_eq!(
                config.source.shutdown_timeout(),
                Duration::from_secs(5),
                "value {:?}",
                bad
            );
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_zero_intervals_never_reach_timers() {
        let mut config = SyncConfig::default();
        config.indexer.flush_interval_ms = 0;
        config.source.recheck_interval_ms = 0;
        assert_eq!(config.indexer.flush_interval(), Duration::from_millis(1));
        assert_eq!(config.source.recheck_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_batch_options_carry_retry() {
        let mut config = SyncConfig::default();
        config.retry.max_attempts = 5;
        config.store.batch_size = 7;

        let options = config.batch_options();
        assert_eq!(options.batch_size, 7);
        assert_eq!(options.retry.max_attempts, 5);
    }
}
