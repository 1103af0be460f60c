use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub etl: EtlSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity of the local cluster node and the database it serves.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Cluster node tag (e.g. "A").
    pub tag: String,
    /// Name of the database whose changes are extracted.
    pub database: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Batch admission, fallback and resource settings shared by every pipeline engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EtlSettings {
    /// Maximum documents (including tombstones) extracted per batch.
    #[serde(default)]
    pub max_number_of_extracted_documents: Option<u64>,

    /// Maximum counter groups extracted per batch.
    #[serde(default)]
    pub max_number_of_extracted_counter_groups: Option<u64>,

    /// Maximum items of any type extracted per batch.
    #[serde(default)]
    pub max_number_of_extracted_items: Option<u64>,

    /// Maximum number of items admitted into a single batch.
    #[serde(default)]
    pub max_batch_size: Option<u64>,

    /// Wall-clock budget for the extract and transform phases of one batch.
    #[serde(default = "default_extract_and_transform_timeout")]
    pub extract_and_transform_timeout_secs: u64,

    /// Under low memory a batch may still grow until it holds this many items.
    #[serde(default = "default_low_memory_min_batch_size")]
    pub low_memory_min_batch_size: u64,

    /// Interval waited after the first of a run of load failures.
    #[serde(default = "default_min_fallback_time")]
    pub min_fallback_time_ms: u64,

    /// Ceiling for the load-failure fallback interval.
    #[serde(default = "default_max_fallback_time")]
    pub max_fallback_time_secs: u64,

    /// Memory budget every batch starts with.
    #[serde(default = "default_initial_memory_budget")]
    pub initial_memory_budget_bytes: u64,

    /// Step by which a batch asks the shared budget to grow.
    #[serde(default = "default_memory_budget_increment")]
    pub memory_budget_increment_bytes: u64,

    /// Sleep between checks while CPU credits are exhausted.
    #[serde(default = "default_cpu_credits_wait")]
    pub cpu_credits_wait_ms: u64,

    /// Consecutive CPU-credit waits before an operator alert is raised.
    #[serde(default = "default_cpu_credits_alert_after")]
    pub cpu_credits_alert_after_waits: u32,

    /// How long to wait for a committed checkpoint to be applied locally.
    #[serde(default = "default_commit_wait_timeout")]
    pub commit_wait_timeout_secs: u64,

    /// Number of recent batch statistics kept per engine.
    #[serde(default = "default_stats_history_size")]
    pub stats_history_size: usize,

    /// Number of compiled scripts kept in the shared cache.
    #[serde(default = "default_script_cache_capacity")]
    pub script_cache_capacity: usize,

    /// Attempts for transient cluster failures while committing a checkpoint.
    #[serde(default = "default_transient_retry_attempts")]
    pub transient_retry_attempts: u32,

    /// Delay between transient retries.
    #[serde(default = "default_transient_retry_delay")]
    pub transient_retry_delay_ms: u64,

    /// Delay before the next iteration after an unexpected storage or cluster error.
    #[serde(default = "default_storage_retry_delay")]
    pub storage_retry_delay_ms: u64,
}

fn default_extract_and_transform_timeout() -> u64 {
    300 // 5 minutes
}

fn default_low_memory_min_batch_size() -> u64 {
    16
}

fn default_min_fallback_time() -> u64 {
    5000
}

fn default_max_fallback_time() -> u64 {
    900 // 15 minutes
}

fn default_initial_memory_budget() -> u64 {
    32 * 1024 * 1024
}

fn default_memory_budget_increment() -> u64 {
    16 * 1024 * 1024
}

fn default_cpu_credits_wait() -> u64 {
    1000
}

fn default_cpu_credits_alert_after() -> u32 {
    3
}

fn default_commit_wait_timeout() -> u64 {
    30
}

fn default_stats_history_size() -> usize {
    25
}

fn default_script_cache_capacity() -> usize {
    128
}

fn default_transient_retry_attempts() -> u32 {
    3
}

fn default_transient_retry_delay() -> u64 {
    250
}

fn default_storage_retry_delay() -> u64 {
    1000
}

impl Default for EtlSettings {
    fn default() -> Self {
        Self {
            max_number_of_extracted_documents: None,
            max_number_of_extracted_counter_groups: None,
            max_number_of_extracted_items: None,
            max_batch_size: None,
            extract_and_transform_timeout_secs: default_extract_and_transform_timeout(),
            low_memory_min_batch_size: default_low_memory_min_batch_size(),
            min_fallback_time_ms: default_min_fallback_time(),
            max_fallback_time_secs: default_max_fallback_time(),
            initial_memory_budget_bytes: default_initial_memory_budget(),
            memory_budget_increment_bytes: default_memory_budget_increment(),
            cpu_credits_wait_ms: default_cpu_credits_wait(),
            cpu_credits_alert_after_waits: default_cpu_credits_alert_after(),
            commit_wait_timeout_secs: default_commit_wait_timeout(),
            stats_history_size: default_stats_history_size(),
            script_cache_capacity: default_script_cache_capacity(),
            transient_retry_attempts: default_transient_retry_attempts(),
            transient_retry_delay_ms: default_transient_retry_delay(),
            storage_retry_delay_ms: default_storage_retry_delay(),
        }
    }
}

impl EtlSettings {
    /// Sets the maximum number of extracted documents per batch.
    pub fn with_max_extracted_documents(mut self, max: u64) -> Self {
        self.max_number_of_extracted_documents = Some(max);
        self
    }

    /// Sets the maximum number of extracted counter groups per batch.
    pub fn with_max_extracted_counter_groups(mut self, max: u64) -> Self {
        self.max_number_of_extracted_counter_groups = Some(max);
        self
    }

    /// Sets the maximum number of extracted items per batch.
    pub fn with_max_extracted_items(mut self, max: u64) -> Self {
        self.max_number_of_extracted_items = Some(max);
        self
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, max: u64) -> Self {
        self.max_batch_size = Some(max);
        self
    }

    /// Sets the memory budget each batch starts with.
    pub fn with_initial_memory_budget(mut self, bytes: u64) -> Self {
        self.initial_memory_budget_bytes = bytes;
        self
    }

    /// Sets the CPU-credit wait interval.
    pub fn with_cpu_credits_wait(mut self, wait: Duration) -> Self {
        self.cpu_credits_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Sets the first fallback interval after a load failure.
    pub fn with_min_fallback_time(mut self, floor: Duration) -> Self {
        self.min_fallback_time_ms = floor.as_millis() as u64;
        self
    }

    /// Sets the delay used after unexpected storage or cluster errors.
    pub fn with_storage_retry_delay(mut self, delay: Duration) -> Self {
        self.storage_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn extract_and_transform_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_and_transform_timeout_secs)
    }

    pub fn min_fallback_time(&self) -> Duration {
        Duration::from_millis(self.min_fallback_time_ms)
    }

    pub fn max_fallback_time(&self) -> Duration {
        Duration::from_secs(self.max_fallback_time_secs)
    }

    pub fn cpu_credits_wait(&self) -> Duration {
        Duration::from_millis(self.cpu_credits_wait_ms)
    }

    pub fn commit_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_wait_timeout_secs)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }

    pub fn storage_retry_delay(&self) -> Duration {
        Duration::from_millis(self.storage_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EtlSettings::default();
        assert!(settings.max_number_of_extracted_documents.is_none());
        assert!(settings.max_batch_size.is_none());
        assert_eq!(settings.extract_and_transform_timeout(), Duration::from_secs(300));
        assert_eq!(settings.min_fallback_time(), Duration::from_secs(5));
        assert_eq!(settings.max_fallback_time(), Duration::from_secs(900));
        assert_eq!(settings.stats_history_size, 25);
        assert_eq!(settings.cpu_credits_alert_after_waits, 3);
    }

    #[test]
    fn test_deserialize_with_default_sections() {
        let toml = r#"
[node]
tag = "A"
database = "shop"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.node.tag, "A");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.etl.low_memory_min_batch_size, 16);
    }

    #[test]
    fn test_deserialize_etl_overrides() {
        let toml = r#"
[node]
tag = "A"
database = "shop"

[etl]
max_number_of_extracted_documents = 10
max_number_of_extracted_items = 50
max_fallback_time_secs = 60
cpu_credits_wait_ms = 50
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.etl.max_number_of_extracted_documents, Some(10));
        assert_eq!(config.etl.max_number_of_extracted_items, Some(50));
        assert_eq!(config.etl.max_fallback_time(), Duration::from_secs(60));
        assert_eq!(config.etl.cpu_credits_wait(), Duration::from_millis(50));
    }

    #[test]
    fn test_settings_builder() {
        let settings = EtlSettings::default()
            .with_max_extracted_documents(3)
            .with_max_batch_size(100)
            .with_cpu_credits_wait(Duration::from_millis(5));

        assert_eq!(settings.max_number_of_extracted_documents, Some(3));
        assert_eq!(settings.max_batch_size, Some(100));
        assert_eq!(settings.cpu_credits_wait_ms, 5);
    }
}
