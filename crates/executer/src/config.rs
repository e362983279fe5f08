use std::time::Duration;

use quarry_graph::ChannelTransportVersion;
use serde::Deserialize;

/// Start-request retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retry_number")]
    pub max_retry_number: u32,
}

fn default_min_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_max_retry_number() -> u32 {
    10
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retry_number: default_max_retry_number(),
        }
    }
}

impl RetrySettings {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}

/// Knobs deciding how many scan tasks a node gets.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationSettings {
    /// Fixed scan tasks per node for column tables; 0 defers to the predictor.
    #[serde(default)]
    pub cs_scan_threads_per_node: u32,
    #[serde(default = "default_ds_scan_minimal_threads")]
    pub ds_scan_minimal_threads: u32,
    #[serde(default = "default_ds_base_sort_scan_threads")]
    pub ds_base_sort_scan_threads: u32,
    #[serde(default = "default_ds_base_join_scan_threads")]
    pub ds_base_join_scan_threads: u32,
    /// Threads the predictor may spread a column scan over when the
    /// resource snapshot does not know the node.
    #[serde(default = "default_compute_threads_per_node")]
    pub compute_threads_per_node: u32,
}

fn default_ds_scan_minimal_threads() -> u32 {
    2
}

fn default_ds_base_sort_scan_threads() -> u32 {
    4
}

fn default_ds_base_join_scan_threads() -> u32 {
    4
}

fn default_compute_threads_per_node() -> u32 {
    16
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            cs_scan_threads_per_node: 0,
            ds_scan_minimal_threads: default_ds_scan_minimal_threads(),
            ds_base_sort_scan_threads: default_ds_base_sort_scan_threads(),
            ds_base_join_scan_threads: default_ds_base_join_scan_threads(),
            compute_threads_per_node: default_compute_threads_per_node(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuterSettings {
    #[serde(default)]
    pub retries: RetrySettings,
    #[serde(default)]
    pub aggregation: AggregationSettings,
    #[serde(default)]
    pub enable_read_compute_separation: bool,
    #[serde(default = "default_max_secrets_snapshot_wait_ms")]
    pub max_secrets_snapshot_wait_ms: u64,
    #[serde(default = "default_resource_usage_update_interval_ms")]
    pub resource_usage_update_interval_ms: u64,
    #[serde(default = "default_ru_report_threshold")]
    pub ru_report_threshold: u64,
    #[serde(default = "default_max_task_size_bytes")]
    pub max_task_size_bytes: usize,
    #[serde(default)]
    pub channel_transport_version: ChannelTransportVersion,
}

fn default_max_secrets_snapshot_wait_ms() -> u64 {
    5000
}

fn default_resource_usage_update_interval_ms() -> u64 {
    100
}

fn default_ru_report_threshold() -> u64 {
    100
}

fn default_max_task_size_bytes() -> usize {
    48 * 1024 * 1024
}

impl Default for ExecuterSettings {
    fn default() -> Self {
        Self {
            retries: RetrySettings::default(),
            aggregation: AggregationSettings::default(),
            enable_read_compute_separation: false,
            max_secrets_snapshot_wait_ms: default_max_secrets_snapshot_wait_ms(),
            resource_usage_update_interval_ms: default_resource_usage_update_interval_ms(),
            ru_report_threshold: default_ru_report_threshold(),
            max_task_size_bytes: default_max_task_size_bytes(),
            channel_transport_version: ChannelTransportVersion::default(),
        }
    }
}

impl ExecuterSettings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("EXECUTER_CONFIG_PATH")
            .unwrap_or_else(|_| "crates/executer/config/default.toml".to_string());
        Self::from_file(&config_file_path)
    }

    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(config::Environment::with_prefix("QUARRY_EXECUTER").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn max_secrets_snapshot_wait(&self) -> Duration {
        Duration::from_millis(self.max_secrets_snapshot_wait_ms)
    }

    pub fn resource_usage_update_interval(&self) -> Duration {
        Duration::from_millis(self.resource_usage_update_interval_ms)
    }
}
