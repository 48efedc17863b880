use serde::Deserialize;
use std::path::PathBuf;

pub mod env;

/// Attribute keys that churn constantly without describing a meaningful change.
pub const DEFAULT_IGNORED_ATTRIBUTES: &[&str] = &[
    "latitude",
    "longitude",
    "gps_accuracy",
    "accuracy",
    "altitude",
    "vertical_accuracy",
    "course",
    "speed",
    "rssi",
    "signal_strength",
    "linkquality",
    "last_seen",
    "last_updated",
    "timestamp",
    "battery",
    "battery_level",
    "cpu_percent",
    "memory_use_percent",
    "media_position",
    "media_position_updated_at",
];

/// Complete statewatch configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
}

/// SQLite location shared by the state and baseline tables
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("statewatch.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Debounce window and size trigger for the change batcher
#[derive(Debug, Clone, Deserialize)]
pub struct BatcherConfig {
    /// Quiet period after the last event before a batch is flushed (milliseconds)
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Number of buffered events that forces an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_batch_delay_ms() -> u64 {
    5000
}

fn default_max_batch_size() -> usize {
    10
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: default_batch_delay_ms(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl BatcherConfig {
    pub fn batch_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_delay_ms)
    }
}

/// Structural diff settings for the state store
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Attribute keys excluded from change comparison (still persisted)
    #[serde(default = "default_ignored_attributes")]
    pub ignored_attributes: Vec<String>,
    /// Emit a change for the first observation of an entity
    #[serde(default = "default_report_first_seen")]
    pub report_first_seen: bool,
}

fn default_ignored_attributes() -> Vec<String> {
    DEFAULT_IGNORED_ATTRIBUTES
        .iter()
        .map(|key| key.to_string())
        .collect()
}

fn default_report_first_seen() -> bool {
    true
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ignored_attributes: default_ignored_attributes(),
            report_first_seen: default_report_first_seen(),
        }
    }
}

/// Statistical significance settings for noise baselines
#[derive(Debug, Clone, Deserialize)]
pub struct NoiseConfig {
    /// Threshold = mean(deltas) + threshold_sigmas * stddev(deltas)
    #[serde(default = "default_threshold_sigmas")]
    pub threshold_sigmas: f64,
    /// Entities with fewer history samples than this get no baseline
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_threshold_sigmas() -> f64 {
    1.0
}

fn default_min_samples() -> usize {
    2
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            threshold_sigmas: default_threshold_sigmas(),
            min_samples: default_min_samples(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<WatchConfig> {
    use anyhow::Context;

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: WatchConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
