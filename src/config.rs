// SPDX-License-Identifier: Apache-2.0

//! Agent configuration, loaded once at startup from a TOML file and passed
//! down into components. There is no global configuration state; every
//! component receives the values it needs at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Directory where monitor instances write their output logs
    #[serde(default = "default_monitor_log_dir")]
    pub monitor_log_dir: PathBuf,
    /// Configured monitor instances
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
    /// Additional log files to tail and ship
    #[serde(default)]
    pub logs: Vec<LogStreamConfig>,
    /// Upload pipeline settings
    pub upload: UploadConfig,
}

/// One monitor instance: which module to run, how often, and any
/// plugin-specific options (connection parameters etc.), which are kept as
/// a raw table and interpreted by the plugin at configure time.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Module identity, e.g. "system_metrics"
    pub module: String,
    /// Instance id, unique within the process
    pub id: String,
    /// Sampling interval in seconds
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: f64,
    /// Consecutive tick failures before the instance is marked Failed
    #[serde(default = "default_failure_limit")]
    pub consecutive_failure_limit: u32,
    /// Plugin-specific options (remaining keys of the monitor table)
    #[serde(flatten)]
    pub options: toml::Table,
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sample_interval_secs.max(0.001))
    }
}

/// An extra log stream to ship, beyond the monitors' own output files.
#[derive(Debug, Clone, Deserialize)]
pub struct LogStreamConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Backend ingestion endpoint, e.g. "https://ingest.example.com/api/uploadLogs"
    pub endpoint: String,
    /// Bearer token sent on every upload
    #[serde(default)]
    pub api_token: String,
    /// Flush a batch once it holds this many bytes of record content
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
    /// Flush a batch once it holds this many records
    #[serde(default = "default_batch_max_records")]
    pub batch_max_records: usize,
    /// Flush a non-empty batch after this age even if under the size thresholds
    #[serde(default = "default_batch_max_age_ms")]
    pub batch_max_age_ms: u64,
    /// Unconfirmed batches allowed per stream before its tailer pauses
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
    /// Tail scan interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum length of a single shipped line; longer lines are truncated
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Where confirmed read offsets are persisted
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl UploadConfig {
    pub fn batch_max_age(&self) -> Duration {
        Duration::from_millis(self.batch_max_age_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry policy tunables. The numeric policy is configuration, not a
/// constant baked into call sites.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_bytes_per_sec")]
    pub bytes_per_sec: u64,
    #[serde(default = "default_requests_per_sec")]
    pub requests_per_sec: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            bytes_per_sec: default_bytes_per_sec(),
            requests_per_sec: default_requests_per_sec(),
        }
    }
}

impl AgentConfig {
    /// Load and parse the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {:?}: {}", path, e))?;
        let config: AgentConfig =
            toml::from_str(&raw).map_err(|e| format!("failed to parse config {:?}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup-fatal validation: transport misconfiguration must be caught
    /// before any pipeline starts. Per-monitor problems (duplicate ids,
    /// unknown modules) are handled by the scheduler and only disable the
    /// affected instance.
    pub fn validate(&self) -> Result<(), String> {
        if self.upload.endpoint.is_empty() {
            return Err("upload.endpoint must be set".to_string());
        }
        if !self.upload.endpoint.starts_with("http://") && !self.upload.endpoint.starts_with("https://")
        {
            return Err(format!(
                "upload.endpoint must be an http(s) URL, got {:?}",
                self.upload.endpoint
            ));
        }
        if self.upload.batch_max_records == 0 || self.upload.batch_max_bytes == 0 {
            return Err("upload batch thresholds must be non-zero".to_string());
        }
        if self.upload.retry.max_attempts == 0 {
            return Err("upload.retry.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_monitor_log_dir() -> PathBuf {
    PathBuf::from("/var/log/logtide")
}

fn default_sample_interval_secs() -> f64 {
    30.0
}

fn default_failure_limit() -> u32 {
    3
}

fn default_batch_max_bytes() -> usize {
    256 * 1024
}

fn default_batch_max_records() -> usize {
    10_000
}

fn default_batch_max_age_ms() -> u64 {
    5_000
}

fn default_backlog_limit() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_line_len() -> usize {
    64 * 1024
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("/var/lib/logtide/checkpoints.json")
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_bytes_per_sec() -> u64 {
    1024 * 1024
}

fn default_requests_per_sec() -> u32 {
    100
}
