// SPDX-License-Identifier: Apache-2.0

//! Monitor plugin framework.
//!
//! A monitor samples one logical target (host metrics, a shell command, a
//! database...) and returns typed samples, which the scheduler formats into
//! the instance's output log through the [`emitter`]. Plugins are a closed
//! set of variants selected by module identity via [`configure`]; adding a
//! plugin means adding a variant here, not loading code at runtime.

pub mod emitter;
pub mod generator;
pub mod scheduler;
pub mod shell;
pub mod system;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::MonitorConfig;

/// A single sampled metric value.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    F64(f64),
    I64(i64),
    Str(String),
}

impl std::fmt::Display for SampleValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleValue::F64(v) => write!(f, "{}", v),
            SampleValue::I64(v) => write!(f, "{}", v),
            // Quoted with escapes so a string value can never break the
            // one-metric-per-line output format.
            SampleValue::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// One metric sample. Produced and consumed within a single scheduling
/// tick; never shared across tasks.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: SampleValue,
}

impl Sample {
    pub fn now(name: impl Into<String>, value: SampleValue) -> Self {
        Self {
            timestamp: Utc::now(),
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown monitor module: {0}")]
    UnknownModule(String),

    #[error("sample failed: {0}")]
    Sample(String),

    #[error("sample timed out after {0:?}")]
    Timeout(Duration),
}

/// The plugin contract. `sample` may block (system calls, child processes,
/// network I/O); the scheduler runs it on the blocking pool under the
/// instance's tick timeout.
pub trait Monitor: Send + std::fmt::Debug {
    /// Module identity, e.g. "system_metrics". Appears in every output line.
    fn module(&self) -> &str;

    /// Produce zero or more samples for this tick.
    fn sample(&mut self) -> Result<Vec<Sample>, MonitorError>;

    /// Release any resources held by the instance.
    fn close(&mut self) {}
}

/// Configure a monitor instance from its config. The registry is a closed
/// match over module identities.
pub fn configure(config: &MonitorConfig) -> Result<Box<dyn Monitor>, MonitorError> {
    match config.module.as_str() {
        "system_metrics" => Ok(Box::new(system::SystemMetricsMonitor::new())),
        "shell_command" => Ok(Box::new(shell::ShellCommandMonitor::configure(
            &config.options,
        )?)),
        "log_generator" => Ok(Box::new(generator::LogGeneratorMonitor::new())),
        other => Err(MonitorError::UnknownModule(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_config(module: &str) -> MonitorConfig {
        MonitorConfig {
            module: module.to_string(),
            id: "test1".to_string(),
            sample_interval_secs: 1.0,
            consecutive_failure_limit: 3,
            options: toml::Table::new(),
        }
    }

    #[test]
    fn registry_rejects_unknown_module() {
        let err = configure(&monitor_config("no_such_module")).unwrap_err();
        assert!(matches!(err, MonitorError::UnknownModule(_)));
    }

    #[test]
    fn registry_builds_known_modules() {
        assert_eq!(
            configure(&monitor_config("system_metrics")).unwrap().module(),
            "system_metrics"
        );
        assert_eq!(
            configure(&monitor_config("log_generator")).unwrap().module(),
            "log_generator"
        );
    }

    #[test]
    fn string_values_are_quoted() {
        let v = SampleValue::Str("load high\nsecond line".to_string());
        let rendered = v.to_string();
        assert!(rendered.starts_with('"'));
        assert!(!rendered.contains('\n'));
    }
}
