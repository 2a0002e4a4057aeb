// SPDX-License-Identifier: Apache-2.0

//! Shell command monitor: runs a configured command each tick and emits
//! its exit status and trimmed output. The command runs inside the tick's
//! timeout budget; a hung command costs the instance one tick, never the
//! scheduler.

use std::process::Command;

use super::{Monitor, MonitorError, Sample, SampleValue};

/// Longest command output emitted as a metric value; the rest is dropped.
const MAX_OUTPUT_LEN: usize = 4096;

#[derive(Debug)]
pub struct ShellCommandMonitor {
    command: String,
}

impl ShellCommandMonitor {
    pub fn configure(options: &toml::Table) -> Result<Self, MonitorError> {
        let command = options
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                MonitorError::Config("shell_command requires a `command` option".to_string())
            })?;

        if command.trim().is_empty() {
            return Err(MonitorError::Config(
                "shell_command `command` option must not be empty".to_string(),
            ));
        }

        Ok(Self {
            command: command.to_string(),
        })
    }
}

impl Monitor for ShellCommandMonitor {
    fn module(&self) -> &str {
        "shell_command"
    }

    fn sample(&mut self) -> Result<Vec<Sample>, MonitorError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .output()
            .map_err(|e| MonitorError::Sample(format!("failed to run command: {}", e)))?;

        let status = output.status.code().unwrap_or(-1);
        let mut stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.len() > MAX_OUTPUT_LEN {
            stdout = stdout.chars().take(MAX_OUTPUT_LEN).collect();
        }

        Ok(vec![
            Sample::now("exit_status", SampleValue::I64(status as i64)),
            Sample::now("output", SampleValue::Str(stdout)),
        ])
    }
}
