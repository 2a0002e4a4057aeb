// SPDX-License-Identifier: Apache-2.0

//! Host metrics monitor: CPU, memory and load average via `sysinfo`.

use sysinfo::System;

use super::{Monitor, MonitorError, Sample, SampleValue};

#[derive(Debug)]
pub struct SystemMetricsMonitor {
    system: System,
}

impl SystemMetricsMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SystemMetricsMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for SystemMetricsMonitor {
    fn module(&self) -> &str {
        "system_metrics"
    }

    fn sample(&mut self) -> Result<Vec<Sample>, MonitorError> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let load = System::load_average();

        Ok(vec![
            Sample::now(
                "cpu.usage_percent",
                SampleValue::F64(self.system.global_cpu_usage() as f64),
            ),
            Sample::now(
                "mem.total_bytes",
                SampleValue::I64(self.system.total_memory() as i64),
            ),
            Sample::now(
                "mem.used_bytes",
                SampleValue::I64(self.system.used_memory() as i64),
            ),
            Sample::now("load.one_minute", SampleValue::F64(load.one)),
        ])
    }
}
