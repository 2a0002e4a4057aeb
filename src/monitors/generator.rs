// SPDX-License-Identifier: Apache-2.0

//! Deterministic sample generator. Emits four metrics per tick with
//! predictable values; used to exercise the scheduler and the copying
//! pipeline in tests without touching any real target.

use super::{Monitor, MonitorError, Sample, SampleValue};

#[derive(Debug)]
pub struct LogGeneratorMonitor {
    ticks: u64,
}

impl LogGeneratorMonitor {
    pub fn new() -> Self {
        Self { ticks: 0 }
    }
}

impl Default for LogGeneratorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for LogGeneratorMonitor {
    fn module(&self) -> &str {
        "log_generator"
    }

    fn sample(&mut self) -> Result<Vec<Sample>, MonitorError> {
        self.ticks += 1;

        Ok(vec![
            Sample::now("gen.ticks", SampleValue::I64(self.ticks as i64)),
            Sample::now("gen.square", SampleValue::I64((self.ticks * self.ticks) as i64)),
            Sample::now("gen.half", SampleValue::F64(self.ticks as f64 / 2.0)),
            Sample::now("gen.parity", {
                if self.ticks % 2 == 0 {
                    SampleValue::Str("even".to_string())
                } else {
                    SampleValue::Str("odd".to_string())
                }
            }),
        ])
    }
}
