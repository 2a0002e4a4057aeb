// SPDX-License-Identifier: Apache-2.0

//! Formats samples into the fixed monitor output line form and appends
//! them to the instance's output file.
//!
//! Line format: `<ISO-8601 timestamp> [<module>(<instance_id>)] <name> <value>`,
//! one metric per line, newline terminated. Each line is written with a
//! single append so concurrent instances (each owning a distinct file)
//! never interleave partial lines.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;

use super::Sample;

pub struct MetricEmitter {
    module: String,
    instance_id: String,
    path: PathBuf,
    file: File,
}

impl MetricEmitter {
    /// Open (or create) the instance's output file for appending.
    pub fn open(
        module: impl Into<String>,
        instance_id: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            module: module.into(),
            instance_id: instance_id.into(),
            path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one sample as one line.
    pub fn emit(&mut self, sample: &Sample) -> io::Result<()> {
        let line = self.format_line(sample);
        self.file.write_all(line.as_bytes())
    }

    /// Append a batch of samples from one tick.
    pub fn emit_all(&mut self, samples: &[Sample]) -> io::Result<()> {
        for sample in samples {
            self.emit(sample)?;
        }
        Ok(())
    }

    pub fn format_line(&self, sample: &Sample) -> String {
        format!(
            "{} [{}({})] {} {}\n",
            sample.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.module,
            self.instance_id,
            sample.name,
            sample.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::SampleValue;
    use chrono::TimeZone;
    use chrono::Utc;

    fn sample_at(name: &str, value: SampleValue) -> Sample {
        Sample {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn line_format() {
        let dir = tempfile::tempdir().unwrap();
        let emitter =
            MetricEmitter::open("mysql_monitor", "db1", dir.path().join("db1.log")).unwrap();

        let line = emitter.format_line(&sample_at("global.connections", SampleValue::I64(42)));
        assert_eq!(
            line,
            "2024-03-01T12:30:00.000Z [mysql_monitor(db1)] global.connections 42\n"
        );

        let line = emitter.format_line(&sample_at("status", SampleValue::Str("ok".into())));
        assert_eq!(
            line,
            "2024-03-01T12:30:00.000Z [mysql_monitor(db1)] status \"ok\"\n"
        );
    }

    #[test]
    fn emit_appends_one_line_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sys.log");
        let mut emitter = MetricEmitter::open("system_metrics", "host", &path).unwrap();

        emitter
            .emit_all(&[
                sample_at("cpu.usage", SampleValue::F64(12.5)),
                sample_at("mem.used", SampleValue::I64(1024)),
            ])
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("cpu.usage 12.5"));
        assert!(lines[1].ends_with("mem.used 1024"));
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("out.log");
        let mut emitter = MetricEmitter::open("log_generator", "gen1", &path).unwrap();
        emitter
            .emit(&sample_at("gen.ticks", SampleValue::I64(1)))
            .unwrap();
        assert!(path.exists());
    }
}
