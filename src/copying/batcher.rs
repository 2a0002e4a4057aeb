// SPDX-License-Identifier: Apache-2.0

//! Record batching. One batcher per stream accumulates records until a
//! size threshold (bytes or record count) or an age threshold trips,
//! whichever comes first, preserving record order within the stream.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::tailer::{FileId, Record, RecordSpan};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush once the batch holds this many bytes of record content
    pub max_bytes: usize,
    /// Flush once the batch holds this many records
    pub max_records: usize,
    /// Flush a non-empty batch after this age regardless of size
    pub max_age: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024,
            max_records: 10_000,
            max_age: Duration::from_secs(5),
        }
    }
}

/// One upload unit. Records stay in read order; every record carries its
/// file identity and byte span so acknowledgment can be attributed
/// per-identity even when a rotation put two identities in one stream.
#[derive(Debug)]
pub struct Batch {
    pub stream: String,
    pub records: Vec<Record>,
    pub attempts: u32,
}

impl Batch {
    /// Total bytes of file content this batch covers.
    pub fn record_bytes(&self) -> usize {
        self.records.iter().map(|r| r.span.len as usize).sum()
    }

    /// Highest end offset per contributing file identity.
    pub fn end_offsets(&self) -> HashMap<FileId, u64> {
        let mut offsets: HashMap<FileId, u64> = HashMap::new();
        for record in &self.records {
            let end = record.span.end_offset();
            offsets
                .entry(record.file_id)
                .and_modify(|o| *o = (*o).max(end))
                .or_insert(end);
        }
        offsets
    }

    /// All record spans grouped by file identity.
    pub fn spans_by_file(&self) -> HashMap<FileId, Vec<RecordSpan>> {
        let mut spans: HashMap<FileId, Vec<RecordSpan>> = HashMap::new();
        for record in &self.records {
            spans.entry(record.file_id).or_default().push(record.span);
        }
        spans
    }
}

pub struct Batcher {
    stream: String,
    config: BatchConfig,
    records: Vec<Record>,
    bytes: usize,
    oldest: Option<Instant>,
}

impl Batcher {
    pub fn new(stream: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            stream: stream.into(),
            config,
            records: Vec::new(),
            bytes: 0,
            oldest: None,
        }
    }

    /// Add a record; returns a full batch when a size threshold trips.
    pub fn push(&mut self, record: Record) -> Option<Batch> {
        if self.records.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.bytes += record.span.len as usize;
        self.records.push(record);

        if self.records.len() >= self.config.max_records || self.bytes >= self.config.max_bytes {
            return self.flush();
        }
        None
    }

    /// True when a non-empty batch has aged past the flush threshold.
    pub fn should_flush(&self, now: Instant) -> bool {
        match self.oldest {
            Some(oldest) => !self.records.is_empty() && oldest + self.config.max_age <= now,
            None => false,
        }
    }

    /// Take whatever has accumulated; None when empty.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        self.bytes = 0;
        self.oldest = None;
        Some(Batch {
            stream: self.stream.clone(),
            records: std::mem::take(&mut self.records),
            attempts: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
