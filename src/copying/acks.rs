// SPDX-License-Identifier: Apache-2.0

//! Pending-span bookkeeping for at-least-once delivery.
//!
//! Tracks every dispatched record span per file identity until the
//! backend acknowledges it. The committable checkpoint offset for a file
//! is the lowest still-pending span start (a restart re-reads exactly the
//! unconfirmed bytes), or the acknowledged high water mark once nothing is
//! pending. Spans of a terminally failed batch are removed without
//! delivery credit: the checkpoint never advances on account of dropped
//! bytes, though later acknowledged batches may advance past them.

use std::collections::{BTreeMap, HashMap};

use crate::copying::batcher::Batch;
use crate::tailer::{FileId, RecordSpan};

#[derive(Default)]
pub struct PendingSpans {
    /// Per file: pending span begin offset -> span length
    files: HashMap<FileId, BTreeMap<u64, u32>>,
    /// Per file: highest acknowledged end offset
    acked: HashMap<FileId, u64>,
}

impl PendingSpans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every span of a batch as in flight. Call at dispatch time.
    pub fn track_batch(&mut self, batch: &Batch) {
        for record in &batch.records {
            self.files
                .entry(record.file_id)
                .or_default()
                .insert(record.span.offset, record.span.len);
        }
    }

    /// The backend confirmed everything for `id` up to byte `end`.
    pub fn acknowledge_up_to(&mut self, id: FileId, end: u64) {
        if let Some(spans) = self.files.get_mut(&id) {
            spans.retain(|&begin, &mut len| begin + len as u64 > end);
        }

        let hwm = self.acked.entry(id).or_insert(0);
        if end > *hwm {
            *hwm = end;
        }
    }

    /// Remove spans of a terminally failed batch. No delivery credit: the
    /// acknowledged high water mark is untouched.
    pub fn drop_spans(&mut self, id: FileId, spans: &[RecordSpan]) {
        if let Some(pending) = self.files.get_mut(&id) {
            for span in spans {
                pending.remove(&span.offset);
            }
        }
    }

    /// Offset safe to persist for `id`: lowest pending span start, or the
    /// acknowledged high water mark when nothing is pending.
    pub fn committable(&self, id: FileId) -> Option<u64> {
        if let Some(spans) = self.files.get(&id) {
            if let Some((&begin, _)) = spans.first_key_value() {
                return Some(begin);
            }
        }
        self.acked.get(&id).copied()
    }

    pub fn has_pending(&self, id: FileId) -> bool {
        self.files.get(&id).is_some_and(|s| !s.is_empty())
    }

    pub fn total_pending(&self) -> usize {
        self.files.values().map(|s| s.len()).sum()
    }

    /// Drop all state for a file, e.g. once a drained rotated identity is
    /// fully confirmed and forgotten from the checkpoint store.
    pub fn remove_file(&mut self, id: FileId) {
        self.files.remove(&id);
        self.acked.remove(&id);
    }
}
