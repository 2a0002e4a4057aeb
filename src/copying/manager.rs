// SPDX-License-Identifier: Apache-2.0

//! Copying manager: one Tailer → Batcher → Uploader → Checkpoint pipeline
//! per log stream, including the monitor schedulers' own output files.
//!
//! The manager task is the single owner of every tailer, batcher and the
//! checkpoint store; the uploader talks to it only through channels. The
//! checkpoint for a file advances exclusively on upload acknowledgment,
//! which is what gives the whole pipeline its at-least-once guarantee:
//! after a crash, the tailers resume from the last confirmed offsets and
//! re-read only bytes that were never acknowledged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::copying::acks::PendingSpans;
use crate::copying::batcher::{Batch, BatchConfig, Batcher};
use crate::tailer::{CheckpointStore, FileTailer};
use crate::uploader::{UploadJob, UploadOutcome, UploadResult};

/// How long shutdown waits for outcomes of the final flush before giving
/// up; unconfirmed data is simply re-read after restart.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct CopyingConfig {
    /// Tail scan interval
    pub poll_interval: Duration,
    /// Maximum shipped line length
    pub max_line_len: usize,
    pub batch: BatchConfig,
    /// Unconfirmed batches per stream before its tailer pauses
    pub backlog_limit: usize,
}

impl Default for CopyingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_line_len: 64 * 1024,
            batch: BatchConfig::default(),
            backlog_limit: 8,
        }
    }
}

struct StreamPipeline {
    path: PathBuf,
    tailer: FileTailer,
    batcher: Batcher,
    /// Batches dispatched but not yet acked or dropped
    unconfirmed: usize,
    /// Set when this stream's checkpoint can no longer be written; the
    /// pipeline halts rather than risk duplicate or lost delivery.
    halted: bool,
}

pub struct CopyingManager {
    config: CopyingConfig,
    checkpoint: CheckpointStore,
    streams: HashMap<String, StreamPipeline>,
    pending: PendingSpans,
    jobs_tx: Option<BoundedSender<UploadJob>>,
    outcomes_rx: BoundedReceiver<UploadOutcome>,
}

impl CopyingManager {
    pub fn new(
        config: CopyingConfig,
        checkpoint: CheckpointStore,
        paths: Vec<PathBuf>,
        jobs_tx: BoundedSender<UploadJob>,
        outcomes_rx: BoundedReceiver<UploadOutcome>,
    ) -> Self {
        let resume = checkpoint.offsets();

        let mut streams = HashMap::new();
        for path in paths {
            let name = path.display().to_string();
            if streams.contains_key(&name) {
                continue;
            }
            info!(stream = %name, "copying stream configured");
            streams.insert(
                name.clone(),
                StreamPipeline {
                    tailer: FileTailer::open(&path, config.max_line_len, resume.clone()),
                    batcher: Batcher::new(&name, config.batch.clone()),
                    path,
                    unconfirmed: 0,
                    halted: false,
                },
            );
        }

        Self {
            config,
            checkpoint,
            streams,
            pending: PendingSpans::new(),
            jobs_tx: Some(jobs_tx),
            outcomes_rx,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(streams = self.streams.len(), "copying manager started");

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(outcome) = self.outcomes_rx.next() => {
                    self.apply_outcome(outcome);
                }

                _ = poll.tick() => {
                    if self.poll_streams().await.is_err() {
                        error!("upload queue closed, stopping copying manager");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// One scan round: poll every active stream's tailer, feed records
    /// through its batcher, and dispatch any batches that became ready.
    async fn poll_streams(&mut self) -> Result<(), ()> {
        let now = tokio::time::Instant::now();
        let names: Vec<String> = self.streams.keys().cloned().collect();

        for name in names {
            let mut ready: Vec<Batch> = Vec::new();

            {
                let stream = self.streams.get_mut(&name).expect("stream exists");
                if stream.halted {
                    continue;
                }
                // Backpressure: an over-budget backlog pauses this
                // stream's polling until acks drain it.
                if stream.unconfirmed >= self.config.backlog_limit {
                    debug!(stream = %name, backlog = stream.unconfirmed, "backlog full, pausing tail");
                    continue;
                }

                let records = match stream.tailer.poll() {
                    Ok(records) => records,
                    Err(e) => {
                        // Recorded and retried next scan; offset unchanged.
                        warn!(stream = %name, "tail poll failed: {}", e);
                        continue;
                    }
                };

                for record in records {
                    if let Some(batch) = stream.batcher.push(record) {
                        ready.push(batch);
                    }
                }
                if stream.batcher.should_flush(now) {
                    if let Some(batch) = stream.batcher.flush() {
                        ready.push(batch);
                    }
                }
            }

            for batch in ready {
                self.dispatch(&name, batch).await?;
            }
        }

        Ok(())
    }

    async fn dispatch(&mut self, name: &str, batch: Batch) -> Result<(), ()> {
        self.pending.track_batch(&batch);
        if let Some(stream) = self.streams.get_mut(name) {
            stream.unconfirmed += 1;
        }

        let Some(tx) = self.jobs_tx.as_ref() else {
            return Err(());
        };
        debug!(
            stream = %name,
            records = batch.records.len(),
            bytes = batch.record_bytes(),
            "dispatching batch"
        );
        tx.send(UploadJob { batch }).await.map_err(|_| ())
    }

    /// Apply an upload outcome: acknowledged offsets advance checkpoints
    /// per identity; a terminal drop releases the batch's spans with no
    /// delivery credit.
    fn apply_outcome(&mut self, outcome: UploadOutcome) {
        let Some(stream) = self.streams.get_mut(&outcome.stream) else {
            warn!(stream = %outcome.stream, "outcome for unknown stream");
            return;
        };
        stream.unconfirmed = stream.unconfirmed.saturating_sub(1);
        let path = stream.path.clone();

        match outcome.result {
            UploadResult::Acked { offsets } => {
                for (id, end) in offsets {
                    self.pending.acknowledge_up_to(id, end);

                    let Some(offset) = self.pending.committable(id) else {
                        continue;
                    };
                    if let Err(e) = self.checkpoint.commit(id, &path, offset) {
                        error!(
                            stream = %outcome.stream,
                            id = %id,
                            "checkpoint commit failed, halting stream pipeline: {}",
                            e
                        );
                        if let Some(stream) = self.streams.get_mut(&outcome.stream) {
                            stream.halted = true;
                        }
                        return;
                    }
                    debug!(stream = %outcome.stream, id = %id, offset, "checkpoint advanced");
                }
            }
            UploadResult::Dropped { error } => {
                error!(
                    stream = %outcome.stream,
                    attempts = outcome.attempts,
                    "batch dropped: {}",
                    error
                );
                for (id, spans) in &outcome.spans {
                    self.pending.drop_spans(*id, spans);
                }
            }
        }
    }

    /// Shutdown order: tailers have stopped polling (the run loop exited),
    /// remaining batch content flushes best-effort, then the upload queue
    /// closes and outcomes drain briefly so final acks reach checkpoints.
    async fn shutdown(&mut self) {
        info!("copying manager shutting down");

        let names: Vec<String> = self.streams.keys().cloned().collect();
        for name in names {
            let flushed = self
                .streams
                .get_mut(&name)
                .filter(|s| !s.halted)
                .and_then(|s| s.batcher.flush());
            if let Some(batch) = flushed {
                if self.dispatch(&name, batch).await.is_err() {
                    warn!(stream = %name, "could not flush final batch");
                    break;
                }
            }
        }

        // Closing the queue tells the uploader to finish what it has and exit.
        drop(self.jobs_tx.take());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.outcomes_rx.next()).await {
                Ok(Some(outcome)) => self.apply_outcome(outcome),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        pending = self.pending.total_pending(),
                        "timed out draining upload outcomes; unconfirmed data re-reads on restart"
                    );
                    break;
                }
            }
        }

        info!("copying manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::tailer::FileId;
    use std::io::Write;
    use std::path::Path;

    fn append(path: &Path, content: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn fast_config(max_records: usize, backlog_limit: usize) -> CopyingConfig {
        CopyingConfig {
            poll_interval: Duration::from_millis(20),
            max_line_len: 1024,
            batch: BatchConfig {
                max_bytes: 1 << 20,
                max_records,
                max_age: Duration::from_millis(50),
            },
            backlog_limit,
        }
    }

    fn ack_outcome(job: &UploadJob) -> UploadOutcome {
        UploadOutcome {
            stream: job.batch.stream.clone(),
            spans: job.batch.spans_by_file(),
            attempts: 1,
            result: UploadResult::Acked {
                offsets: job.batch.end_offsets(),
            },
        }
    }

    #[tokio::test]
    async fn acked_batches_advance_checkpoint_to_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let ckpt_path = dir.path().join("checkpoints.json");
        append(&log, "one\ntwo\nthree\n");
        let id = FileId::from_path(&log).unwrap();

        let (jobs_tx, mut jobs_rx) = bounded(8);
        let (outcomes_tx, outcomes_rx) = bounded(8);
        let checkpoint = CheckpointStore::open(&ckpt_path).unwrap();
        let manager = CopyingManager::new(
            fast_config(100, 8),
            checkpoint,
            vec![log.clone()],
            jobs_tx,
            outcomes_rx,
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run(cancel.clone()));

        // Act as the uploader: ack everything we are handed.
        let job = jobs_rx.next().await.unwrap();
        assert_eq!(job.batch.records.len(), 3);
        outcomes_tx.send(ack_outcome(&job)).await.unwrap();

        // Let the ack land, then shut down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(outcomes_tx);
        cancel.cancel();
        handle.await.unwrap();

        let reopened = CheckpointStore::open(&ckpt_path).unwrap();
        let file_len = std::fs::metadata(&log).unwrap().len();
        assert_eq!(reopened.offset_for(id), Some(file_len));
    }

    #[tokio::test]
    async fn checkpoint_does_not_advance_before_ack() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let ckpt_path = dir.path().join("checkpoints.json");
        append(&log, "unconfirmed\n");
        let id = FileId::from_path(&log).unwrap();

        let (jobs_tx, mut jobs_rx) = bounded(8);
        let (_outcomes_tx, outcomes_rx) = bounded::<UploadOutcome>(8);
        let checkpoint = CheckpointStore::open(&ckpt_path).unwrap();
        let manager = CopyingManager::new(
            fast_config(100, 8),
            checkpoint,
            vec![log.clone()],
            jobs_tx,
            outcomes_rx,
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run(cancel.clone()));

        // The batch is dispatched but never acknowledged.
        let _job = jobs_rx.next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(_outcomes_tx);
        cancel.cancel();
        handle.await.unwrap();

        let reopened = CheckpointStore::open(&ckpt_path).unwrap();
        assert_eq!(reopened.offset_for(id), None);
    }

    #[tokio::test]
    async fn backlog_limit_pauses_stream() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        append(&log, "a\n");

        // One-record batches and a backlog bound of one unconfirmed batch.
        let (jobs_tx, mut jobs_rx) = bounded(8);
        let (outcomes_tx, outcomes_rx) = bounded(8);
        let checkpoint =
            CheckpointStore::open(dir.path().join("checkpoints.json")).unwrap();
        let manager = CopyingManager::new(
            fast_config(1, 1),
            checkpoint,
            vec![log.clone()],
            jobs_tx,
            outcomes_rx,
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run(cancel.clone()));

        let first = jobs_rx.next().await.unwrap();
        assert_eq!(first.batch.records[0].line, "a");

        // While the first batch is unconfirmed the stream's tailer is
        // paused, so this append must not be picked up.
        append(&log, "b\n");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(jobs_rx.try_recv().is_none());

        // Acking unblocks the stream.
        outcomes_tx.send(ack_outcome(&first)).await.unwrap();
        let second = jobs_rx.next().await.unwrap();
        assert_eq!(second.batch.records[0].line, "b");

        drop(outcomes_tx);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_batch_does_not_advance_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let ckpt_path = dir.path().join("checkpoints.json");
        append(&log, "doomed\n");
        let id = FileId::from_path(&log).unwrap();

        let (jobs_tx, mut jobs_rx) = bounded(8);
        let (outcomes_tx, outcomes_rx) = bounded(8);
        let checkpoint = CheckpointStore::open(&ckpt_path).unwrap();
        let manager = CopyingManager::new(
            fast_config(100, 8),
            checkpoint,
            vec![log.clone()],
            jobs_tx,
            outcomes_rx,
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run(cancel.clone()));

        let job = jobs_rx.next().await.unwrap();
        outcomes_tx
            .send(UploadOutcome {
                stream: job.batch.stream.clone(),
                spans: job.batch.spans_by_file(),
                attempts: 5,
                result: UploadResult::Dropped {
                    error: "retry attempts exhausted after 5".to_string(),
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(outcomes_tx);
        cancel.cancel();
        handle.await.unwrap();

        let reopened = CheckpointStore::open(&ckpt_path).unwrap();
        assert_eq!(reopened.offset_for(id), None);
    }

    #[tokio::test]
    async fn final_flush_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        append(&log, "tail end\n");

        // Age threshold far away: the record sits in the batcher until
        // shutdown flushes it.
        let mut config = fast_config(100, 8);
        config.batch.max_age = Duration::from_secs(300);

        let (jobs_tx, mut jobs_rx) = bounded(8);
        let (outcomes_tx, outcomes_rx) = bounded(8);
        let checkpoint =
            CheckpointStore::open(dir.path().join("checkpoints.json")).unwrap();
        let manager =
            CopyingManager::new(config, checkpoint, vec![log.clone()], jobs_tx, outcomes_rx);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run(cancel.clone()));

        // Give the manager a couple of scan rounds, then stop it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let job = jobs_rx.next().await.unwrap();
        assert_eq!(job.batch.records[0].line, "tail end");
        outcomes_tx.send(ack_outcome(&job)).await.unwrap();
        drop(outcomes_tx);

        handle.await.unwrap();
    }
}
