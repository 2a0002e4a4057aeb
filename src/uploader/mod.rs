// SPDX-License-Identifier: Apache-2.0

//! Upload loop: takes batches off a bounded queue in FIFO order, pushes
//! them through the shared rate limiter and the retrying transport, and
//! reports per-batch outcomes (acknowledged offsets or a terminal drop)
//! back to the copying manager.

pub mod client;
pub mod rate_limit;
pub mod request;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::copying::Batch;
use crate::tailer::{FileId, RecordSpan};

pub use client::{HttpsTransport, Transport, TransportError, UploadResponse};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::RetryConfig;

use retry::{is_retryable_status, RetryState};

pub struct UploadJob {
    pub batch: Batch,
}

#[derive(Debug)]
pub enum UploadResult {
    /// Backend confirmed the batch; offsets are the committed end offset
    /// per contributing file identity (possibly partial).
    Acked { offsets: HashMap<FileId, u64> },
    /// The batch was dropped after exhausting its retry budget or a
    /// terminal rejection. The covered bytes get no delivery credit.
    Dropped { error: String },
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub stream: String,
    /// Spans the batch covered, per identity; the manager needs them to
    /// release in-flight bookkeeping on a drop.
    pub spans: HashMap<FileId, Vec<RecordSpan>>,
    /// Total send attempts made for this batch.
    pub attempts: u32,
    pub result: UploadResult,
}

pub struct Uploader<T: Transport> {
    transport: T,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    session: String,
    jobs_rx: BoundedReceiver<UploadJob>,
    outcomes_tx: BoundedSender<UploadOutcome>,
}

impl<T: Transport> Uploader<T> {
    pub fn new(
        transport: T,
        limiter: Arc<RateLimiter>,
        retry: RetryConfig,
        session: impl Into<String>,
        jobs_rx: BoundedReceiver<UploadJob>,
        outcomes_tx: BoundedSender<UploadOutcome>,
    ) -> Self {
        Self {
            transport,
            limiter,
            retry,
            session: session.into(),
            jobs_rx,
            outcomes_tx,
        }
    }

    /// Process jobs until the queue closes (normal shutdown, after the
    /// manager's final flush) or the token cancels (hard stop; an
    /// in-flight retry is abandoned).
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("uploader started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                job = self.jobs_rx.next() => {
                    let Some(job) = job else { break };
                    let outcome = self.send_batch(job.batch, &cancel).await;
                    if self.outcomes_tx.send(outcome).await.is_err() {
                        debug!("outcome channel closed, stopping uploader");
                        break;
                    }
                }
            }
        }

        info!("uploader stopped");
    }

    async fn send_batch(&self, mut batch: Batch, cancel: &CancellationToken) -> UploadOutcome {
        let stream = batch.stream.clone();
        let spans = batch.spans_by_file();

        let request = match request::build_request(&self.session, &batch) {
            Ok(r) => r,
            Err(e) => {
                return UploadOutcome {
                    stream,
                    spans,
                    attempts: 0,
                    result: UploadResult::Dropped {
                        error: format!("failed to encode batch: {}", e),
                    },
                };
            }
        };

        let mut retry = RetryState::new(self.retry.clone());

        loop {
            batch.attempts += 1;
            self.limiter.acquire(request.body.len() as u64).await;

            match self.transport.send(request.clone()).await {
                Ok(resp) if resp.is_success() => {
                    debug!(
                        stream = %stream,
                        records = batch.records.len(),
                        attempts = batch.attempts,
                        "batch acknowledged"
                    );
                    return UploadOutcome {
                        stream,
                        spans,
                        attempts: batch.attempts,
                        result: UploadResult::Acked {
                            offsets: resp.committed,
                        },
                    };
                }
                Ok(resp) if is_retryable_status(resp.status) => {
                    warn!(
                        stream = %stream,
                        status = resp.status,
                        attempt = batch.attempts,
                        "upload rejected, will retry"
                    );
                }
                Ok(resp) => {
                    return UploadOutcome {
                        stream,
                        spans,
                        attempts: batch.attempts,
                        result: UploadResult::Dropped {
                            error: format!("backend rejected upload with status {}", resp.status),
                        },
                    };
                }
                Err(e) => {
                    warn!(
                        stream = %stream,
                        attempt = batch.attempts,
                        "upload failed: {}",
                        e
                    );
                }
            }

            match retry.next_delay(batch.attempts) {
                Some(delay) => {
                    debug!(delay = ?delay, "backing off before retry");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return UploadOutcome {
                                stream,
                                spans,
                                attempts: batch.attempts,
                                result: UploadResult::Dropped {
                                    error: "shutdown during retry backoff".to_string(),
                                },
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    return UploadOutcome {
                        stream,
                        spans,
                        attempts: batch.attempts,
                        result: UploadResult::Dropped {
                            error: format!("retry attempts exhausted after {}", batch.attempts),
                        },
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::tailer::Record;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted transport: pops the next canned result per send.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<UploadResponse, TransportError>>>,
        sends: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(mut script: Vec<Result<UploadResponse, TransportError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                sends: AtomicU32::new(0),
            }
        }

        fn sends(&self) -> u32 {
            self.sends.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn send(
            &self,
            _request: request::UploadRequest,
        ) -> BoxFuture<'_, Result<UploadResponse, TransportError>> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .expect("transport script exhausted");
            Box::pin(async move { next })
        }
    }

    fn test_batch(id: FileId, lines: usize) -> Batch {
        let mut records = Vec::new();
        let mut offset = 0;
        for i in 0..lines {
            let line = format!("line {}", i);
            records.push(Record {
                file_id: id,
                span: RecordSpan::new(offset, line.len() as u32 + 1),
                line,
            });
            offset += 8;
        }
        Batch {
            stream: "a.log".to_string(),
            records,
            attempts: 0,
        }
    }

    fn ack(id: FileId, offset: u64) -> Result<UploadResponse, TransportError> {
        Ok(UploadResponse {
            status: 200,
            committed: HashMap::from([(id, offset)]),
        })
    }

    fn status(code: u16) -> Result<UploadResponse, TransportError> {
        Ok(UploadResponse {
            status: code,
            committed: HashMap::new(),
        })
    }

    fn uploader_over(
        transport: ScriptedTransport,
        retry: RetryConfig,
    ) -> (
        Uploader<ScriptedTransport>,
        BoundedSender<UploadJob>,
        BoundedReceiver<UploadOutcome>,
    ) {
        let (jobs_tx, jobs_rx) = bounded(4);
        let (outcomes_tx, outcomes_rx) = bounded(4);
        let uploader = Uploader::new(
            transport,
            Arc::new(RateLimiter::new(RateLimitConfig {
                bytes_per_sec: 0,
                requests_per_sec: 0,
            })),
            retry,
            "test-session",
            jobs_rx,
            outcomes_tx,
        );
        (uploader, jobs_tx, outcomes_rx)
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(5),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn ack_after_two_failures_records_three_attempts() {
        let id = FileId::new(1, 1);
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect),
            status(503),
            ack(id, 16),
        ]);

        let (uploader, jobs_tx, mut outcomes_rx) = uploader_over(transport, fast_retry(5));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(uploader.run(cancel.clone()));

        jobs_tx
            .send(UploadJob {
                batch: test_batch(id, 2),
            })
            .await
            .unwrap();

        let outcome = outcomes_rx.next().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        match outcome.result {
            UploadResult::Acked { offsets } => assert_eq!(offsets.get(&id), Some(&16)),
            other => panic!("expected ack, got {:?}", other),
        }

        drop(jobs_tx);
        handle.await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn attempt_cap_drops_batch_with_terminal_error() {
        let id = FileId::new(1, 1);
        let transport = ScriptedTransport::new(vec![status(500), status(500), status(500)]);

        let (uploader, jobs_tx, mut outcomes_rx) = uploader_over(transport, fast_retry(3));
        let handle = tokio::spawn(uploader.run(CancellationToken::new()));

        jobs_tx
            .send(UploadJob {
                batch: test_batch(id, 1),
            })
            .await
            .unwrap();

        let outcome = outcomes_rx.next().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, UploadResult::Dropped { .. }));
        assert!(!outcome.spans.is_empty());

        drop(jobs_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn non_retryable_rejection_drops_immediately() {
        let id = FileId::new(1, 1);
        let transport = ScriptedTransport::new(vec![status(400)]);

        let (uploader, jobs_tx, mut outcomes_rx) = uploader_over(transport, fast_retry(5));
        let handle = tokio::spawn(uploader.run(CancellationToken::new()));

        jobs_tx
            .send(UploadJob {
                batch: test_batch(id, 1),
            })
            .await
            .unwrap();

        let outcome = outcomes_rx.next().await.unwrap();
        assert_eq!(outcome.attempts, 1);
        match outcome.result {
            UploadResult::Dropped { error } => assert!(error.contains("400")),
            other => panic!("expected drop, got {:?}", other),
        }

        drop(jobs_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn jobs_process_in_fifo_order() {
        let id = FileId::new(1, 1);
        let transport =
            ScriptedTransport::new(vec![ack(id, 8), ack(id, 16), ack(id, 24)]);

        let (uploader, jobs_tx, mut outcomes_rx) = uploader_over(transport, fast_retry(5));
        let handle = tokio::spawn(uploader.run(CancellationToken::new()));

        for _ in 0..3 {
            jobs_tx
                .send(UploadJob {
                    batch: test_batch(id, 1),
                })
                .await
                .unwrap();
        }

        let mut acked = Vec::new();
        for _ in 0..3 {
            let outcome = outcomes_rx.next().await.unwrap();
            if let UploadResult::Acked { offsets } = outcome.result {
                acked.push(*offsets.get(&id).unwrap());
            }
        }
        assert_eq!(acked, vec![8, 16, 24]);

        drop(jobs_tx);
        handle.await.unwrap();
    }
}
