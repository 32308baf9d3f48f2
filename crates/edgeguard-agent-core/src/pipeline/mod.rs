//! Delivery pipeline - accept, batch, transmit, spill, drain.
//!
//! The pipeline is a service task plus a cheap handle, so collectors never
//! block: [`PipelineHandle::submit`] enqueues into a bounded channel and
//! returns. The service accumulates a pending batch of up to `batch_size`
//! records or `flush_interval`, whichever fills first, then flushes:
//!
//! - live send of `POST /api/v1/telemetry` with bounded retries;
//! - on terminal failure, the serialized batch spills to the persistent
//!   buffer (pruning oldest entries to make room when it is full);
//! - on any live success, buffered batches are drained in filename-time
//!   order, stopping at the first failure.
//!
//! Flushes are serialized by construction - the service owns the pending
//! batch and sends one batch at a time.

use crate::buffer::{BufferError, PersistentBuffer};
use crate::collectors::CollectorRecord;
use crate::retry::{self, RetryError, RetryPolicy};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Submissions queued ahead of the service task before `submit` drops.
const SUBMIT_QUEUE_DEPTH: usize = 1024;

/// A batch of collector records plus envelope metadata, submitted as one
/// unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<CollectorRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("server returned status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
}

fn is_transient(err: &DeliveryError) -> bool {
    match err {
        DeliveryError::Network(_) => true,
        DeliveryError::Status { status, .. } => {
            status.is_server_error()
                || *status == StatusCode::REQUEST_TIMEOUT
                || *status == StatusCode::TOO_MANY_REQUESTS
        }
    }
}

/// Handle given to the scheduler; cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<CollectorRecord>,
}

impl PipelineHandle {
    /// Queues one record for delivery. Never blocks: when the service is
    /// backed up the record is dropped with a warning (disk buffering
    /// happens downstream, after batching).
    pub fn submit(&self, record: CollectorRecord) {
        if let Err(e) = self.tx.try_send(record) {
            warn!("telemetry submission dropped: {e}");
        }
    }

    /// Handle wired to a bare channel, for exercising producers without a
    /// running service.
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::Receiver<CollectorRecord>) {
        let (tx, rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        (Self { tx }, rx)
    }
}

/// The delivery service. Run it with [`DeliveryPipeline::run`] on its own
/// task; it exits after a final flush when the cancellation token fires.
pub struct DeliveryPipeline {
    rx: mpsc::Receiver<CollectorRecord>,
    client: reqwest::Client,
    telemetry_url: String,
    agent_id: String,
    batch_size: usize,
    flush_interval: std::time::Duration,
    buffer: PersistentBuffer,
    cancel: CancellationToken,
    retry_policy: RetryPolicy,
    pending: Vec<CollectorRecord>,
}

impl DeliveryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        api_base_url: &str,
        agent_id: &str,
        batch_size: usize,
        flush_interval: std::time::Duration,
        buffer: PersistentBuffer,
        cancel: CancellationToken,
    ) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        (
            Self {
                rx,
                client,
                telemetry_url: format!("{api_base_url}/api/v1/telemetry"),
                agent_id: agent_id.to_string(),
                batch_size,
                flush_interval,
                buffer,
                cancel,
                retry_policy: RetryPolicy::delivery(),
                pending: Vec::new(),
            },
            PipelineHandle { tx },
        )
    }

    /// Overrides the send retry policy (the default is
    /// [`RetryPolicy::delivery`]).
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                maybe_record = self.rx.recv() => {
                    match maybe_record {
                        Some(record) => {
                            self.pending.push(record);
                            if self.pending.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => {
                            self.flush().await;
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    self.flush().await;
                }
                () = self.cancel.cancelled() => {
                    debug!("delivery pipeline shutting down, performing final flush");
                    self.flush().await;
                    break;
                }
            }
        }
    }

    /// Sends the pending batch, spilling to disk on terminal failure and
    /// draining the buffer after a live success.
    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let batch = TelemetryBatch {
            agent_id: self.agent_id.clone(),
            timestamp: Utc::now(),
            data: std::mem::take(&mut self.pending),
        };

        let body = match serde_json::to_vec(&batch) {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to serialize telemetry batch, dropping: {e}");
                return;
            }
        };

        debug!("flushing {} records", batch.data.len());

        match self.send_with_retry(&body).await {
            Ok(()) => {
                debug!("sent {} records", batch.data.len());
                self.drain_buffer().await;
            }
            Err(e) => {
                warn!("failed to send telemetry, buffering: {e}");
                self.spill(&body);
            }
        }
    }

    async fn send_with_retry(&self, body: &[u8]) -> Result<(), String> {
        retry::retry_with_backoff(&self.retry_policy, &self.cancel, is_transient, || async {
            self.send_once(body).await
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => "cancelled".to_string(),
            RetryError::Permanent(err) => err.to_string(),
            RetryError::Exhausted { attempts, last } => {
                format!("all {attempts} attempts failed: {last}")
            }
        })
    }

    async fn send_once(&self, body: &[u8]) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.telemetry_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status { status, body })
    }

    /// Writes a failed batch to the buffer, evicting oldest entries when
    /// the budget is exhausted. A record larger than the whole budget is
    /// dropped outright.
    fn spill(&self, body: &[u8]) {
        match self.buffer.write(body) {
            Ok(()) => {}
            Err(BufferError::Full { .. }) => {
                let target = self.buffer.max_bytes().saturating_sub(body.len() as u64);
                if let Err(e) = self.buffer.prune_to(target) {
                    warn!("buffer prune failed: {e}");
                }
                if let Err(e) = self.buffer.write(body) {
                    warn!("dropping batch, buffer write failed after prune: {e}");
                }
            }
            Err(e) => warn!("dropping batch, buffer write failed: {e}"),
        }
    }

    /// Re-sends buffered batches in filename-time order, one at a time.
    /// Stops at the first failure (the network is presumed down again);
    /// clears the buffer only after every entry went through.
    async fn drain_buffer(&self) {
        let mut batches = match self.buffer.read_all() {
            Ok(batches) => batches,
            Err(e) => {
                warn!("failed to read buffer: {e}");
                return;
            }
        };
        if batches.is_empty() {
            return;
        }

        batches.sort_by_key(|b| b.timestamp_nanos().unwrap_or(u128::MAX));
        info!("draining {} buffered batches", batches.len());

        for batch in &batches {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.send_once(&batch.data).await {
                warn!("failed to send buffered batch {}: {e}", batch.name);
                return;
            }
        }

        match self.buffer.clear() {
            Ok(()) => info!("drained all buffered batches"),
            Err(e) => warn!("failed to clear buffer after drain: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{CollectorRecord, MemoryStats};

    fn record() -> CollectorRecord {
        CollectorRecord::Memory(MemoryStats {
            total_mb: 1,
            available_mb: 1,
            used_mb: 0,
            used_percent: 0.0,
            free_mb: 1,
        })
    }

    fn pipeline_with(
        dir: &std::path::Path,
        api_base_url: &str,
        batch_size: usize,
    ) -> (DeliveryPipeline, PipelineHandle) {
        let buffer = PersistentBuffer::open(dir, 1024 * 1024).expect("buffer");
        DeliveryPipeline::new(
            reqwest::Client::new(),
            api_base_url,
            "agent-test",
            batch_size,
            std::time::Duration::from_secs(60),
            buffer,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_batch_wire_format() {
        let batch = TelemetryBatch {
            agent_id: "agent-1".to_string(),
            timestamp: Utc::now(),
            data: vec![record()],
        };

        let json = serde_json::to_value(&batch).expect("serialize");
        assert_eq!(json["agent_id"], "agent-1");
        assert_eq!(json["data"][0]["kind"], "memory");
        // RFC 3339 envelope timestamp.
        assert!(json["timestamp"].as_str().expect("ts").contains('T'));
    }

    #[test]
    fn test_delivery_transient_classification() {
        let status = |code: u16| DeliveryError::Status {
            status: StatusCode::from_u16(code).expect("status"),
            body: String::new(),
        };
        assert!(is_transient(&status(503)));
        assert!(is_transient(&status(429)));
        assert!(is_transient(&status(408)));
        assert!(!is_transient(&status(400)));
        assert!(!is_transient(&status(413)));
    }

    #[tokio::test]
    async fn test_submit_is_nonblocking_when_service_is_gone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, handle) = pipeline_with(dir.path(), "http://127.0.0.1:9", 10);
        drop(pipeline);

        // A dead service must not block or panic the caller.
        for _ in 0..10 {
            handle.submit(record());
        }
    }

    #[tokio::test]
    async fn test_spill_prunes_to_make_room() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = PersistentBuffer::open(dir.path(), 64).expect("buffer");
        let (pipeline, _handle) = DeliveryPipeline::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "agent-test",
            10,
            std::time::Duration::from_secs(60),
            buffer,
            CancellationToken::new(),
        );

        let old = vec![b'a'; 40];
        let newer = vec![b'b'; 40];
        pipeline.spill(&old);
        pipeline.spill(&newer);

        // The newest spill evicted the oldest; the budget holds.
        assert!(pipeline.buffer.size() <= 64);
        let batches = pipeline.buffer.read_all().expect("read_all");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].data, newer);
    }
}
