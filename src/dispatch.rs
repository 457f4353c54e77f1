//! # Dispatch Worker
//!
//! Drains the queue in ordered batches.
//!
//! ## One Cycle
//!
//! ```text
//! loop:
//!   batch = peek_batch(batch_size)        ── empty? done
//!   body  = encode(batch)                 ── once per batch
//!   for endpoint in endpoints:            ── fan-out, every endpoint
//!       upload(endpoint, body) within upload_timeout
//!   all acknowledged? delete_up_to(batch.through), next batch
//!   otherwise:        stop, batch stays queued
//! ```
//!
//! ## At-Least-Once
//!
//! A batch is deleted only after every endpoint acknowledged it. When one
//! endpoint fails the whole batch is retried next cycle, including to the
//! endpoints that already took it. Each location carries its `sequence_id` so
//! endpoints can deduplicate.
//!
//! Newer batches are never attempted while an older one is unacknowledged.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::codec::encode_upload_body;
use crate::config::{DispatchConfig, Endpoint};
use crate::error::{FailureClass, Result, UploadError};
use crate::queue::DurableQueue;
use crate::upload::Uploader;

/// One endpoint that did not acknowledge a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub endpoint_url: String,
    pub error: UploadError,
}

/// Outcome of one `dispatch_pending` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Records acknowledged by every endpoint and deleted.
    pub sent: usize,

    /// Records in the batch that halted the cycle (still queued).
    pub failed: usize,

    /// Batches fully acknowledged.
    pub batches: usize,

    /// Corrupt rows deleted without upload.
    pub purged: usize,

    /// Endpoint failures for the halting batch.
    pub failures: Vec<EndpointFailure>,

    /// Another cycle was already running; this call did nothing.
    pub overlapped: bool,
}

impl DispatchReport {
    /// True when the cycle ended because the queue ran dry.
    pub fn drained(&self) -> bool {
        !self.overlapped && self.failures.is_empty()
    }
}

/// Uploads queued fixes. At most one cycle runs at a time.
pub struct DispatchWorker<U> {
    queue: DurableQueue,
    uploader: Arc<U>,
    config: DispatchConfig,
    cycle: Mutex<()>,
}

impl<U: Uploader> DispatchWorker<U> {
    pub fn new(queue: DurableQueue, uploader: Arc<U>, config: DispatchConfig) -> Self {
        Self {
            queue,
            uploader,
            config,
            cycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Runs one dispatch cycle against `endpoints`.
    ///
    /// Upload failures never come back as `Err`; they are in the report and
    /// the batch stays queued. `Err` means the queue itself failed.
    pub async fn dispatch_pending(&self, endpoints: &[Endpoint]) -> Result<DispatchReport> {
        let Ok(_guard) = self.cycle.try_lock() else {
            debug!("dispatch cycle already running, skipping");
            return Ok(DispatchReport {
                overlapped: true,
                ..DispatchReport::default()
            });
        };

        let mut report = DispatchReport::default();

        if endpoints.is_empty() {
            info!("no endpoints configured, nothing dispatched");
            return Ok(report);
        }

        loop {
            let batch = self.queue.peek_batch(self.config.batch_size).await?;
            let Some(through) = batch.through else {
                break;
            };

            if batch.records.is_empty() {
                let removed = self.queue.delete_up_to(through).await?;
                warn!("purged {removed} corrupt fixes through {through}");
                report.purged += removed;
                continue;
            }

            let failures = match encode_upload_body(&batch.records) {
                Ok(body) => self.fan_out(endpoints, &body).await,
                Err(e) => endpoints
                    .iter()
                    .map(|endpoint| EndpointFailure {
                        endpoint_url: endpoint.url.clone(),
                        error: e.clone(),
                    })
                    .collect(),
            };

            if !failures.is_empty() {
                report.failed = batch.records.len();
                report.failures = failures;
                info!(
                    "dispatch halted with {} fixes unacknowledged through {through}",
                    report.failed
                );
                break;
            }

            self.queue.delete_up_to(through).await?;
            report.sent += batch.records.len();
            report.batches += 1;
            debug!("batch through {through} acknowledged by all endpoints");
        }

        if report.sent > 0 {
            info!(
                "dispatched {} fixes in {} batches",
                report.sent, report.batches
            );
        }
        Ok(report)
    }

    /// Uploads `body` to every endpoint in order, returning those that failed.
    async fn fan_out(&self, endpoints: &[Endpoint], body: &[u8]) -> Vec<EndpointFailure> {
        let mut failures = Vec::new();

        for endpoint in endpoints {
            let outcome = tokio::time::timeout(
                self.config.upload_timeout,
                self.uploader.upload(endpoint, body),
            )
            .await
            .unwrap_or(Err(UploadError::Timeout));

            if let Err(error) = outcome {
                match error.class() {
                    FailureClass::Retryable => {
                        warn!("upload to {} failed, will retry: {error}", endpoint.url)
                    }
                    FailureClass::Permanent => {
                        error!("upload to {} rejected: {error}", endpoint.url)
                    }
                }
                failures.push(EndpointFailure {
                    endpoint_url: endpoint.url.clone(),
                    error,
                });
            }
        }

        failures
    }
}
