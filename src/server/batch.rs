//! Batch runner: probes many keys concurrently with cooperative cancellation

use crate::server::models::Endpoint;
use crate::server::probe::{ProbeMode, ProbeResult, Prober};
use crate::server::record::ServerKey;
use futures::future;
use futures::stream::{self, StreamExt};
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// A probe has been dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    /// Zero-based position in the input
    pub index: usize,
    pub total: usize,
    pub key_id: String,
    pub name: String,
}

/// A probe has completed
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub index: usize,
    pub key_id: String,
    pub name: String,
    pub address: String,
    pub result: ProbeResult,
    /// Average latency of the key after this probe
    pub average_latency: Option<f64>,
}

/// Events emitted during a batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Dispatched(BatchProgress),
    Finished(BatchItem),
}

/// Receives progress and per-key results from a running batch
pub trait BatchReporter {
    fn on_progress(&self, _progress: &BatchProgress) {}
    fn on_result(&self, _item: &BatchItem) {}
}

/// Reporter that ignores every event
pub struct SilentReporter;

impl BatchReporter for SilentReporter {}

impl BatchReporter for UnboundedSender<BatchEvent> {
    fn on_progress(&self, progress: &BatchProgress) {
        let _ = self.send(BatchEvent::Dispatched(progress.clone()));
    }

    fn on_result(&self, item: &BatchItem) {
        let _ = self.send(BatchEvent::Finished(item.clone()));
    }
}

/// Totals of a finished or cancelled batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.completed, self.total)
    }
}

/// Runs probes over a slice of keys
pub struct BatchRunner<'a> {
    prober: &'a Prober,
    concurrency: usize,
}

impl<'a> BatchRunner<'a> {
    /// Uses the prober's configured concurrency
    pub fn new(prober: &'a Prober) -> Self {
        Self {
            prober,
            concurrency: prober.config().concurrency,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Probe every key in input order until done or cancelled
    ///
    /// The token is checked before each dispatch. Probes already started when it
    /// fires run to completion and still update their key.
    pub async fn run<R>(
        &self,
        keys: &mut [ServerKey],
        mode: ProbeMode,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> BatchSummary
    where
        R: BatchReporter + ?Sized,
    {
        let total = keys.len();
        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };

        tracing::info!(total, %mode, concurrency = self.concurrency, "batch started");

        let prober = self.prober;
        let mut probes = stream::iter(keys.iter_mut().enumerate())
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|(index, key)| {
                reporter.on_progress(&BatchProgress {
                    index,
                    total,
                    key_id: key.id.clone(),
                    name: key.name.clone(),
                });
                async move {
                    let result = prober.probe(key, mode).await;
                    (index, key, result)
                }
            })
            .buffer_unordered(self.concurrency.max(1));

        while let Some((index, key, result)) = probes.next().await {
            summary.completed += 1;
            if result.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }

            reporter.on_result(&BatchItem {
                index,
                key_id: key.id.clone(),
                name: key.name.clone(),
                address: key.config.address(),
                average_latency: key.average_latency(),
                result,
            });
        }

        summary.cancelled = cancel.is_cancelled() && summary.completed < total;
        if summary.cancelled {
            tracing::warn!(completed = summary.completed, total, "batch cancelled");
        } else {
            tracing::info!(
                completed = summary.completed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "batch finished"
            );
        }

        summary
    }

    /// Run a batch that streams its events into a channel
    pub async fn run_with_channel(
        &self,
        keys: &mut [ServerKey],
        mode: ProbeMode,
        cancel: &CancellationToken,
        events: UnboundedSender<BatchEvent>,
    ) -> BatchSummary {
        self.run(keys, mode, cancel, &events).await
    }
}
