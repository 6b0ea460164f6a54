//! Dual-path read validation.
//!
//! ```text
//!  get(key) ──► primary path (coordinator) ──────────► result to caller
//!      │                                     │
//!      │                                     └─ summary ─┐
//!      └──► TaskTracker: secondary.get(key) ─────────────┴─► compare ─► metrics
//!                 (own timeout, cancelled on close)                 ├─► warn!
//!                                                                   └─► events
//! ```
//!
//! The secondary path never changes what the caller receives and never
//! delays it: the comparison happens in the tracked task after the primary
//! result has already been returned.

use crate::config::DualReadConfig;
use crate::error::Result;
use crate::metrics::ClientMetrics;
use crate::types::VersionedValue;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// An independent client implementation used to cross-check reads.
#[async_trait]
pub trait SecondaryClient: Send + Sync + 'static {
    async fn get(&self, key: Bytes) -> Result<Option<Bytes>>;
}

/// Result of comparing the two paths for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DualReadOutcome {
    Match,
    Mismatch,
    PrimaryFailedSecondarySucceeded,
    SecondaryFailed,
    SecondaryTimedOut,
}

impl DualReadOutcome {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            DualReadOutcome::Match => "match",
            DualReadOutcome::Mismatch => "mismatch",
            DualReadOutcome::PrimaryFailedSecondarySucceeded => "primary_failed",
            DualReadOutcome::SecondaryFailed => "secondary_failed",
            DualReadOutcome::SecondaryTimedOut => "secondary_timed_out",
        }
    }
}

/// One comparison, delivered on the optional event stream.
#[derive(Debug, Clone)]
pub struct DualReadEvent {
    pub key: Bytes,
    pub outcome: DualReadOutcome,
    pub secondary_latency: Option<Duration>,
}

#[derive(Debug)]
enum PrimarySummary {
    Value(Option<Bytes>),
    Failed(&'static str),
}

enum SecondaryResult {
    Value(Option<Bytes>, Duration),
    Failed(String, Duration),
    TimedOut,
}

/// Runs secondary reads and compares them with the primary path.
pub struct DualReadValidator {
    secondary: Arc<dyn SecondaryClient>,
    secondary_timeout: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
    metrics: Arc<ClientMetrics>,
    events: Option<mpsc::Sender<DualReadEvent>>,
}

impl DualReadValidator {
    /// `cancel` stops every outstanding secondary read when cancelled.
    pub fn new(
        secondary: Arc<dyn SecondaryClient>,
        config: &DualReadConfig,
        metrics: Arc<ClientMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            secondary,
            secondary_timeout: config.secondary_timeout,
            tracker: TaskTracker::new(),
            cancel,
            metrics,
            events: None,
        }
    }

    /// Also publish every comparison on `events`. Events are dropped when
    /// the channel is full.
    pub fn with_events(mut self, events: mpsc::Sender<DualReadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Secondary reads still running or waiting for their primary.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Start the secondary read of `key`. The returned handle takes the
    /// primary result once it is known.
    pub fn start(&self, key: Bytes) -> DualReadHandle {
        let (tx, rx) = oneshot::channel();
        let secondary = self.secondary.clone();
        let timeout = self.secondary_timeout;
        let cancel = self.cancel.clone();
        let metrics = self.metrics.clone();
        let events = self.events.clone();

        self.tracker.spawn(async move {
            let started = Instant::now();
            let secondary_result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, secondary.get(key.clone())) => match result {
                    Ok(Ok(value)) => SecondaryResult::Value(value, started.elapsed()),
                    Ok(Err(e)) => SecondaryResult::Failed(e.to_string(), started.elapsed()),
                    Err(_) => SecondaryResult::TimedOut,
                },
            };

            let primary = tokio::select! {
                _ = cancel.cancelled() => return,
                primary = rx => match primary {
                    Ok(primary) => primary,
                    Err(_) => {
                        trace!("Primary read abandoned, skipping comparison");
                        return;
                    }
                },
            };

            let (outcome, latency) = compare(&key, primary, secondary_result);
            metrics.record_dual_read(outcome.label(), latency);
            if let Some(events) = events {
                let event = DualReadEvent {
                    key,
                    outcome,
                    secondary_latency: latency,
                };
                if events.try_send(event).is_err() {
                    trace!("Dual read event dropped");
                }
            }
        });

        DualReadHandle { primary: tx }
    }

    /// Cancel outstanding secondary reads and wait for their tasks.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Dual read validator closed");
    }
}

fn compare(
    key: &Bytes,
    primary: PrimarySummary,
    secondary: SecondaryResult,
) -> (DualReadOutcome, Option<Duration>) {
    match (primary, secondary) {
        (_, SecondaryResult::TimedOut) => (DualReadOutcome::SecondaryTimedOut, None),
        (_, SecondaryResult::Failed(error, latency)) => {
            debug!(error = %error, "Secondary read failed");
            (DualReadOutcome::SecondaryFailed, Some(latency))
        }
        (PrimarySummary::Value(primary), SecondaryResult::Value(secondary, latency)) => {
            if primary == secondary {
                (DualReadOutcome::Match, Some(latency))
            } else {
                warn!(
                    key = ?key,
                    primary_present = primary.is_some(),
                    secondary_present = secondary.is_some(),
                    "Dual read mismatch"
                );
                (DualReadOutcome::Mismatch, Some(latency))
            }
        }
        (PrimarySummary::Failed(kind), SecondaryResult::Value(_, latency)) => {
            warn!(key = ?key, primary_error = kind, "Primary read failed but secondary succeeded");
            (DualReadOutcome::PrimaryFailedSecondarySucceeded, Some(latency))
        }
    }
}

/// Hands the primary result of one read to its secondary task.
#[derive(Debug)]
pub struct DualReadHandle {
    primary: oneshot::Sender<PrimarySummary>,
}

impl DualReadHandle {
    pub fn complete(self, primary: &Result<Option<VersionedValue>>) {
        let summary = match primary {
            Ok(value) => PrimarySummary::Value(value.as_ref().map(|v| v.value.clone())),
            Err(e) => PrimarySummary::Failed(e.kind()),
        };
        let _ = self.primary.send(summary);
    }
}
