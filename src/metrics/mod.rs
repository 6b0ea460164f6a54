//! Per-client metrics.
//!
//! Every [`StoreClient`](crate::StoreClient) owns one [`ClientMetrics`]; two
//! clients in one process never share counters.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      ClientMetrics                         │
//! │  requests      attempts          dual reads     metadata   │
//! │  - gets        - launched        - outcomes     - version  │
//! │  - found/miss  - hedged/retried  - latency      - stale    │
//! │  - errors      - cancelled                                 │
//! │  - latency     - failures                                  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use kvrouter::metrics::ClientMetrics;
//! use std::time::Duration;
//!
//! let metrics = ClientMetrics::new();
//! metrics.record_get(Ok(true), Duration::from_micros(800));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.gets, 1);
//! assert_eq!(snapshot.found, 1);
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::{Gauge, GaugeGuard};
pub use histograms::{Histogram, HistogramSnapshot, LATENCY_BUCKETS};

use crate::error::Error;
use std::fmt::Write;
use std::time::Duration;

/// Why an attempt was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptTrigger {
    /// Part of the initial wave.
    Initial,
    /// The hedge delay passed without a response.
    Hedge,
    /// An earlier attempt failed retryably.
    Retry,
}

#[derive(Debug)]
pub struct ClientMetrics {
    pub gets: Counter,
    pub found: Counter,
    pub not_found: Counter,
    pub errors: LabeledCounter<1>,
    pub get_latency: Histogram,
    pub in_flight: Gauge,

    pub batch_gets: Counter,
    pub batch_keys: Counter,

    pub attempts: Counter,
    pub hedged_attempts: Counter,
    pub retried_attempts: Counter,
    pub cancelled_attempts: Counter,
    pub attempt_failures: LabeledCounter<1>,

    pub stale_metadata_retries: Counter,
    pub current_version: Gauge,

    pub dual_read_outcomes: LabeledCounter<1>,
    pub secondary_latency: Histogram,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            gets: Counter::new("kvrouter_get_total", "Logical single-key reads"),
            found: Counter::new("kvrouter_get_found_total", "Reads that returned a value"),
            not_found: Counter::new("kvrouter_get_not_found_total", "Reads of absent keys"),
            errors: LabeledCounter::new("kvrouter_get_errors_total", "Failed reads by error kind", ["kind"]),
            get_latency: Histogram::new("kvrouter_get_latency_seconds", "Logical read latency"),
            in_flight: Gauge::new("kvrouter_get_in_flight", "Logical reads in progress"),

            batch_gets: Counter::new("kvrouter_batch_get_total", "Batch reads"),
            batch_keys: Counter::new("kvrouter_batch_keys_total", "Distinct keys requested in batches"),

            attempts: Counter::new("kvrouter_attempts_total", "Replica attempts launched"),
            hedged_attempts: Counter::new(
                "kvrouter_hedged_attempts_total",
                "Attempts launched because the hedge delay passed",
            ),
            retried_attempts: Counter::new(
                "kvrouter_retried_attempts_total",
                "Attempts launched after a retryable failure",
            ),
            cancelled_attempts: Counter::new(
                "kvrouter_cancelled_attempts_total",
                "Attempts aborted before completing",
            ),
            attempt_failures: LabeledCounter::new(
                "kvrouter_attempt_failures_total",
                "Failed attempts by reason",
                ["reason"],
            ),

            stale_metadata_retries: Counter::new(
                "kvrouter_stale_metadata_retries_total",
                "Reads retried after a metadata refresh",
            ),
            current_version: Gauge::new("kvrouter_current_version", "Store version used by the last read"),

            dual_read_outcomes: LabeledCounter::new(
                "kvrouter_dual_read_total",
                "Dual-path comparisons by outcome",
                ["outcome"],
            ),
            secondary_latency: Histogram::new(
                "kvrouter_secondary_latency_seconds",
                "Secondary path latency",
            ),
        }
    }

    /// Record the end of a logical read. `Ok(true)` means a value was found.
    pub fn record_get(&self, result: Result<bool, &Error>, latency: Duration) {
        self.gets.inc();
        match result {
            Ok(true) => self.found.inc(),
            Ok(false) => self.not_found.inc(),
            Err(e) => self.errors.inc([e.kind()]),
        }
        self.get_latency.observe_duration(latency);
    }

    pub fn record_attempt(&self, trigger: AttemptTrigger) {
        self.attempts.inc();
        match trigger {
            AttemptTrigger::Initial => {}
            AttemptTrigger::Hedge => self.hedged_attempts.inc(),
            AttemptTrigger::Retry => self.retried_attempts.inc(),
        }
    }

    pub fn record_attempt_failure(&self, reason: &str) {
        self.attempt_failures.inc([reason]);
    }

    pub fn record_cancelled_attempts(&self, n: usize) {
        self.cancelled_attempts.inc_by(n as u64);
    }

    pub fn record_batch(&self, keys: usize) {
        self.batch_gets.inc();
        self.batch_keys.inc_by(keys as u64);
    }

    pub fn record_dual_read(&self, outcome: &str, secondary_latency: Option<Duration>) {
        self.dual_read_outcomes.inc([outcome]);
        if let Some(latency) = secondary_latency {
            self.secondary_latency.observe_duration(latency);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gets: self.gets.get(),
            found: self.found.get(),
            not_found: self.not_found.get(),
            errors: self.errors.total(),
            in_flight: self.in_flight.get(),
            attempts: self.attempts.get(),
            hedged_attempts: self.hedged_attempts.get(),
            retried_attempts: self.retried_attempts.get(),
            cancelled_attempts: self.cancelled_attempts.get(),
            stale_metadata_retries: self.stale_metadata_retries.get(),
            dual_read_mismatches: self.dual_read_outcomes.get(["mismatch"]),
            current_version: self.current_version.get(),
            get_latency: self.get_latency.snapshot(),
        }
    }

    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for counter in [
            &self.gets,
            &self.found,
            &self.not_found,
            &self.batch_gets,
            &self.batch_keys,
            &self.attempts,
            &self.hedged_attempts,
            &self.retried_attempts,
            &self.cancelled_attempts,
            &self.stale_metadata_retries,
        ] {
            let _ = writeln!(out, "# HELP {} {}", counter.name(), counter.help());
            let _ = writeln!(out, "# TYPE {} counter", counter.name());
            let _ = writeln!(out, "{} {}", counter.name(), counter.get());
        }

        for labeled in [&self.errors, &self.attempt_failures, &self.dual_read_outcomes] {
            let _ = writeln!(out, "# HELP {} {}", labeled.name(), labeled.help());
            let _ = writeln!(out, "# TYPE {} counter", labeled.name());
            let label = labeled.label_names()[0];
            for ([value], count) in labeled.get_all() {
                let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", labeled.name(), label, value, count);
            }
        }

        for gauge in [&self.in_flight, &self.current_version] {
            let _ = writeln!(out, "# HELP {} {}", gauge.name(), gauge.help());
            let _ = writeln!(out, "# TYPE {} gauge", gauge.name());
            let _ = writeln!(out, "{} {}", gauge.name(), gauge.get());
        }

        for histogram in [&self.get_latency, &self.secondary_latency] {
            let snap = histogram.snapshot();
            let name = histogram.name();
            let _ = writeln!(out, "# HELP {} {}", name, histogram.help());
            let _ = writeln!(out, "# TYPE {} histogram", name);
            for (bound, seen) in snap.bounds.iter().zip(&snap.cumulative) {
                let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, bound, seen);
            }
            let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, snap.count);
            let _ = writeln!(out, "{}_sum {}", name, snap.sum);
            let _ = writeln!(out, "{}_count {}", name, snap.count);
        }

        out
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the headline client metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub gets: u64,
    pub found: u64,
    pub not_found: u64,
    pub errors: u64,
    pub in_flight: i64,
    pub attempts: u64,
    pub hedged_attempts: u64,
    pub retried_attempts: u64,
    pub cancelled_attempts: u64,
    pub stale_metadata_retries: u64,
    pub dual_read_mismatches: u64,
    pub current_version: i64,
    pub get_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Share of reads that did not end in an error.
    pub fn success_rate(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            (self.found + self.not_found) as f64 / self.gets as f64
        }
    }

    /// Attempts per logical read.
    pub fn amplification(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            self.attempts as f64 / self.gets as f64
        }
    }

    pub fn avg_get_latency_ms(&self) -> f64 {
        self.get_latency.mean() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_get() {
        let metrics = ClientMetrics::new();
        metrics.record_get(Ok(true), Duration::from_micros(100));
        metrics.record_get(Ok(false), Duration::from_micros(100));
        metrics.record_get(
            Err(&Error::Timeout {
                elapsed: Duration::from_millis(5),
            }),
            Duration::from_millis(5),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gets, 3);
        assert_eq!(snapshot.found, 1);
        assert_eq!(snapshot.not_found, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(metrics.errors.get(["timeout"]), 1);
        assert!((snapshot.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_attempt_triggers() {
        let metrics = ClientMetrics::new();
        metrics.record_attempt(AttemptTrigger::Initial);
        metrics.record_attempt(AttemptTrigger::Hedge);
        metrics.record_attempt(AttemptTrigger::Retry);
        metrics.record_cancelled_attempts(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.hedged_attempts, 1);
        assert_eq!(snapshot.retried_attempts, 1);
        assert_eq!(snapshot.cancelled_attempts, 2);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = ClientMetrics::new();
        metrics.record_get(Ok(true), Duration::from_micros(100));
        metrics.record_attempt_failure("transport");
        metrics.record_dual_read("match", Some(Duration::from_millis(2)));

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE kvrouter_get_total counter"));
        assert!(output.contains("kvrouter_get_total 1"));
        assert!(output.contains("kvrouter_attempt_failures_total{reason=\"transport\"} 1"));
        assert!(output.contains("kvrouter_dual_read_total{outcome=\"match\"} 1"));
        assert!(output.contains("kvrouter_get_latency_seconds_count 1"));
    }
}
