//! Ordering of candidate replicas for one request.

use crate::config::{SelectionStrategy, SelectorConfig};
use crate::types::InstanceEndpoint;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Orders replicas and remembers which instances recently failed.
///
/// Blocklisted instances are demoted, never dropped: a partition whose
/// replicas all failed recently is still attempted.
#[derive(Debug)]
pub struct ReplicaSelector {
    config: SelectorConfig,

    /// Instance -> end of its blocklist period.
    blocklist: DashMap<InstanceEndpoint, Instant>,

    /// Instance -> attempts currently running against it.
    in_flight: DashMap<InstanceEndpoint, Arc<AtomicUsize>>,
}

impl ReplicaSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            blocklist: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.config.strategy
    }

    /// Candidate order for one request: healthy instances first, each group
    /// ordered by the configured strategy. Empty input gives empty output.
    pub fn select(&self, replicas: &[InstanceEndpoint]) -> Vec<InstanceEndpoint> {
        if replicas.len() <= 1 {
            return replicas.to_vec();
        }

        let mut shuffled = replicas.to_vec();
        shuffled.shuffle(&mut rand::rng());

        let (mut healthy, mut blocked): (Vec<_>, Vec<_>) =
            shuffled.into_iter().partition(|ep| !self.is_blocked(ep));

        if self.config.strategy == SelectionStrategy::LeastLoaded {
            // Stable sort keeps the shuffle as the tie-break.
            healthy.sort_by_key(|ep| self.in_flight(ep));
            blocked.sort_by_key(|ep| self.in_flight(ep));
        }

        healthy.append(&mut blocked);
        healthy
    }

    /// Demote `endpoint` for the configured TTL.
    pub fn mark_unhealthy(&self, endpoint: &InstanceEndpoint) {
        let until = Instant::now() + self.config.blocklist_ttl;
        if self.blocklist.insert(endpoint.clone(), until).is_none() {
            debug!(endpoint = %endpoint, ttl = ?self.config.blocklist_ttl, "Replica blocklisted");
        }
    }

    pub fn mark_healthy(&self, endpoint: &InstanceEndpoint) {
        if self.blocklist.remove(endpoint).is_some() {
            debug!(endpoint = %endpoint, "Replica removed from blocklist");
        }
    }

    pub fn is_blocked(&self, endpoint: &InstanceEndpoint) -> bool {
        let now = Instant::now();
        let blocked = match self.blocklist.get(endpoint) {
            Some(until) => *until > now,
            None => return false,
        };
        if !blocked {
            self.blocklist.remove_if(endpoint, |_, until| *until <= now);
        }
        blocked
    }

    pub fn blocked_count(&self) -> usize {
        let now = Instant::now();
        self.blocklist.iter().filter(|e| *e.value() > now).count()
    }

    /// Attempts currently running against `endpoint`.
    pub fn in_flight(&self, endpoint: &InstanceEndpoint) -> usize {
        self.in_flight
            .get(endpoint)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Count an attempt against `endpoint` until the guard is dropped.
    pub fn track(&self, endpoint: &InstanceEndpoint) -> InFlightGuard {
        let counter = self
            .in_flight
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counter }
    }
}

impl Default for ReplicaSelector {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}

/// Decrements the in-flight count of an instance on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
