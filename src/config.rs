//! Configuration types for the store client.
//!
//! A [`ClientConfig`] is built once, validated when the client is built, and
//! never changes for the lifetime of that client.

use crate::error::{Error, Result};
use std::time::Duration;

/// Main configuration for a store client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Logical store to read from.
    pub store_name: String,

    /// Wall-clock budget for one logical request.
    pub request_timeout: Duration,

    /// How redundant attempts are issued.
    pub hedging: HedgingPolicy,

    /// Attempt budget and backoff.
    pub retry: RetryPolicy,

    /// Dual-path read validation.
    pub dual_read: DualReadConfig,

    /// Metadata cache refresh behaviour.
    pub metadata: MetadataConfig,

    /// Replica ordering and blocklisting.
    pub selector: SelectorConfig,

    /// TLS settings for replica connections.
    pub tls: TlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_name: String::new(),
            request_timeout: Duration::from_millis(500),
            hedging: HedgingPolicy::default(),
            retry: RetryPolicy::default(),
            dual_read: DualReadConfig::default(),
            metadata: MetadataConfig::default(),
            selector: SelectorConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given store.
    pub fn new(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            ..Default::default()
        }
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the hedging policy.
    pub fn with_hedging(mut self, hedging: HedgingPolicy) -> Self {
        self.hedging = hedging;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable dual-path reads.
    pub fn with_dual_read_enabled(mut self, enabled: bool) -> Self {
        self.dual_read.enabled = enabled;
        self
    }

    /// Set the secondary path timeout used by dual reads.
    pub fn with_secondary_timeout(mut self, timeout: Duration) -> Self {
        self.dual_read.secondary_timeout = timeout;
        self
    }

    /// Set the metadata refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.metadata.refresh_interval = interval;
        self
    }

    /// Set the full metadata configuration.
    pub fn with_metadata_config(mut self, metadata: MetadataConfig) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the replica selector configuration.
    pub fn with_selector_config(mut self, selector: SelectorConfig) -> Self {
        self.selector = selector;
        self
    }

    /// Set TLS settings. Enabling TLS needs a caller-supplied connector.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Check the configuration for values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store_name.is_empty() {
            return Err(Error::Config("store name must not be empty".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be positive".into()));
        }
        match self.hedging {
            HedgingPolicy::SequentialWithFallback { max_in_flight, .. } if max_in_flight == 0 => {
                return Err(Error::Config("max_in_flight must be at least 1".into()));
            }
            HedgingPolicy::Parallel { fan_out } if fan_out == 0 => {
                return Err(Error::Config("parallel fan-out must be at least 1".into()));
            }
            _ => {}
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.metadata.refresh_interval.is_zero() {
            return Err(Error::Config("metadata refresh interval must be positive".into()));
        }
        if self.dual_read.enabled && self.dual_read.secondary_timeout.is_zero() {
            return Err(Error::Config("secondary timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Hedging (speculative execution) policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgingPolicy {
    /// One attempt at a time; the next candidate is tried only after a
    /// retryable failure.
    None,

    /// Start with one attempt and add another whenever `hedge_delay` passes
    /// without a response or an attempt fails retryably.
    SequentialWithFallback {
        hedge_delay: Duration,
        max_in_flight: usize,
    },

    /// Start `fan_out` attempts at once.
    Parallel { fan_out: usize },
}

impl Default for HedgingPolicy {
    fn default() -> Self {
        HedgingPolicy::SequentialWithFallback {
            hedge_delay: Duration::from_millis(10),
            max_in_flight: 2,
        }
    }
}

impl HedgingPolicy {
    /// Upper bound of concurrent attempts for one logical request.
    pub fn max_in_flight(&self) -> usize {
        match *self {
            HedgingPolicy::None => 1,
            HedgingPolicy::SequentialWithFallback { max_in_flight, .. } => max_in_flight.max(1),
            HedgingPolicy::Parallel { fan_out } => fan_out.max(1),
        }
    }

    /// Number of attempts issued immediately.
    pub fn initial_attempts(&self) -> usize {
        match *self {
            HedgingPolicy::Parallel { fan_out } => fan_out.max(1),
            _ => 1,
        }
    }

    /// Delay after which an unanswered attempt is hedged.
    pub fn hedge_delay(&self) -> Option<Duration> {
        match *self {
            HedgingPolicy::SequentialWithFallback { hedge_delay, .. } => Some(hedge_delay),
            _ => None,
        }
    }
}

/// Attempt budget for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts across all candidates. A parallel fan-out larger than
    /// this raises the budget to the fan-out.
    pub max_attempts: usize,

    /// Pause before an attempt that revisits an already tried candidate.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Dual-path read configuration.
#[derive(Debug, Clone)]
pub struct DualReadConfig {
    /// Whether every get is mirrored through the secondary client.
    pub enabled: bool,

    /// Own timeout of the secondary path.
    pub secondary_timeout: Duration,
}

impl Default for DualReadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secondary_timeout: Duration::from_secs(1),
        }
    }
}

/// Metadata cache configuration.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Interval of the background refresh loop.
    pub refresh_interval: Duration,

    /// How long a retired version stays resolvable after a newer version
    /// became current.
    pub retired_version_grace: Duration,

    /// Minimum spacing between on-demand refreshes.
    pub min_on_demand_interval: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            retired_version_grace: Duration::from_secs(30),
            min_on_demand_interval: Duration::from_millis(100),
        }
    }
}

impl MetadataConfig {
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_retired_version_grace(mut self, grace: Duration) -> Self {
        self.retired_version_grace = grace;
        self
    }

    pub fn with_min_on_demand_interval(mut self, interval: Duration) -> Self {
        self.min_on_demand_interval = interval;
        self
    }
}

/// How candidates are ordered for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Uniformly shuffled.
    #[default]
    Random,
    /// Fewest in-flight attempts first, shuffled among equals.
    LeastLoaded,
}

/// Replica selector configuration.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub strategy: SelectionStrategy,

    /// How long a failed instance stays at the back of the order.
    pub blocklist_ttl: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Random,
            blocklist_ttl: Duration::from_secs(5),
        }
    }
}

impl SelectorConfig {
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_blocklist_ttl(mut self, ttl: Duration) -> Self {
        self.blocklist_ttl = ttl;
        self
    }
}

/// TLS settings for replica connections.
///
/// This crate does no TLS handshake of its own. Enabling TLS requires a
/// caller-supplied [`StreamConnector`](crate::network::StreamConnector)
/// whose `supports_tls()` returns true, passed through
/// [`StoreClientBuilder::with_connector`](crate::StoreClientBuilder::with_connector).
/// With the default plain TCP connector, `build()` fails with
/// [`Error::Config`](crate::Error::Config).
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Dial the instances' TLS ports through the caller-supplied connector.
    pub enabled: bool,
}

impl TlsConfig {
    /// TLS on. Pair with a TLS-capable connector on the client builder.
    pub fn enabled() -> Self {
        Self { enabled: true }
    }
}
