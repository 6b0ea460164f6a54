//! Client-side routing core for a partitioned, replicated key-value store.
//!
//! This crate is embedded in caller processes. For every key it:
//! - resolves the store's **current version**, partition count and schemas
//!   from a cached metadata snapshot
//! - maps the key to a **partition** with a deterministic hash
//! - orders the partition's **ready replicas**, demoting unhealthy ones
//! - runs **hedged attempts** under one deadline, cancelling the losers
//! - optionally mirrors the read through a **secondary client** and compares
//!   the two answers off the caller's path
//!
//! # Example
//!
//! ```rust,no_run
//! use kvrouter::{ClientConfig, HedgingPolicy, StoreClient};
//! use kvrouter::testing::MockCluster;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any ClusterMetadataSource / SchemaSource works here.
//!     let cluster = Arc::new(MockCluster::new());
//!
//!     let config = ClientConfig::new("users")
//!         .with_request_timeout(Duration::from_millis(200))
//!         .with_hedging(HedgingPolicy::SequentialWithFallback {
//!             hedge_delay: Duration::from_millis(5),
//!             max_in_flight: 2,
//!         });
//!
//!     let client = StoreClient::builder(config)
//!         .with_sources(cluster.clone(), cluster)
//!         .build()?;
//!     client.start().await?;
//!
//!     match client.get("user:123").await? {
//!         Some(value) => println!("Found: {:?}", value),
//!         None => println!("Not found"),
//!     }
//!
//!     let batch = client.batch_get(["user:1", "user:2", "user:3"]).await?;
//!     println!("{} of {} keys found", batch.found(), batch.len());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │              StoreClient API                │
//! │  • get(key) -> Option<Bytes>                │
//! │  • batch_get(keys) -> BatchGetResponse      │
//! │  • start() / close()                        │
//! └─────────────────────────────────────────────┘
//!        │             │              │
//!        ▼             ▼              ▼
//! ┌────────────┐ ┌───────────┐ ┌─────────────┐
//! │  Metadata  │ │ Selector  │ │  Execution  │──► Transport ──► replicas
//! │ (ArcSwap)  │ │(blocklist)│ │  (hedging)  │
//! └────────────┘ └───────────┘ └─────────────┘
//!                                     │
//!                                     └─► DualReadValidator ──► secondary
//! ```
//!
//! # Consistency Model
//!
//! - A request reads version, partition count, replicas and schemas from
//!   **one** snapshot, even if a refresh publishes a newer one meanwhile.
//! - A key that does not exist is `Ok(None)`, never an error.
//! - Only one terminal error is returned per request, or per key of a batch.

pub mod client;
pub mod config;
pub mod dual_read;
pub mod error;
pub mod execution;
pub mod metadata;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod routing;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use client::{BatchGetResponse, GetHandle, StoreClient, StoreClientBuilder};
pub use config::{
    ClientConfig, DualReadConfig, HedgingPolicy, MetadataConfig, RetryPolicy, SelectionStrategy,
    SelectorConfig, TlsConfig,
};
pub use error::{Error, Result, TransportError};
pub use types::{InstanceEndpoint, PartitionId, SchemaEntry, SchemaId, StoreVersion, VersionNumber, VersionedValue};

// Re-export metadata types
pub use metadata::{
    ClusterMetadataSource, MetadataRepository, MetadataSnapshot, SchemaSource, StaticStoreMetadata,
    StoreMetadata,
};

// Re-export dual read types
pub use dual_read::{DualReadEvent, DualReadOutcome, SecondaryClient};

// Re-export partitioning types
pub use partitioning::{Partitioner, PartitionerAlgorithm};

// Re-export metrics types
pub use metrics::{ClientMetrics, MetricsSnapshot};
