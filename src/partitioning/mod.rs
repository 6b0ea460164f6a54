//! Partitioning module: mapping keys to partitions.
//!
//! ```text
//! key bytes ──► XxHash64(seed) ──► hash % partition_count ──► partition id
//! ```
//!
//! The algorithm identifier is part of a store's metadata. Readers resolve it
//! with [`PartitionerAlgorithm::from_id`] and never fall back to another
//! algorithm, since a mismatch would route reads to the wrong partition.
//!
//! # Example
//!
//! ```rust
//! use kvrouter::partitioning::Partitioner;
//!
//! let partitioner = Partitioner::default();
//! let partition = partitioner.partition(b"user:123", 16);
//! assert!(partition < 16);
//! ```

mod partitioner;

pub use partitioner::{Partitioner, PartitionerAlgorithm};
