//! Key to partition mapping.
//!
//! Writers and readers of a store must agree on the partition of every key
//! without talking to each other, so the mapping is a pure function of the
//! key bytes, the partition count, and a versioned algorithm identifier that
//! is recorded in the store's metadata.

use crate::error::{Error, Result};
use crate::types::PartitionId;
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Seed of the `xxhash64-v1` algorithm. Changing it changes every partition
/// assignment and therefore requires a data migration.
const XXHASH64_V1_SEED: u64 = 0x5AFE_CAFE_DEAD_BEEF;

/// Versioned partitioning algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PartitionerAlgorithm {
    /// Seeded XxHash64 of the raw key bytes, modulo the partition count.
    #[default]
    XxHash64V1,
}

impl PartitionerAlgorithm {
    /// Stable identifier stored with the store's metadata.
    pub fn id(&self) -> &'static str {
        match self {
            PartitionerAlgorithm::XxHash64V1 => "xxhash64-v1",
        }
    }

    /// Resolve an identifier. Unknown identifiers are rejected rather than
    /// silently mapped to a default.
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "xxhash64-v1" => Ok(PartitionerAlgorithm::XxHash64V1),
            other => Err(Error::Config(format!("unknown partitioner algorithm: {}", other))),
        }
    }
}

/// Maps keys to partitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Partitioner {
    algorithm: PartitionerAlgorithm,
}

impl Partitioner {
    /// Create a partitioner for the given algorithm.
    pub fn new(algorithm: PartitionerAlgorithm) -> Self {
        Self { algorithm }
    }

    /// The algorithm in use.
    pub fn algorithm(&self) -> PartitionerAlgorithm {
        self.algorithm
    }

    /// Hash a key with the configured algorithm.
    pub fn hash_key(&self, key: &[u8]) -> u64 {
        match self.algorithm {
            PartitionerAlgorithm::XxHash64V1 => {
                let mut hasher = XxHash64::with_seed(XXHASH64_V1_SEED);
                hasher.write(key);
                hasher.finish()
            }
        }
    }

    /// Partition of `key` in `[0, partition_count)`.
    ///
    /// Never panics. A partition count of zero is treated as one.
    pub fn partition(&self, key: &[u8], partition_count: u32) -> PartitionId {
        let count = partition_count.max(1) as u64;
        (self.hash_key(key) % count) as PartitionId
    }

    /// Group the indices of `keys` by partition.
    pub fn group_by_partition<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
        partition_count: u32,
    ) -> BTreeMap<PartitionId, Vec<usize>> {
        let mut groups: BTreeMap<PartitionId, Vec<usize>> = BTreeMap::new();
        for (idx, key) in keys.iter().enumerate() {
            let partition = self.partition(key.as_ref(), partition_count);
            groups.entry(partition).or_default().push(idx);
        }
        groups
    }
}
