//! Immutable metadata snapshots.
//!
//! A snapshot is built once per refresh and published by swapping a single
//! pointer. Requests clone the `Arc` and resolve everything (version,
//! partition, replicas, schemas) against that one value.

use super::schema::SchemaSet;
use crate::error::{Error, Result};
use crate::partitioning::Partitioner;
use crate::types::{InstanceEndpoint, PartitionId, StoreVersion, VersionNumber};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Replica layout of one store version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionView {
    version: StoreVersion,
    resource_name: String,
    /// Ready-to-serve replicas, indexed by partition id.
    replicas: Vec<Vec<InstanceEndpoint>>,
}

impl VersionView {
    /// Create a view. `replicas` is padded or truncated to the version's
    /// partition count (a count of zero is treated as one partition).
    pub fn new(version: StoreVersion, mut replicas: Vec<Vec<InstanceEndpoint>>) -> Self {
        let partitions = version.partition_count.max(1) as usize;
        replicas.resize_with(partitions, Vec::new);
        Self {
            resource_name: version.resource_name(),
            version,
            replicas,
        }
    }

    pub fn version(&self) -> &StoreVersion {
        &self.version
    }

    pub fn number(&self) -> VersionNumber {
        self.version.number
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn partition_count(&self) -> u32 {
        self.version.partition_count
    }

    /// Ready replicas of a partition; empty for unknown partitions.
    pub fn replicas(&self, partition: PartitionId) -> &[InstanceEndpoint] {
        self.replicas
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A version that stopped being current but may still serve in-flight reads.
#[derive(Debug, Clone)]
struct RetainedVersion {
    view: Arc<VersionView>,
    evict_after: Instant,
}

/// Where a key routes to, resolved against one snapshot.
#[derive(Debug, Clone)]
pub struct Route {
    pub version: Arc<VersionView>,
    pub partition: PartitionId,
}

impl Route {
    pub fn resource_name(&self) -> &str {
        self.version.resource_name()
    }

    pub fn replicas(&self) -> &[InstanceEndpoint] {
        self.version.replicas(self.partition)
    }
}

/// Everything a request needs to route, captured at one instant.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    store_name: String,
    current: Arc<VersionView>,
    retained: BTreeMap<VersionNumber, RetainedVersion>,
    schemas: Arc<SchemaSet>,
    partitioner: Partitioner,
    /// Publish sequence number, increases with every refresh.
    generation: u64,
}

impl MetadataSnapshot {
    /// Create the first snapshot of a store.
    pub fn new(current: VersionView, schemas: SchemaSet) -> Self {
        Self {
            store_name: current.version().store_name.clone(),
            current: Arc::new(current),
            retained: BTreeMap::new(),
            schemas: Arc::new(schemas),
            partitioner: Partitioner::default(),
            generation: 0,
        }
    }

    pub fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Build the snapshot that follows this one.
    ///
    /// When the current version changes, the outgoing one is retained for
    /// `grace`. Retained versions whose grace has run out at `now` are
    /// dropped.
    pub fn successor(
        &self,
        current: VersionView,
        schemas: SchemaSet,
        partitioner: Partitioner,
        grace: Duration,
        now: Instant,
    ) -> Self {
        let mut retained: BTreeMap<_, _> = self
            .retained
            .iter()
            .filter(|(_, r)| r.evict_after > now)
            .map(|(number, r)| (*number, r.clone()))
            .collect();

        let current = Arc::new(current);
        if current.number() != self.current.number() {
            retained.insert(
                self.current.number(),
                RetainedVersion {
                    view: self.current.clone(),
                    evict_after: now + grace,
                },
            );
        }
        // A rollback may promote a retained version back to current.
        retained.remove(&current.number());

        Self {
            store_name: self.store_name.clone(),
            current,
            retained,
            schemas: Arc::new(schemas),
            partitioner,
            generation: self.generation + 1,
        }
    }

    /// Same routing with a different schema set, as the next generation.
    pub fn with_schemas(&self, schemas: SchemaSet) -> Self {
        Self {
            schemas: Arc::new(schemas),
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn current(&self) -> &Arc<VersionView> {
        &self.current
    }

    pub fn current_version(&self) -> &StoreVersion {
        self.current.version()
    }

    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Retired versions still inside their grace period.
    pub fn retained_versions(&self) -> Vec<VersionNumber> {
        let now = Instant::now();
        self.retained
            .iter()
            .filter(|(_, r)| r.evict_after > now)
            .map(|(number, _)| *number)
            .collect()
    }

    /// Layout of `version` if it is current or still retained.
    pub fn version_view(&self, version: VersionNumber) -> Result<&Arc<VersionView>> {
        if version == self.current.number() {
            return Ok(&self.current);
        }
        match self.retained.get(&version) {
            Some(r) if r.evict_after > Instant::now() => Ok(&r.view),
            _ => Err(Error::UnknownVersion {
                store: self.store_name.clone(),
                version,
            }),
        }
    }

    pub fn partition_count(&self, version: VersionNumber) -> Result<u32> {
        Ok(self.version_view(version)?.partition_count())
    }

    /// Ready replicas of `(version, partition)`. May be empty.
    pub fn ready_replicas(
        &self,
        version: VersionNumber,
        partition: PartitionId,
    ) -> Result<Vec<InstanceEndpoint>> {
        Ok(self.version_view(version)?.replicas(partition).to_vec())
    }

    /// Resolve a key against the current version.
    pub fn route(&self, key: &[u8]) -> Route {
        let partition = self
            .partitioner
            .partition(key, self.current.partition_count());
        Route {
            version: self.current.clone(),
            partition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaEntry;

    fn endpoints(ports: &[u16]) -> Vec<InstanceEndpoint> {
        ports
            .iter()
            .map(|p| InstanceEndpoint::new("127.0.0.1", *p))
            .collect()
    }

    fn view(number: VersionNumber, partitions: u32) -> VersionView {
        let replicas = (0..partitions)
            .map(|p| endpoints(&[7000 + number as u16 * 10 + p as u16]))
            .collect();
        VersionView::new(StoreVersion::new("users", number, partitions), replicas)
    }

    fn schemas() -> SchemaSet {
        SchemaSet::new(SchemaEntry::new(0, "\"string\""))
    }

    #[test]
    fn test_version_view_pads_partitions() {
        let v = VersionView::new(StoreVersion::new("users", 1, 4), vec![endpoints(&[1])]);
        assert_eq!(v.replicas(0).len(), 1);
        assert!(v.replicas(3).is_empty());
        assert!(v.replicas(9).is_empty());
        assert_eq!(v.resource_name(), "users_v1");
    }

    #[test]
    fn test_lookup_unknown_version() {
        let snapshot = MetadataSnapshot::new(view(1, 2), schemas());
        assert_eq!(snapshot.partition_count(1).unwrap(), 2);
        assert!(matches!(
            snapshot.partition_count(2),
            Err(Error::UnknownVersion { version: 2, .. })
        ));
    }

    #[test]
    fn test_successor_retains_previous_version() {
        let now = Instant::now();
        let first = MetadataSnapshot::new(view(1, 2), schemas());
        let second = first.successor(
            view(2, 4),
            schemas(),
            Partitioner::default(),
            Duration::from_secs(30),
            now,
        );

        assert_eq!(second.current_version().number, 2);
        assert_eq!(second.generation(), 1);
        assert_eq!(second.retained_versions(), vec![1]);
        // The retired layout is still answered for in-flight requests.
        assert_eq!(second.partition_count(1).unwrap(), 2);
        assert_eq!(second.ready_replicas(1, 0).unwrap(), endpoints(&[7010]));
        // The old snapshot itself is untouched.
        assert_eq!(first.current_version().number, 1);
    }

    #[test]
    fn test_successor_evicts_after_grace() {
        let start = Instant::now();
        let grace = Duration::from_secs(5);
        let s1 = MetadataSnapshot::new(view(1, 1), schemas());
        let s2 = s1.successor(view(2, 1), schemas(), Partitioner::default(), grace, start);
        let s3 = s2.successor(
            view(2, 1),
            schemas(),
            Partitioner::default(),
            grace,
            start + Duration::from_secs(6),
        );

        assert!(s3.retained_versions().is_empty());
        assert!(s3.partition_count(1).is_err());
    }

    #[test]
    fn test_rollback_promotes_retained_version() {
        let now = Instant::now();
        let grace = Duration::from_secs(30);
        let s1 = MetadataSnapshot::new(view(1, 1), schemas());
        let s2 = s1.successor(view(2, 1), schemas(), Partitioner::default(), grace, now);
        let s3 = s2.successor(view(1, 1), schemas(), Partitioner::default(), grace, now);

        assert_eq!(s3.current_version().number, 1);
        assert_eq!(s3.retained_versions(), vec![2]);
    }

    #[test]
    fn test_route_uses_current_version() {
        let snapshot = MetadataSnapshot::new(view(3, 8), schemas());
        let route = snapshot.route(b"key_1");
        assert!(route.partition < 8);
        assert_eq!(route.resource_name(), "users_v3");
        assert_eq!(route.replicas().len(), 1);
        assert_eq!(
            route.partition,
            Partitioner::default().partition(b"key_1", 8)
        );
    }
}
