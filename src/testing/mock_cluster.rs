//! In-memory cluster metadata and schema registry.

use crate::error::{Error, Result};
use crate::metadata::{ClusterMetadataSource, SchemaSource};
use crate::partitioning::PartitionerAlgorithm;
use crate::types::{parse_resource_name, InstanceEndpoint, PartitionId, SchemaEntry, SchemaId, VersionNumber};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
struct MockStore {
    key_schema: String,
    value_schemas: BTreeMap<SchemaId, String>,
    partition_counts: HashMap<VersionNumber, u32>,
    replicas: HashMap<(VersionNumber, PartitionId), Vec<InstanceEndpoint>>,
    current: Option<VersionNumber>,
    partitioner: String,
}

/// Cluster metadata source and schema source backed by maps.
///
/// Every mutation is visible to the next call; there is no caching.
#[derive(Debug, Default)]
pub struct MockCluster {
    stores: RwLock<HashMap<String, MockStore>>,
    failing: AtomicBool,
    version_fetches: AtomicU64,
    schema_lookups: AtomicU64,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_store(&self, store: &str, key_schema: &str) {
        self.stores.write().insert(
            store.to_string(),
            MockStore {
                key_schema: key_schema.to_string(),
                value_schemas: BTreeMap::new(),
                partition_counts: HashMap::new(),
                replicas: HashMap::new(),
                current: None,
                partitioner: PartitionerAlgorithm::default().id().to_string(),
            },
        );
    }

    pub fn add_value_schema(&self, store: &str, id: SchemaId, raw_schema: &str) {
        self.with_store(store, |s| {
            s.value_schemas.insert(id, raw_schema.to_string());
        });
    }

    /// Forget a value schema, as a misbehaving registry might.
    pub fn remove_value_schema(&self, store: &str, id: SchemaId) {
        self.with_store(store, |s| {
            s.value_schemas.remove(&id);
        });
    }

    /// Register a version; its partitions start without replicas.
    pub fn add_version(&self, store: &str, version: VersionNumber, partition_count: u32) {
        self.with_store(store, |s| {
            s.partition_counts.insert(version, partition_count);
        });
    }

    pub fn set_replicas(
        &self,
        store: &str,
        version: VersionNumber,
        partition: PartitionId,
        replicas: Vec<InstanceEndpoint>,
    ) {
        self.with_store(store, |s| {
            s.replicas.insert((version, partition), replicas);
        });
    }

    /// Give every partition of `version` the same replicas.
    pub fn set_all_replicas(&self, store: &str, version: VersionNumber, replicas: Vec<InstanceEndpoint>) {
        self.with_store(store, |s| {
            let count = s.partition_counts.get(&version).copied().unwrap_or(1).max(1);
            for partition in 0..count {
                s.replicas.insert((version, partition), replicas.clone());
            }
        });
    }

    pub fn set_current_version(&self, store: &str, version: VersionNumber) {
        self.with_store(store, |s| s.current = Some(version));
    }

    pub fn set_partitioner_algorithm(&self, store: &str, id: &str) {
        self.with_store(store, |s| s.partitioner = id.to_string());
    }

    /// Make every call fail with [`Error::Metadata`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `current_version` lookups served.
    pub fn version_fetches(&self) -> u64 {
        self.version_fetches.load(Ordering::SeqCst)
    }

    /// Number of single value schema lookups served.
    pub fn schema_lookups(&self) -> u64 {
        self.schema_lookups.load(Ordering::SeqCst)
    }

    fn with_store(&self, store: &str, f: impl FnOnce(&mut MockStore)) {
        if let Some(s) = self.stores.write().get_mut(store) {
            f(s);
        }
    }

    fn read<T>(&self, store: &str, f: impl FnOnce(&MockStore) -> Result<T>) -> Result<T> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Metadata("mock cluster unavailable".into()));
        }
        let stores = self.stores.read();
        let s = stores
            .get(store)
            .ok_or_else(|| Error::Metadata(format!("unknown store {}", store)))?;
        f(s)
    }
}

#[async_trait]
impl ClusterMetadataSource for MockCluster {
    async fn current_version(&self, store: &str) -> Result<VersionNumber> {
        self.version_fetches.fetch_add(1, Ordering::SeqCst);
        self.read(store, |s| {
            s.current
                .ok_or_else(|| Error::Metadata(format!("store {} has no current version", store)))
        })
    }

    async fn ready_to_serve_instances(
        &self,
        resource: &str,
        partition: PartitionId,
    ) -> Result<Vec<InstanceEndpoint>> {
        let (store, version) = parse_resource_name(resource)
            .ok_or_else(|| Error::Metadata(format!("bad resource name {}", resource)))?;
        self.read(store, |s| {
            Ok(s.replicas.get(&(version, partition)).cloned().unwrap_or_default())
        })
    }

    async fn partition_count(&self, store: &str, version: VersionNumber) -> Result<u32> {
        self.read(store, |s| {
            s.partition_counts
                .get(&version)
                .copied()
                .ok_or_else(|| Error::Metadata(format!("unknown version {} of {}", version, store)))
        })
    }

    async fn partitioner_algorithm(&self, store: &str) -> Result<String> {
        self.read(store, |s| Ok(s.partitioner.clone()))
    }
}

#[async_trait]
impl SchemaSource for MockCluster {
    async fn key_schema(&self, store: &str) -> Result<SchemaEntry> {
        self.read(store, |s| Ok(SchemaEntry::new(1, s.key_schema.clone())))
    }

    async fn value_schema(&self, store: &str, id: SchemaId) -> Result<Option<SchemaEntry>> {
        self.schema_lookups.fetch_add(1, Ordering::SeqCst);
        self.read(store, |s| {
            Ok(s.value_schemas
                .get(&id)
                .map(|raw| SchemaEntry::new(id, raw.clone())))
        })
    }

    async fn latest_value_schema(&self, store: &str) -> Result<SchemaEntry> {
        self.read(store, |s| {
            s.value_schemas
                .iter()
                .next_back()
                .map(|(id, raw)| SchemaEntry::new(*id, raw.clone()))
                .ok_or_else(|| Error::Metadata(format!("store {} has no value schema", store)))
        })
    }
}
