//! Read APIs of the external metadata collaborators.
//!
//! Implementations are expected to map their own failures to
//! [`Error::Metadata`](crate::Error::Metadata).

use crate::error::Result;
use crate::partitioning::PartitionerAlgorithm;
use crate::types::{InstanceEndpoint, PartitionId, SchemaEntry, SchemaId, VersionNumber};
use async_trait::async_trait;

/// Cluster view of store versions and replica readiness.
#[async_trait]
pub trait ClusterMetadataSource: Send + Sync + 'static {
    /// Version currently designated for serving reads.
    async fn current_version(&self, store: &str) -> Result<VersionNumber>;

    /// Instances ready to serve `partition` of `resource` (`store_vN`).
    async fn ready_to_serve_instances(
        &self,
        resource: &str,
        partition: PartitionId,
    ) -> Result<Vec<InstanceEndpoint>>;

    /// Partition count of a store version.
    async fn partition_count(&self, store: &str, version: VersionNumber) -> Result<u32>;

    /// Identifier of the store's partitioning algorithm.
    async fn partitioner_algorithm(&self, _store: &str) -> Result<String> {
        Ok(PartitionerAlgorithm::default().id().to_string())
    }
}

/// Schema registry read API.
#[async_trait]
pub trait SchemaSource: Send + Sync + 'static {
    async fn key_schema(&self, store: &str) -> Result<SchemaEntry>;

    async fn value_schema(&self, store: &str, id: SchemaId) -> Result<Option<SchemaEntry>>;

    async fn latest_value_schema(&self, store: &str) -> Result<SchemaEntry>;

    /// All value schemas known for the store.
    ///
    /// The default walks ids downwards from the latest one, which suits
    /// registries that hand out dense ids starting at 1.
    async fn value_schemas(&self, store: &str) -> Result<Vec<SchemaEntry>> {
        let latest = self.latest_value_schema(store).await?;
        let mut entries = Vec::with_capacity(latest.id.max(0) as usize);
        for id in 1..latest.id {
            if let Some(entry) = self.value_schema(store, id).await? {
                entries.push(entry);
            }
        }
        entries.push(latest);
        Ok(entries)
    }
}
