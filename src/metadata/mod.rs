//! Metadata module: versioned routing metadata and schemas.
//!
//! ```text
//!  ClusterMetadataSource ─┐
//!                         ├─► refresh() ─► MetadataSnapshot ─► ArcSwap ─► readers
//!  SchemaSource ──────────┘        ▲
//!                                  │ interval tick / request_refresh()
//! ```
//!
//! Readers never block on a refresh: they load the last published snapshot
//! and keep using that `Arc` for the whole request, even if a newer snapshot
//! is published meanwhile.
//!
//! Two implementations of [`StoreMetadata`] exist:
//!
//! - [`MetadataRepository`] pulls from the sources on an interval and on
//!   demand.
//! - [`StaticStoreMetadata`] holds snapshots published by its owner, for
//!   deployments where another component already tracks the cluster.

mod repository;
mod schema;
mod snapshot;
mod source;
mod static_metadata;

pub use repository::{MetadataRepository, RefreshStats};
pub use schema::SchemaSet;
pub use snapshot::{MetadataSnapshot, Route, VersionView};
pub use source::{ClusterMetadataSource, SchemaSource};
pub use static_metadata::StaticStoreMetadata;

use crate::error::{Error, Result};
use crate::types::{InstanceEndpoint, PartitionId, SchemaEntry, SchemaId, StoreVersion, VersionNumber};
use async_trait::async_trait;
use std::sync::Arc;

/// Read access to the routing metadata of one store.
#[async_trait]
pub trait StoreMetadata: Send + Sync + 'static {
    fn store_name(&self) -> &str;

    /// The last published snapshot.
    fn snapshot(&self) -> Result<Arc<MetadataSnapshot>>;

    /// Load initial metadata and start background maintenance.
    async fn start(&self) -> Result<()>;

    /// Refresh now and return the snapshot that is published afterwards.
    async fn refresh(&self) -> Result<Arc<MetadataSnapshot>>;

    /// Ask for an early refresh without waiting for it.
    fn request_refresh(&self);

    /// Stop background maintenance.
    async fn close(&self);

    fn current_version(&self) -> Result<StoreVersion> {
        Ok(self.snapshot()?.current_version().clone())
    }

    fn partition_count(&self, version: VersionNumber) -> Result<u32> {
        self.snapshot()?.partition_count(version)
    }

    fn ready_replicas(
        &self,
        version: VersionNumber,
        partition: PartitionId,
    ) -> Result<Vec<InstanceEndpoint>> {
        self.snapshot()?.ready_replicas(version, partition)
    }

    fn key_schema(&self) -> Result<SchemaEntry> {
        Ok(self.snapshot()?.schemas().key_schema().clone())
    }

    /// Value schema by id. A miss triggers one refresh before failing.
    async fn value_schema(&self, id: SchemaId) -> Result<SchemaEntry> {
        if let Some(entry) = self.snapshot()?.schemas().value_schema(id) {
            return Ok(entry.clone());
        }
        let refreshed = self.refresh().await?;
        refreshed
            .schemas()
            .value_schema(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSchemaId {
                store: self.store_name().to_string(),
                id,
            })
    }

    fn latest_value_schema(&self) -> Result<SchemaEntry> {
        let snapshot = self.snapshot()?;
        snapshot
            .schemas()
            .latest_value_schema()
            .cloned()
            .ok_or_else(|| Error::Metadata(format!("store {} has no value schema", self.store_name())))
    }

    /// Id of a value schema given its raw text.
    fn value_schema_id(&self, raw_schema: &str) -> Result<SchemaId> {
        self.snapshot()?
            .schemas()
            .value_schema_id(raw_schema)
            .ok_or_else(|| Error::Metadata(format!("schema not registered for store {}", self.store_name())))
    }
}
