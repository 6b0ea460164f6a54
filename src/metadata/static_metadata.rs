//! Metadata published by the owner instead of pulled from sources.

use super::schema::SchemaSet;
use super::snapshot::{MetadataSnapshot, VersionView};
use super::StoreMetadata;
use crate::error::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Store metadata whose snapshots are pushed in by another component.
///
/// `start()` and `close()` do nothing; `refresh()` returns the latest
/// published snapshot.
pub struct StaticStoreMetadata {
    store_name: String,
    current: ArcSwap<MetadataSnapshot>,
    retired_version_grace: Duration,
}

impl StaticStoreMetadata {
    pub fn new(initial: MetadataSnapshot) -> Self {
        Self {
            store_name: initial.store_name().to_string(),
            current: ArcSwap::from_pointee(initial),
            retired_version_grace: Duration::from_secs(30),
        }
    }

    pub fn with_retired_version_grace(mut self, grace: Duration) -> Self {
        self.retired_version_grace = grace;
        self
    }

    /// Replace the snapshot wholesale.
    pub fn publish(&self, snapshot: MetadataSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Make `view` the current version, retaining the outgoing one for the
    /// grace period. Schemas are merged append-only.
    pub fn promote(&self, view: VersionView, schemas: Option<SchemaSet>) {
        let previous = self.current.load_full();
        let merged = match schemas {
            Some(incoming) => previous.schemas().merged(incoming.value_schemas().cloned()),
            None => previous.schemas().clone(),
        };
        let from = previous.current_version().number;
        let to = view.number();
        let next = previous.successor(
            view,
            merged,
            previous.partitioner(),
            self.retired_version_grace,
            Instant::now(),
        );
        self.current.store(Arc::new(next));
        if from != to {
            info!(store = %self.store_name, from, to, "Published new current version");
        }
    }
}

#[async_trait]
impl StoreMetadata for StaticStoreMetadata {
    fn store_name(&self) -> &str {
        &self.store_name
    }

    fn snapshot(&self) -> Result<Arc<MetadataSnapshot>> {
        Ok(self.current.load_full())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn refresh(&self) -> Result<Arc<MetadataSnapshot>> {
        Ok(self.current.load_full())
    }

    fn request_refresh(&self) {}

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{InstanceEndpoint, SchemaEntry, StoreVersion};

    fn view(number: u32) -> VersionView {
        VersionView::new(
            StoreVersion::new("users", number, 1),
            vec![vec![InstanceEndpoint::new("127.0.0.1", 7000 + number as u16)]],
        )
    }

    fn schemas() -> SchemaSet {
        SchemaSet::new(SchemaEntry::new(0, "\"string\""))
            .with_value_schema(SchemaEntry::new(1, "\"int\""))
    }

    #[tokio::test]
    async fn test_start_is_noop() {
        let metadata = StaticStoreMetadata::new(MetadataSnapshot::new(view(1), schemas()));
        metadata.start().await.unwrap();
        assert_eq!(metadata.current_version().unwrap().number, 1);
        assert_eq!(metadata.refresh().await.unwrap().current_version().number, 1);
        metadata.close().await;
    }

    #[tokio::test]
    async fn test_promote_retains_previous() {
        let metadata = StaticStoreMetadata::new(MetadataSnapshot::new(view(1), schemas()));
        let new_schemas = schemas().with_value_schema(SchemaEntry::new(2, "\"long\""));
        metadata.promote(view(2), Some(new_schemas));

        assert_eq!(metadata.current_version().unwrap().number, 2);
        assert_eq!(metadata.ready_replicas(1, 0).unwrap()[0].port, 7001);
        assert_eq!(metadata.value_schema(2).await.unwrap().raw_schema, "\"long\"");
        assert!(matches!(
            metadata.value_schema(3).await,
            Err(Error::UnknownSchemaId { id: 3, .. })
        ));
    }
}
