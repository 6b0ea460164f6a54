//! Source-backed metadata repository with background refresh.

use super::schema::SchemaSet;
use super::snapshot::{MetadataSnapshot, VersionView};
use super::source::{ClusterMetadataSource, SchemaSource};
use super::StoreMetadata;
use crate::config::MetadataConfig;
use crate::error::{Error, Result};
use crate::partitioning::{Partitioner, PartitionerAlgorithm};
use crate::types::{compose_resource_name, SchemaEntry, SchemaId, StoreVersion};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters of the refresh path.
#[derive(Debug, Default)]
pub struct RefreshStats {
    refreshes: AtomicU64,
    failures: AtomicU64,
    version_swaps: AtomicU64,
}

impl RefreshStats {
    /// Successful refreshes.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Refreshes that failed and left the previous snapshot in place.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Refreshes that changed the current version.
    pub fn version_swaps(&self) -> u64 {
        self.version_swaps.load(Ordering::Relaxed)
    }
}

/// Caches store metadata pulled from a cluster source and a schema source.
///
/// Cloning is cheap; clones share the cache and the refresh loop.
#[derive(Clone)]
pub struct MetadataRepository {
    inner: Arc<RepositoryInner>,
}

struct RepositoryInner {
    store_name: String,
    cluster: Arc<dyn ClusterMetadataSource>,
    schemas: Arc<dyn SchemaSource>,
    config: MetadataConfig,

    current: ArcSwapOption<MetadataSnapshot>,

    /// Serialises refreshes. Readers never take it.
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_notify: Notify,
    last_on_demand: Mutex<Option<Instant>>,
    /// Schema ids the registry did not know, and when it was last asked.
    missing_schemas: Mutex<HashMap<SchemaId, Instant>>,

    shutdown: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    stats: RefreshStats,
}

impl MetadataRepository {
    pub fn new(
        store_name: impl Into<String>,
        cluster: Arc<dyn ClusterMetadataSource>,
        schemas: Arc<dyn SchemaSource>,
        config: MetadataConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RepositoryInner {
                store_name: store_name.into(),
                cluster,
                schemas,
                config,
                current: ArcSwapOption::empty(),
                refresh_lock: tokio::sync::Mutex::new(()),
                refresh_notify: Notify::new(),
                last_on_demand: Mutex::new(None),
                missing_schemas: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                refresh_task: Mutex::new(None),
                stats: RefreshStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &RefreshStats {
        &self.inner.stats
    }

    /// Whether the background refresh loop is running.
    pub fn is_running(&self) -> bool {
        self.inner
            .refresh_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl RepositoryInner {
    async fn refresh(&self) -> Result<Arc<MetadataSnapshot>> {
        let _guard = self.refresh_lock.lock().await;
        match self.build_snapshot().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                let previous = self.current.swap(Some(snapshot.clone()));
                self.stats.refreshes.fetch_add(1, Ordering::Relaxed);

                let new_version = snapshot.current_version().number;
                match previous.map(|p| p.current_version().number) {
                    Some(old) if old != new_version => {
                        self.stats.version_swaps.fetch_add(1, Ordering::Relaxed);
                        info!(
                            store = %self.store_name,
                            from = old,
                            to = new_version,
                            "Current store version changed"
                        );
                    }
                    None => {
                        info!(store = %self.store_name, version = new_version, "Initial metadata loaded");
                    }
                    _ => {}
                }
                debug!(
                    store = %self.store_name,
                    version = new_version,
                    generation = snapshot.generation(),
                    "Metadata snapshot published"
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Look up one value schema in the registry and publish it.
    ///
    /// Ids the registry did not know are not asked for again until
    /// `min_on_demand_interval` has passed.
    async fn fetch_value_schema(&self, id: SchemaId) -> Result<SchemaEntry> {
        let unknown = || Error::UnknownSchemaId {
            store: self.store_name.clone(),
            id,
        };
        let interval = self.config.min_on_demand_interval;
        if let Some(asked) = self.missing_schemas.lock().get(&id) {
            if asked.elapsed() < interval {
                return Err(unknown());
            }
        }

        let entry = match self.schemas.value_schema(&self.store_name, id).await? {
            Some(entry) => entry,
            None => {
                let mut missing = self.missing_schemas.lock();
                missing.retain(|_, asked| asked.elapsed() < interval);
                missing.insert(id, Instant::now());
                debug!(store = %self.store_name, schema_id = id, "Value schema not registered");
                return Err(unknown());
            }
        };
        self.missing_schemas.lock().remove(&id);

        let _guard = self.refresh_lock.lock().await;
        let current = self.current.load_full().ok_or(Error::NotStarted)?;
        if let Some(known) = current.schemas().value_schema(id) {
            return Ok(known.clone());
        }
        let next = Arc::new(current.with_schemas(current.schemas().merged([entry.clone()])));
        self.current.store(Some(next.clone()));
        debug!(
            store = %self.store_name,
            schema_id = id,
            generation = next.generation(),
            "Value schema added to snapshot"
        );
        Ok(entry)
    }

    async fn build_snapshot(&self) -> Result<MetadataSnapshot> {
        let store = self.store_name.as_str();
        let number = self.cluster.current_version(store).await?;
        let partition_count = self.cluster.partition_count(store, number).await?;
        let algorithm_id = self.cluster.partitioner_algorithm(store).await?;
        let partitioner = Partitioner::new(PartitionerAlgorithm::from_id(&algorithm_id)?);

        let resource = compose_resource_name(store, number);
        let mut replicas = Vec::with_capacity(partition_count.max(1) as usize);
        for partition in 0..partition_count.max(1) {
            replicas.push(
                self.cluster
                    .ready_to_serve_instances(&resource, partition)
                    .await?,
            );
        }

        let key_schema = self.schemas.key_schema(store).await?;
        let value_schemas = self.schemas.value_schemas(store).await?;

        let previous = self.current.load_full();
        let schema_set = match previous.as_deref() {
            Some(prev) => prev.schemas().merged(value_schemas),
            None => SchemaSet::new(key_schema).merged(value_schemas),
        };

        let mut version = StoreVersion::new(store, number, partition_count);
        version.schema_set_version = schema_set.version();
        let view = VersionView::new(version, replicas);

        Ok(match previous.as_deref() {
            Some(prev) => prev.successor(
                view,
                schema_set,
                partitioner,
                self.config.retired_version_grace,
                Instant::now(),
            ),
            None => MetadataSnapshot::new(view, schema_set).with_partitioner(partitioner),
        })
    }
}

async fn run_refresh_loop(inner: Arc<RepositoryInner>) {
    let mut ticker = tokio::time::interval(inner.config.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; start() already refreshed.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = inner.refresh_notify.notified() => {
                debug!(store = %inner.store_name, "On-demand metadata refresh");
            }
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = inner.refresh() => {
                if let Err(e) = result {
                    warn!(
                        store = %inner.store_name,
                        error = %e,
                        "Metadata refresh failed, keeping previous snapshot"
                    );
                }
            }
        }
    }

    debug!(store = %inner.store_name, "Metadata refresh loop stopped");
}

#[async_trait]
impl StoreMetadata for MetadataRepository {
    fn store_name(&self) -> &str {
        &self.inner.store_name
    }

    fn snapshot(&self) -> Result<Arc<MetadataSnapshot>> {
        self.inner.current.load_full().ok_or(Error::NotStarted)
    }

    async fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        if self.inner.refresh_task.lock().is_some() {
            return Ok(());
        }

        self.inner.refresh().await?;

        let handle = tokio::spawn(run_refresh_loop(self.inner.clone()));
        let mut slot = self.inner.refresh_task.lock();
        if slot.is_some() {
            // Lost a race with a concurrent start().
            handle.abort();
        } else {
            *slot = Some(handle);
            info!(
                store = %self.inner.store_name,
                interval = ?self.inner.config.refresh_interval,
                "Metadata refresh loop started"
            );
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<Arc<MetadataSnapshot>> {
        self.inner.refresh().await
    }

    async fn value_schema(&self, id: SchemaId) -> Result<SchemaEntry> {
        if let Some(entry) = self.snapshot()?.schemas().value_schema(id) {
            return Ok(entry.clone());
        }
        self.inner.fetch_value_schema(id).await
    }

    fn request_refresh(&self) {
        let now = Instant::now();
        {
            let mut last = self.inner.last_on_demand.lock();
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.inner.config.min_on_demand_interval {
                    return;
                }
            }
            *last = Some(now);
        }
        self.inner.refresh_notify.notify_one();
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.refresh_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!(store = %self.inner.store_name, "Metadata repository closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for_result, MockCluster};
    use crate::types::InstanceEndpoint;
    use std::time::Duration;

    fn cluster() -> Arc<MockCluster> {
        let cluster = Arc::new(MockCluster::new());
        cluster.create_store("users", "\"string\"");
        cluster.add_value_schema("users", 1, "\"int\"");
        cluster.add_version("users", 1, 2);
        cluster.set_replicas("users", 1, 0, vec![InstanceEndpoint::new("10.0.0.1", 7000)]);
        cluster.set_replicas("users", 1, 1, vec![InstanceEndpoint::new("10.0.0.2", 7000)]);
        cluster.set_current_version("users", 1);
        cluster
    }

    fn repository(cluster: &Arc<MockCluster>, config: MetadataConfig) -> MetadataRepository {
        MetadataRepository::new("users", cluster.clone(), cluster.clone(), config)
    }

    #[tokio::test]
    async fn test_snapshot_before_start() {
        let cluster = cluster();
        let repo = repository(&cluster, MetadataConfig::default());
        assert!(matches!(repo.snapshot(), Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_loads_snapshot() {
        let cluster = cluster();
        let repo = repository(&cluster, MetadataConfig::default());
        repo.start().await.unwrap();

        let version = repo.current_version().unwrap();
        assert_eq!(version.number, 1);
        assert_eq!(version.partition_count, 2);
        assert_eq!(repo.ready_replicas(1, 1).unwrap()[0].host, "10.0.0.2");
        assert_eq!(repo.key_schema().unwrap().raw_schema, "\"string\"");
        assert_eq!(repo.latest_value_schema().unwrap().id, 1);
        assert_eq!(repo.value_schema_id("\"int\"").unwrap(), 1);
        assert!(repo.is_running());

        repo.close().await;
        assert!(!repo.is_running());
    }

    #[tokio::test]
    async fn test_refresh_swaps_version_and_retains_old() {
        let cluster = cluster();
        let repo = repository(&cluster, MetadataConfig::default());
        repo.start().await.unwrap();
        let before = repo.snapshot().unwrap();

        cluster.add_version("users", 2, 4);
        cluster.set_current_version("users", 2);
        repo.refresh().await.unwrap();

        assert_eq!(repo.current_version().unwrap().number, 2);
        assert_eq!(repo.partition_count(2).unwrap(), 4);
        // Retired version still resolvable within the grace period.
        assert_eq!(repo.partition_count(1).unwrap(), 2);
        // A snapshot taken earlier is unaffected.
        assert_eq!(before.current_version().number, 1);
        assert_eq!(repo.stats().version_swaps(), 1);

        repo.close().await;
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let cluster = cluster();
        let repo = repository(&cluster, MetadataConfig::default());
        repo.start().await.unwrap();

        cluster.set_failing(true);
        assert!(matches!(repo.refresh().await, Err(Error::Metadata(_))));
        assert_eq!(repo.current_version().unwrap().number, 1);
        assert_eq!(repo.stats().failures(), 1);

        repo.close().await;
    }

    #[tokio::test]
    async fn test_start_fails_without_metadata() {
        let cluster = cluster();
        cluster.set_failing(true);
        let repo = repository(&cluster, MetadataConfig::default());

        assert!(repo.start().await.is_err());
        assert!(!repo.is_running());
        assert!(matches!(repo.snapshot(), Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_value_schema_on_demand_refresh() {
        let cluster = cluster();
        let repo = repository(&cluster, MetadataConfig::default());
        repo.start().await.unwrap();

        cluster.add_value_schema("users", 2, "\"long\"");
        let entry = repo.value_schema(2).await.unwrap();
        assert_eq!(entry.raw_schema, "\"long\"");

        assert!(matches!(
            repo.value_schema(9).await,
            Err(Error::UnknownSchemaId { id: 9, .. })
        ));

        repo.close().await;
    }

    #[tokio::test]
    async fn test_unknown_schema_id_does_not_refresh() {
        let cluster = cluster();
        let config = MetadataConfig::default().with_min_on_demand_interval(Duration::from_secs(60));
        let repo = repository(&cluster, config);
        repo.start().await.unwrap();
        let generation = repo.snapshot().unwrap().generation();
        let version_fetches = cluster.version_fetches();
        let lookups = cluster.schema_lookups();

        for _ in 0..20 {
            assert!(matches!(
                repo.value_schema(9).await,
                Err(Error::UnknownSchemaId { id: 9, .. })
            ));
        }
        // One registry lookup for the id, no full refresh.
        assert_eq!(cluster.schema_lookups(), lookups + 1);
        assert_eq!(cluster.version_fetches(), version_fetches);
        assert_eq!(repo.stats().refreshes(), 1);
        assert_eq!(repo.snapshot().unwrap().generation(), generation);

        repo.close().await;
    }

    #[tokio::test]
    async fn test_found_schema_published_without_refresh() {
        let cluster = cluster();
        let config = MetadataConfig::default().with_min_on_demand_interval(Duration::ZERO);
        let repo = repository(&cluster, config);
        repo.start().await.unwrap();
        let before = repo.snapshot().unwrap();

        assert!(repo.value_schema(3).await.is_err());
        cluster.add_value_schema("users", 3, "\"bytes\"");
        // The miss is not remembered past the interval.
        assert_eq!(repo.value_schema(3).await.unwrap().raw_schema, "\"bytes\"");

        let after = repo.snapshot().unwrap();
        assert_eq!(after.generation(), before.generation() + 1);
        assert_eq!(after.current_version().number, 1);
        assert!(after.schemas().value_schema(1).is_some());
        assert!(before.schemas().value_schema(3).is_none());

        // Now served from the snapshot.
        let lookups = cluster.schema_lookups();
        repo.value_schema(3).await.unwrap();
        assert_eq!(cluster.schema_lookups(), lookups);
        assert_eq!(repo.stats().refreshes(), 1);

        repo.close().await;
    }

    #[tokio::test]
    async fn test_schemas_are_append_only() {
        let cluster = cluster();
        let repo = repository(&cluster, MetadataConfig::default());
        repo.start().await.unwrap();

        cluster.remove_value_schema("users", 1);
        cluster.add_value_schema("users", 2, "\"long\"");
        repo.refresh().await.unwrap();

        assert!(repo.value_schema(1).await.is_ok());
        assert_eq!(repo.latest_value_schema().unwrap().id, 2);

        repo.close().await;
    }

    #[tokio::test]
    async fn test_unknown_partitioner_rejected() {
        let cluster = cluster();
        cluster.set_partitioner_algorithm("users", "crc32-v9");
        let repo = repository(&cluster, MetadataConfig::default());
        assert!(matches!(repo.start().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_background_refresh_picks_up_new_version() {
        let cluster = cluster();
        let config = MetadataConfig::default().with_refresh_interval(Duration::from_millis(20));
        let repo = repository(&cluster, config);
        repo.start().await.unwrap();

        cluster.add_version("users", 2, 2);
        cluster.set_current_version("users", 2);

        let repo_ref = &repo;
        let version = wait_for_result(
            || async move { repo_ref.current_version().map(|v| v.number).unwrap_or(0) },
            |v| *v == 2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(version, Some(2));

        repo.close().await;
    }

    #[tokio::test]
    async fn test_request_refresh_wakes_loop() {
        let cluster = cluster();
        let config = MetadataConfig::default()
            .with_refresh_interval(Duration::from_secs(3600))
            .with_min_on_demand_interval(Duration::ZERO);
        let repo = repository(&cluster, config);
        repo.start().await.unwrap();

        cluster.add_version("users", 5, 1);
        cluster.set_current_version("users", 5);
        repo.request_refresh();

        let repo_ref = &repo;
        let version = wait_for_result(
            || async move { repo_ref.current_version().map(|v| v.number).unwrap_or(0) },
            |v| *v == 5,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(version, Some(5));

        repo.close().await;
    }

    #[tokio::test]
    async fn test_start_after_close() {
        let cluster = cluster();
        let repo = repository(&cluster, MetadataConfig::default());
        repo.start().await.unwrap();
        repo.close().await;
        repo.close().await;

        assert!(matches!(repo.start().await, Err(Error::Closed)));
    }
}
