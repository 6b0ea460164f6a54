//! Client facade: the public entry point for reads.
//!
//! ```text
//!   get(key)
//!     │
//!     ├─► metadata.snapshot()            one Arc for the whole request
//!     ├─► snapshot.route(key)            version, partition, ready replicas
//!     ├─► coordinator.execute_until()    hedged attempts under the deadline
//!     │        │
//!     │        └─ StaleMetadata ─► refresh ─► retry once on the newer version
//!     ├─► schema id check                unknown id triggers one refresh
//!     └─► dual_read.complete()           comparison happens off this path
//! ```
//!
//! A client is cheap to clone; clones share metadata, connections and
//! metrics. `close()` on any clone closes all of them.

mod batch;
mod builder;

pub use batch::BatchGetResponse;
pub use builder::StoreClientBuilder;

use crate::config::ClientConfig;
use crate::dual_read::{DualReadValidator, SecondaryClient};
use crate::error::{Error, Result};
use crate::execution::{ExecutionCoordinator, ReadRequest};
use crate::metadata::{MetadataSnapshot, StoreMetadata};
use crate::metrics::ClientMetrics;
use crate::types::{SchemaId, VersionedValue};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Created,
    Started,
    Closed,
}

/// Reads keys of one store from its replicas.
///
/// # Example
///
/// ```rust,no_run
/// use kvrouter::{ClientConfig, StoreClient};
/// # use kvrouter::metadata::{ClusterMetadataSource, SchemaSource};
/// # use std::sync::Arc;
/// # async fn run(
/// #     cluster: Arc<dyn ClusterMetadataSource>,
/// #     schemas: Arc<dyn SchemaSource>,
/// # ) -> kvrouter::Result<()> {
/// let client = StoreClient::builder(ClientConfig::new("users"))
///     .with_sources(cluster, schemas)
///     .build()?;
/// client.start().await?;
///
/// if let Some(value) = client.get("user:123").await? {
///     println!("found {} bytes", value.len());
/// }
///
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    metadata: Arc<dyn StoreMetadata>,
    coordinator: ExecutionCoordinator,
    dual_read: Option<DualReadValidator>,
    metrics: Arc<ClientMetrics>,
    shutdown: CancellationToken,
    state: Mutex<ClientState>,
}

impl StoreClient {
    pub fn builder(config: ClientConfig) -> StoreClientBuilder {
        StoreClientBuilder::new(config)
    }

    pub(crate) fn from_parts(
        config: ClientConfig,
        metadata: Arc<dyn StoreMetadata>,
        coordinator: ExecutionCoordinator,
        dual_read: Option<DualReadValidator>,
        metrics: Arc<ClientMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                metadata,
                coordinator,
                dual_read,
                metrics,
                shutdown,
                state: Mutex::new(ClientState::Created),
            }),
        }
    }

    /// Load metadata and start the refresh loop.
    ///
    /// The initial metadata load must succeed. On failure every resource the
    /// client holds is released and the client stays closed.
    pub async fn start(&self) -> Result<()> {
        match *self.inner.state.lock() {
            ClientState::Started => return Ok(()),
            ClientState::Closed => return Err(Error::Closed),
            ClientState::Created => {}
        }

        info!(store = %self.inner.config.store_name, "Starting store client");
        if let Err(e) = self.inner.metadata.start().await {
            warn!(
                store = %self.inner.config.store_name,
                error = %e,
                "Store client failed to start"
            );
            self.inner.release().await;
            return Err(e);
        }

        let promoted = {
            let mut state = self.inner.state.lock();
            if *state == ClientState::Closed {
                false
            } else {
                *state = ClientState::Started;
                true
            }
        };
        if promoted {
            if let Ok(version) = self.inner.metadata.current_version() {
                self.inner.metrics.current_version.set(version.number as i64);
                info!(
                    store = %self.inner.config.store_name,
                    version = version.number,
                    partitions = version.partition_count,
                    "Store client started"
                );
            }
            return Ok(());
        }

        // Closed while the initial load was running.
        self.inner.release().await;
        Err(Error::Closed)
    }

    /// Stop the refresh loop, cancel outstanding reads and secondary reads,
    /// and drop pooled connections. Calling it again does nothing.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ClientState::Closed {
                return;
            }
            *state = ClientState::Closed;
        }
        info!(store = %self.inner.config.store_name, "Closing store client");
        self.inner.release().await;
    }

    pub fn is_started(&self) -> bool {
        *self.inner.state.lock() == ClientState::Started
    }

    /// Read `key`. `Ok(None)` means the key does not exist.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        Ok(self.get_with_schema(key).await?.map(|v| v.value))
    }

    /// Read `key` together with the id of the schema it was written with.
    pub async fn get_with_schema(&self, key: impl Into<Bytes>) -> Result<Option<VersionedValue>> {
        self.inner.ensure_started()?;
        let snapshot = self.inner.metadata.snapshot()?;
        let started = Instant::now();
        let deadline = started + self.inner.config.request_timeout;
        self.inner.get_one(snapshot, key.into(), started, deadline).await
    }

    /// Run [`get`](Self::get) on a spawned task.
    ///
    /// Dropping the handle does not stop the read; [`GetHandle::abort`] does.
    pub fn spawn_get(&self, key: impl Into<Bytes>) -> GetHandle {
        let client = self.clone();
        let key = key.into();
        GetHandle {
            task: tokio::spawn(async move { client.get(key).await }),
        }
    }

    /// Read many keys against one metadata snapshot.
    ///
    /// Keys are looked up concurrently under one shared deadline. A failed
    /// key does not fail the batch; its error is kept in the response.
    /// Duplicate keys are looked up once.
    pub async fn batch_get<I, K>(&self, keys: I) -> Result<BatchGetResponse>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.inner.ensure_started()?;

        let mut seen = HashSet::new();
        let keys: Vec<Bytes> = keys
            .into_iter()
            .map(Into::into)
            .filter(|key: &Bytes| seen.insert(key.clone()))
            .collect();
        self.inner.metrics.record_batch(keys.len());
        if keys.is_empty() {
            return Ok(BatchGetResponse::default());
        }

        let snapshot = self.inner.metadata.snapshot()?;
        let started = Instant::now();
        let deadline = started + self.inner.config.request_timeout;
        let groups = snapshot
            .partitioner()
            .group_by_partition(&keys, snapshot.current().partition_count());
        debug!(
            store = %self.inner.config.store_name,
            version = snapshot.current_version().number,
            keys = keys.len(),
            partitions = groups.len(),
            "Dispatching batch get"
        );

        let mut lookups = JoinSet::new();
        for (partition, indices) in groups {
            trace!(partition, keys = indices.len(), "Batch partition group");
            for idx in indices {
                let inner = self.inner.clone();
                let snapshot = snapshot.clone();
                let key = keys[idx].clone();
                lookups.spawn(async move {
                    let result = inner.get_one(snapshot, key.clone(), started, deadline).await;
                    (key, result)
                });
            }
        }

        let mut results = HashMap::with_capacity(keys.len());
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((key, result)) => {
                    results.insert(key, result);
                }
                Err(e) => warn!(error = %e, "Batch lookup task failed"),
            }
        }
        for key in keys {
            results
                .entry(key)
                .or_insert_with(|| Err(Error::Internal("batch lookup task failed".to_string())));
        }

        Ok(BatchGetResponse::new(results))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Metrics of this client only.
    pub fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    pub fn metadata(&self) -> &Arc<dyn StoreMetadata> {
        &self.inner.metadata
    }

    pub(crate) fn coordinator(&self) -> &ExecutionCoordinator {
        &self.inner.coordinator
    }

    /// Secondary reads that have not been compared yet.
    pub fn dual_reads_in_flight(&self) -> usize {
        self.inner.dual_read.as_ref().map_or(0, |d| d.in_flight())
    }
}

/// A client can serve as the secondary path of another client, e.g. one
/// reading the same store through a different transport.
#[async_trait]
impl SecondaryClient for StoreClient {
    async fn get(&self, key: Bytes) -> Result<Option<Bytes>> {
        StoreClient::get(self, key).await
    }
}

impl ClientInner {
    fn ensure_started(&self) -> Result<()> {
        match *self.state.lock() {
            ClientState::Started => Ok(()),
            ClientState::Created => Err(Error::NotStarted),
            ClientState::Closed => Err(Error::Closed),
        }
    }

    async fn release(&self) {
        *self.state.lock() = ClientState::Closed;
        self.shutdown.cancel();
        if let Some(dual_read) = &self.dual_read {
            dual_read.close().await;
        }
        self.metadata.close().await;
        self.coordinator.transport().close().await;
        debug!(store = %self.config.store_name, "Store client resources released");
    }

    /// One logical read, with metrics and the optional secondary path.
    async fn get_one(
        &self,
        snapshot: Arc<MetadataSnapshot>,
        key: Bytes,
        started: Instant,
        deadline: Instant,
    ) -> Result<Option<VersionedValue>> {
        let _in_flight = self.metrics.in_flight.track();
        let dual_read = self.dual_read.as_ref().map(|d| d.start(key.clone()));
        let cancel = self.shutdown.child_token();

        let result = self.read(snapshot, key, started, deadline, &cancel).await;
        if matches!(
            result,
            Err(Error::NoAvailableReplica { .. }) | Err(Error::UnknownVersion { .. })
        ) {
            // Replica sets may have changed since the snapshot was taken.
            self.metadata.request_refresh();
        }

        if let Some(handle) = dual_read {
            handle.complete(&result);
        }
        self.metrics
            .record_get(result.as_ref().map(|v| v.is_some()), started.elapsed());
        result
    }

    async fn read(
        &self,
        snapshot: Arc<MetadataSnapshot>,
        key: Bytes,
        started: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<VersionedValue>> {
        let (snapshot, value) = match self.read_on(&snapshot, key.clone(), deadline, cancel).await {
            Ok(value) => (snapshot, value),
            Err(Error::StaleMetadata { resource }) => {
                self.metrics.stale_metadata_retries.inc();
                debug!(
                    store = %self.config.store_name,
                    resource = %resource,
                    "Replicas no longer serve the cached version, refreshing"
                );
                let fresh = self.fresher_snapshot(&snapshot, started, deadline, cancel).await?;
                match self.read_on(&fresh, key, deadline, cancel).await {
                    Ok(value) => (fresh, value),
                    Err(Error::StaleMetadata { .. }) => return Err(unknown_version(&fresh)),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        self.metrics
            .current_version
            .set(snapshot.current_version().number as i64);
        if let Some(value) = &value {
            self.check_schema(&snapshot, value.schema_id, started, deadline)
                .await?;
        }
        Ok(value)
    }

    async fn read_on(
        &self,
        snapshot: &MetadataSnapshot,
        key: Bytes,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<VersionedValue>> {
        let route = snapshot.route(&key);
        let request = ReadRequest {
            resource: route.resource_name().to_string(),
            partition: route.partition,
            key,
            replicas: route.replicas().to_vec(),
        };
        self.coordinator
            .execute_until(request, deadline, cancel)
            .await
    }

    /// A snapshot with a different current version than `stale`, refreshing
    /// if nothing newer has been published yet.
    async fn fresher_snapshot(
        &self,
        stale: &MetadataSnapshot,
        started: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Arc<MetadataSnapshot>> {
        let stale_version = stale.current_version().number;
        let published = self.metadata.snapshot()?;
        let fresh = if published.current_version().number != stale_version {
            published
        } else {
            let refreshed = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                refreshed = tokio::time::timeout_at(deadline, self.metadata.refresh()) => refreshed,
            };
            match refreshed {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(e)) => {
                    warn!(
                        store = %self.config.store_name,
                        error = %e,
                        "On-demand metadata refresh failed"
                    );
                    return Err(unknown_version(stale));
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        elapsed: started.elapsed(),
                    })
                }
            }
        };

        if fresh.current_version().number == stale_version {
            return Err(unknown_version(stale));
        }
        Ok(fresh)
    }

    /// Make sure the schema a value was written with is known.
    async fn check_schema(
        &self,
        snapshot: &MetadataSnapshot,
        schema_id: SchemaId,
        started: Instant,
        deadline: Instant,
    ) -> Result<()> {
        if snapshot.schemas().value_schema(schema_id).is_some() {
            return Ok(());
        }
        debug!(
            store = %self.config.store_name,
            schema_id,
            "Value written with a schema missing from the snapshot"
        );
        match tokio::time::timeout_at(deadline, self.metadata.value_schema(schema_id)).await {
            Ok(entry) => entry.map(|_| ()),
            Err(_) => Err(Error::Timeout {
                elapsed: started.elapsed(),
            }),
        }
    }
}

fn unknown_version(snapshot: &MetadataSnapshot) -> Error {
    Error::UnknownVersion {
        store: snapshot.store_name().to_string(),
        version: snapshot.current_version().number,
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if *self.state.get_mut() == ClientState::Closed {
            return;
        }
        self.shutdown.cancel();
        let metadata = self.metadata.clone();
        let transport = self.coordinator.transport().clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                metadata.close().await;
                transport.close().await;
            });
        }
    }
}

/// A read running on its own task.
#[derive(Debug)]
pub struct GetHandle {
    task: JoinHandle<Result<Option<Bytes>>>,
}

impl GetHandle {
    /// Cancel the read and every attempt it has in flight.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for GetHandle {
    type Output = Result<Option<Bytes>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Internal(format!("get task failed: {}", e))),
        })
    }
}
