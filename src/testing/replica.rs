//! Replicas served over real TCP sockets.

use crate::error::TransportError;
use crate::network::{ReplicaRequest, ReplicaResponse, ReplicaServer, RequestHandler};
use crate::types::{InstanceEndpoint, SchemaId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Request handler over an in-memory copy of some resources.
#[derive(Debug, Default)]
pub struct InMemoryReplica {
    data: RwLock<HashMap<String, HashMap<Bytes, (SchemaId, Bytes)>>>,
    latency: Duration,
    requests: AtomicU64,
}

impl InMemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before answering each request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn put(&self, resource: &str, key: impl Into<Bytes>, schema_id: SchemaId, value: impl Into<Bytes>) {
        self.data
            .write()
            .entry(resource.to_string())
            .or_default()
            .insert(key.into(), (schema_id, value.into()));
    }

    /// Stop serving `resource`.
    pub fn drop_resource(&self, resource: &str) {
        self.data.write().remove(resource);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for InMemoryReplica {
    async fn handle(&self, request: ReplicaRequest) -> ReplicaResponse {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let data = self.data.read();
        match data.get(&request.resource) {
            None => ReplicaResponse::not_serving(request.request_id),
            Some(entries) => match entries.get(&request.key) {
                Some((schema_id, value)) => {
                    ReplicaResponse::found(request.request_id, *schema_id, value.clone())
                }
                None => ReplicaResponse::not_found(request.request_id),
            },
        }
    }
}

/// A running [`ReplicaServer`] on a loopback port.
pub struct ReplicaNode {
    endpoint: InstanceEndpoint,
    replica: Arc<InMemoryReplica>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<Result<(), TransportError>>>,
}

impl ReplicaNode {
    /// Serve `replica` on an OS-assigned port.
    pub async fn spawn(replica: Arc<InMemoryReplica>) -> Result<Self, TransportError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let (server, shutdown_tx) = ReplicaServer::bind(addr, replica.clone()).await?;
        let local = server.local_addr();
        let task = tokio::spawn(server.run());

        Ok(Self {
            endpoint: InstanceEndpoint::new(local.ip().to_string(), local.port()),
            replica,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn endpoint(&self) -> &InstanceEndpoint {
        &self.endpoint
    }

    pub fn replica(&self) -> &Arc<InMemoryReplica> {
        &self.replica
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Stop listening and drop every open connection.
    pub async fn kill(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(endpoint = %self.endpoint, "Replica node killed");
    }
}

impl Drop for ReplicaNode {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
