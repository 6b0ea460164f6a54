//! Scriptable in-memory transport.

use crate::error::TransportError;
use crate::network::{ReplicaRequest, ReplicaResponse, ResponseStatus, Transport};
use crate::types::{InstanceEndpoint, PartitionId, SchemaId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// How a simulated replica answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaBehavior {
    /// Answer from the stored data. Unknown resources are not served.
    Serve,
    /// Serve after a delay.
    Delay(Duration),
    /// Never answer.
    Hang,
    /// Refuse the connection.
    Refuse,
    /// Report that the requested version is not served.
    NotServing,
    SchemaMismatch(String),
    /// Return bytes that cannot be decoded.
    Corrupt,
}

/// One request as seen by the transport.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: InstanceEndpoint,
    pub resource: String,
    pub partition: PartitionId,
    pub key: Bytes,
}

type ResourceData = HashMap<Bytes, (SchemaId, Bytes)>;

/// Transport double with per-endpoint behaviours.
///
/// Every replica shares one data set keyed by resource name. The transport
/// counts calls, concurrent calls, and calls dropped before they finished.
#[derive(Debug, Default)]
pub struct MockTransport {
    data: RwLock<HashMap<String, ResourceData>>,
    behaviors: DashMap<InstanceEndpoint, ReplicaBehavior>,
    calls: DashMap<InstanceEndpoint, usize>,
    log: Mutex<Vec<RecordedCall>>,
    total_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
    cancelled: AtomicUsize,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        resource: &str,
        key: impl Into<Bytes>,
        schema_id: SchemaId,
        value: impl Into<Bytes>,
    ) {
        self.data
            .write()
            .entry(resource.to_string())
            .or_default()
            .insert(key.into(), (schema_id, value.into()));
    }

    /// Stop serving a resource, as replicas do once a version is retired.
    pub fn remove_resource(&self, resource: &str) {
        self.data.write().remove(resource);
    }

    pub fn set_behavior(&self, endpoint: &InstanceEndpoint, behavior: ReplicaBehavior) {
        self.behaviors.insert(endpoint.clone(), behavior);
    }

    pub fn calls(&self, endpoint: &InstanceEndpoint) -> usize {
        self.calls.get(endpoint).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Calls dropped before they produced a response.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Highest number of calls outstanding at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.log.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn serve(&self, request: &ReplicaRequest) -> ReplicaResponse {
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

/// Counts a call as cancelled unless it completes.
struct CallGuard<'a> {
    transport: &'a MockTransport,
    completed: bool,
}

impl<'a> CallGuard<'a> {
    fn new(transport: &'a MockTransport) -> Self {
        let now = transport.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        transport.max_concurrent.fetch_max(now, Ordering::SeqCst);
        Self {
            transport,
            completed: false,
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.completed {
            self.transport.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(
        &self,
        endpoint: &InstanceEndpoint,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        *self.calls.entry(endpoint.clone()).or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(RecordedCall {
            endpoint: endpoint.clone(),
            resource: request.resource.clone(),
            partition: request.partition,
            key: request.key.clone(),
        });

        let mut guard = CallGuard::new(self);
        let behavior = self
            .behaviors
            .get(endpoint)
            .map(|b| b.clone())
            .unwrap_or(ReplicaBehavior::Serve);

        let response = match behavior {
            ReplicaBehavior::Serve => Ok(self.serve(&request)),
            ReplicaBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.serve(&request))
            }
            ReplicaBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Timeout)
            }
            ReplicaBehavior::Refuse => Err(TransportError::ConnectionFailed {
                addr: endpoint.to_string(),
                reason: "connection refused".into(),
            }),
            ReplicaBehavior::NotServing => Ok(ReplicaResponse::not_serving(request.request_id)),
            ReplicaBehavior::SchemaMismatch(reason) => Ok(ReplicaResponse {
                request_id: request.request_id,
                status: ResponseStatus::SchemaMismatch(reason),
            }),
            ReplicaBehavior::Corrupt => Err(TransportError::Serialization(
                "invalid frame payload".into(),
            )),
        };

        guard.completed = true;
        response
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
