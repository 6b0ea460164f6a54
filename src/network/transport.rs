//! Client side of the replica protocol.
//!
//! ```text
//!  attempt ──► TcpTransport::get ──► pool[endpoint] ──(idle?)──► stream
//!                                         │ no
//!                                         ▼
//!                               StreamConnector::connect (connect timeout)
//! ```
//!
//! A connection goes back to the pool only after a complete request and
//! response. An attempt that is dropped halfway drops its connection with it.

use super::rpc::{read_frame, write_frame, ReplicaRequest, ReplicaResponse};
use crate::error::TransportError;
use crate::types::InstanceEndpoint;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Sends single-key reads to replicas.
///
/// Dropping the returned future cancels the request.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(
        &self,
        endpoint: &InstanceEndpoint,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError>;

    /// Release pooled connections. Later calls fail with
    /// [`TransportError::Closed`].
    async fn close(&self) {}
}

/// A byte stream to a replica.
pub trait ReplicaStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ReplicaStream for T {}

pub type BoxedStream = Box<dyn ReplicaStream>;

/// Opens streams to replicas. TLS is plugged in by implementing this trait
/// around the TLS library of the embedding application.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &InstanceEndpoint, secure: bool) -> io::Result<BoxedStream>;

    /// Whether the streams from this connector are encrypted.
    fn supports_tls(&self) -> bool {
        false
    }
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTcpConnector;

#[async_trait]
impl StreamConnector for PlainTcpConnector {
    async fn connect(&self, endpoint: &InstanceEndpoint, secure: bool) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(endpoint.address(secure)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Configuration of [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Idle connections kept per endpoint.
    pub max_idle_per_endpoint: usize,

    /// Dial the TLS port of each endpoint.
    pub secure: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            max_idle_per_endpoint: 8,
            secure: false,
        }
    }
}

impl TransportConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_idle_per_endpoint(mut self, max: usize) -> Self {
        self.max_idle_per_endpoint = max;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

/// Counters of a [`TcpTransport`].
#[derive(Debug, Default)]
pub struct TransportStats {
    connections_opened: AtomicU64,
    connections_reused: AtomicU64,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl TransportStats {
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    pub fn connections_reused(&self) -> u64 {
        self.connections_reused.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Framed TCP transport with per-endpoint connection pooling.
pub struct TcpTransport {
    config: TransportConfig,
    connector: Arc<dyn StreamConnector>,
    idle: DashMap<InstanceEndpoint, Mutex<Vec<BoxedStream>>>,
    closed: AtomicBool,
    stats: TransportStats,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_connector(config, Arc::new(PlainTcpConnector))
    }

    pub fn with_connector(config: TransportConfig, connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            config,
            connector,
            idle: DashMap::new(),
            closed: AtomicBool::new(false),
            stats: TransportStats::default(),
        }
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn connector_supports_tls(&self) -> bool {
        self.connector.supports_tls()
    }

    /// Idle pooled connections to `endpoint`.
    pub fn idle_connections(&self, endpoint: &InstanceEndpoint) -> usize {
        self.idle.get(endpoint).map(|pool| pool.lock().len()).unwrap_or(0)
    }

    fn take_idle(&self, endpoint: &InstanceEndpoint) -> Option<BoxedStream> {
        let stream = self.idle.get(endpoint)?.lock().pop();
        if stream.is_some() {
            self.stats.connections_reused.fetch_add(1, Ordering::Relaxed);
        }
        stream
    }

    fn return_idle(&self, endpoint: &InstanceEndpoint, stream: BoxedStream) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let pool = self.idle.entry(endpoint.clone()).or_default();
        let mut streams = pool.lock();
        if streams.len() < self.config.max_idle_per_endpoint {
            streams.push(stream);
        }
    }

    async fn dial(&self, endpoint: &InstanceEndpoint) -> Result<BoxedStream, TransportError> {
        let addr = endpoint.address(self.config.secure);
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(endpoint, self.config.secure),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed {
            addr: addr.clone(),
            reason: "connection timeout".to_string(),
        })?
        .map_err(|e| TransportError::ConnectionFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
        debug!(addr = %addr, "Opened replica connection");
        Ok(stream)
    }

    async fn round_trip(
        stream: &mut BoxedStream,
        request: &ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        write_frame(stream, request).await?;
        let response: ReplicaResponse = read_frame(stream)
            .await?
            .ok_or(TransportError::ConnectionClosed)?;
        if response.request_id != request.request_id {
            return Err(TransportError::ReceiveFailed(format!(
                "response for request {} while waiting for {}",
                response.request_id, request.request_id
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn get(
        &self,
        endpoint: &InstanceEndpoint,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        // A pooled connection may have been closed by the peer while idle;
        // such a failure is retried once on a fresh connection.
        if let Some(mut stream) = self.take_idle(endpoint) {
            match Self::round_trip(&mut stream, &request).await {
                Ok(response) => {
                    self.return_idle(endpoint, stream);
                    return Ok(response);
                }
                Err(e) => {
                    trace!(endpoint = %endpoint, error = %e, "Pooled connection failed, redialing");
                }
            }
        }

        let result = async {
            let mut stream = self.dial(endpoint).await?;
            let response = Self::round_trip(&mut stream, &request).await?;
            Ok::<_, TransportError>((stream, response))
        }
        .await;

        match result {
            Ok((stream, response)) => {
                self.return_idle(endpoint, stream);
                Ok(response)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let drained: usize = self.idle.iter().map(|pool| pool.lock().len()).sum();
            self.idle.clear();
            debug!(connections = drained, "Transport closed, idle connections drained");
        }
    }
}
