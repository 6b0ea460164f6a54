//! TCP server side of the replica protocol.
//!
//! The client never runs this server; it exists so that replicas can be
//! simulated in tests and demos over real sockets.

use super::rpc::{read_frame, write_frame, ReplicaRequest, ReplicaResponse};
use crate::error::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Answers replica requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: ReplicaRequest) -> ReplicaResponse;
}

/// TCP server answering [`ReplicaRequest`]s.
///
/// Shutting the server down also drops every open connection, which is
/// what a crashed replica looks like to clients.
pub struct ReplicaServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ReplicaServer {
    /// Bind the listener. Port 0 picks a free port; see
    /// [`ReplicaServer::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(Self, mpsc::Sender<()>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            local_addr,
            handler,
            shutdown_rx,
        };
        Ok((server, shutdown_tx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until a shutdown signal arrives or the sender is dropped.
    pub async fn run(mut self) -> Result<(), TransportError> {
        info!(addr = %self.local_addr, "Replica server listening");
        let connections = CancellationToken::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let cancelled = connections.child_token();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancelled.cancelled() => {}
                                    result = Self::handle_connection(stream, handler) => {
                                        if let Err(e) = result {
                                            debug!(error = %e, "Connection handler error");
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(addr = %self.local_addr, "Replica server shutting down");
                    break;
                }
            }
        }

        connections.cancel();
        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), TransportError> {
        stream.set_nodelay(true)?;
        while let Some(request) = read_frame::<_, ReplicaRequest>(&mut stream).await? {
            let response = handler.handle(request).await;
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }
}
