//! Network layer: replica wire protocol, client transport, test server.

pub mod rpc;
pub mod server;
pub mod transport;

pub use rpc::{ReplicaRequest, ReplicaResponse, ResponseStatus};
pub use server::{ReplicaServer, RequestHandler};
pub use transport::{
    BoxedStream, PlainTcpConnector, ReplicaStream, StreamConnector, TcpTransport, Transport,
    TransportConfig, TransportStats,
};
