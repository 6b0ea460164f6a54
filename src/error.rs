//! Error types for the store client.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::types::{PartitionId, SchemaId, VersionNumber};

/// Result type alias for store client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal error returned for one logical request (or one key of a batch).
///
/// A key that does not exist is not an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum Error {
    /// The partition has no ready-to-serve replica.
    #[error("no available replica for {resource} partition {partition}")]
    NoAvailableReplica {
        resource: String,
        partition: PartitionId,
    },

    /// The requested version is neither current nor retained in the cache.
    #[error("unknown version {version} for store {store}")]
    UnknownVersion { store: String, version: VersionNumber },

    /// The value schema id is unknown, even after an on-demand refresh.
    #[error("unknown value schema id {id} for store {store}")]
    UnknownSchemaId { store: String, id: SchemaId },

    /// Every attempt failed with a recoverable network fault.
    #[error("transport error: {0}")]
    RetryableTransport(#[from] TransportError),

    /// The request deadline passed without a successful attempt.
    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The stored value does not match the schema the client expects.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The stored value could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Every replica reported that it no longer serves the cached version.
    #[error("metadata for {resource} is stale")]
    StaleMetadata { resource: String },

    /// The external metadata or schema source failed.
    #[error("metadata source error: {0}")]
    Metadata(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The client has not been started.
    #[error("client not started")]
    NotStarted,

    /// The client has been closed.
    #[error("client closed")]
    Closed,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether another replica could plausibly serve the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RetryableTransport(_) | Error::NoAvailableReplica { .. } | Error::StaleMetadata { .. }
        )
    }

    /// Short stable label, used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoAvailableReplica { .. } => "no_available_replica",
            Error::UnknownVersion { .. } => "unknown_version",
            Error::UnknownSchemaId { .. } => "unknown_schema_id",
            Error::RetryableTransport(_) => "transport",
            Error::Timeout { .. } => "timeout",
            Error::SchemaMismatch(_) => "schema_mismatch",
            Error::Deserialization(_) => "deserialization",
            Error::StaleMetadata { .. } => "stale_metadata",
            Error::Metadata(_) => "metadata",
            Error::Config(_) => "config",
            Error::Cancelled => "cancelled",
            Error::NotStarted => "not_started",
            Error::Closed => "closed",
            Error::Internal(_) => "internal",
        }
    }
}

/// Network communication errors for a single replica attempt.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send a frame.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The attempt ran out of time.
    #[error("attempt timed out")]
    Timeout,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The replica failed to process the request.
    #[error("replica error: {0}")]
    Remote(String),

    /// The transport was shut down.
    #[error("transport closed")]
    Closed,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}
