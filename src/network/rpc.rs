//! Wire messages exchanged with replicas, and their framing.
//!
//! Every message is a `bincode` payload prefixed by its length as a
//! big-endian `u32`.

use crate::error::TransportError;
use crate::types::{PartitionId, SchemaId};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound of a frame payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Single-key read addressed to one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRequest {
    /// Correlation id, echoed in the response.
    pub request_id: u64,

    /// Resource name of the version being read (`store_vN`).
    pub resource: String,

    pub partition: PartitionId,

    pub key: Bytes,
}

impl ReplicaRequest {
    pub fn new(
        request_id: u64,
        resource: impl Into<String>,
        partition: PartitionId,
        key: Bytes,
    ) -> Self {
        Self {
            request_id,
            resource: resource.into(),
            partition,
            key,
        }
    }
}

/// Response of a replica to a [`ReplicaRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub request_id: u64,
    pub status: ResponseStatus,
}

/// Outcome reported by the replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The key exists.
    Found { schema_id: SchemaId, value: Bytes },

    /// The key does not exist in this version.
    NotFound,

    /// The replica does not serve the requested resource or partition.
    NotServing,

    /// The key does not match the store's key schema.
    SchemaMismatch(String),

    /// The replica failed while processing the request.
    Error(String),
}

impl ReplicaResponse {
    pub fn found(request_id: u64, schema_id: SchemaId, value: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Found {
                schema_id,
                value: value.into(),
            },
        }
    }

    pub fn not_found(request_id: u64) -> Self {
        Self {
            request_id,
            status: ResponseStatus::NotFound,
        }
    }

    pub fn not_serving(request_id: u64) -> Self {
        Self {
            request_id,
            status: ResponseStatus::NotServing,
        }
    }

    pub fn error(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Error(message.into()),
        }
    }
}

/// Serialize `msg` into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Serialization(format!(
            "frame of {} bytes exceeds limit",
            data.len()
        )));
    }

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let framed = encode_frame(msg)?;
    writer
        .write_all(&framed)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` if the peer closed the stream cleanly
/// before a new frame started.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::ReceiveFailed("message too large".to_string()));
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

    Ok(Some(bincode::deserialize(&data)?))
}
