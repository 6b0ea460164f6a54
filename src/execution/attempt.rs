//! Outcome of a single replica attempt.

use crate::error::{Error, TransportError};
use crate::network::{ReplicaResponse, ResponseStatus};
use crate::types::{InstanceEndpoint, VersionedValue};
use thiserror::Error;

/// Why one attempt against one replica failed.
#[derive(Error, Debug)]
pub enum AttemptError {
    /// Network failure or attempt timeout.
    #[error("transport: {0}")]
    Transport(TransportError),

    /// The replica does not serve the requested version or partition.
    #[error("replica does not serve the requested version")]
    NotServing,

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("deserialization: {0}")]
    Deserialization(String),
}

impl AttemptError {
    /// Whether another candidate should be tried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Transport(_) | AttemptError::NotServing)
    }

    /// Metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            AttemptError::Transport(TransportError::Timeout) => "timeout",
            AttemptError::Transport(_) => "transport",
            AttemptError::NotServing => "not_serving",
            AttemptError::SchemaMismatch(_) => "schema_mismatch",
            AttemptError::Deserialization(_) => "deserialization",
        }
    }
}

impl From<AttemptError> for Error {
    fn from(e: AttemptError) -> Self {
        match e {
            AttemptError::Transport(t) => Error::RetryableTransport(t),
            // Callers turn exhausted NotServing failures into StaleMetadata
            // with the resource name; this arm only covers stray uses.
            AttemptError::NotServing => Error::Internal("replica not serving".to_string()),
            AttemptError::SchemaMismatch(m) => Error::SchemaMismatch(m),
            AttemptError::Deserialization(m) => Error::Deserialization(m),
        }
    }
}

/// A finished attempt, as reported back to the coordinator.
#[derive(Debug)]
pub(crate) struct AttemptReport {
    /// Launch order of the attempt within its request.
    pub seq: usize,
    pub endpoint: InstanceEndpoint,
    pub result: Result<Option<VersionedValue>, AttemptError>,
}

/// Map a transport result onto the attempt classification.
pub(crate) fn classify(
    response: Result<ReplicaResponse, TransportError>,
) -> Result<Option<VersionedValue>, AttemptError> {
    match response {
        Ok(response) => match response.status {
            ResponseStatus::Found { schema_id, value } => {
                Ok(Some(VersionedValue { schema_id, value }))
            }
            ResponseStatus::NotFound => Ok(None),
            ResponseStatus::NotServing => Err(AttemptError::NotServing),
            ResponseStatus::SchemaMismatch(reason) => Err(AttemptError::SchemaMismatch(reason)),
            ResponseStatus::Error(message) => {
                Err(AttemptError::Transport(TransportError::Remote(message)))
            }
        },
        Err(TransportError::Serialization(message)) => Err(AttemptError::Deserialization(message)),
        Err(e) => Err(AttemptError::Transport(e)),
    }
}
