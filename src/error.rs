//! Typed error categories shared by the store, node client, queue, and
//! indexing components.

use std::fmt;
use thiserror::Error;

/// Infrastructure resource that produced a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Store,
    Node,
    Queue,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Store => write!(f, "store"),
            Resource::Node => write!(f, "node"),
            Resource::Queue => write!(f, "queue"),
        }
    }
}

/// Errors surfaced by the indexer core.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Malformed caller parameters or raw payloads. Never retried.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The requested entity does not exist under the given key.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Timeout or connection loss against the store, node, or queue.
    #[error("{resource} unavailable: {message}")]
    Transient { resource: Resource, message: String },

    /// Derived state disagrees with the store.
    #[error("consistency fault: {0}")]
    Consistency(String),

    /// Unrecoverable condition; the process must stop.
    #[error("fatal integrity error: {0}")]
    FatalIntegrity(String),
}

impl IndexerError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        IndexerError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        IndexerError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::transient(Resource::Store, message)
    }

    pub fn node(message: impl Into<String>) -> Self {
        Self::transient(Resource::Node, message)
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::transient(Resource::Queue, message)
    }

    fn transient(resource: Resource, message: impl Into<String>) -> Self {
        IndexerError::Transient {
            resource,
            message: message.into(),
        }
    }

    /// Whether background work hitting this error should be attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::Transient { .. })
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;

/// Finds a typed indexer error anywhere in an `anyhow` chain.
pub fn find_indexer_error(err: &anyhow::Error) -> Option<&IndexerError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<IndexerError>())
}
