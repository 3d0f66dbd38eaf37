//! Error taxonomy shared by the transport, codec and store layers.

use std::time::Duration;

use thiserror::Error;

use crate::ObjectKey;

/// Failures below HTTP semantics, plus authentication rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection, DNS or TLS failure.
    #[error("control plane unreachable: {0}")]
    Unreachable(String),
    /// HTTP 401/403 or a credential that could not be applied.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("missing required field {0}")]
    MissingField(String),
    #[error("{what} exceeds limit of {limit}")]
    TooLarge { what: &'static str, limit: usize },
}

/// Outcome of a store operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    /// Submitted resourceVersion is stale; re-read before writing again.
    #[error("conflict on {key}: {message}")]
    Conflict { key: ObjectKey, message: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unexpected response {status}: {message}")]
    Unexpected { status: u16, message: String },
}

impl StoreError {
    /// Whether waiting and trying again can succeed. Conflicts only heal after a re-read.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(TransportError::Unauthorized(_)) => false,
            StoreError::Transport(_) => true,
            StoreError::Conflict { .. } => true,
            StoreError::Unexpected { status, .. } => *status == 429 || *status >= 500,
            StoreError::NotFound(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Validation(_)
            | StoreError::Codec(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }

    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}
