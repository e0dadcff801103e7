//! Error types for collaborator operations.

use thiserror::Error;

/// Errors returned by a [`DiagramStore`](crate::store::DiagramStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested diagram does not exist.
    #[error("Diagram not found: {0}")]
    DiagramNotFound(String),

    /// An I/O error occurred during persistence.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The backing store rejected or could not complete the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the error means the diagram is gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DiagramNotFound(_))
    }
}

/// Errors returned by an [`AuthorizationService`](crate::authz::AuthorizationService).
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Role lookup failed.
    #[error("Authorization service unavailable: {0}")]
    Unavailable(String),

    /// A grants file could not be parsed.
    #[error("Invalid role grants: {0}")]
    InvalidGrants(String),

    /// A grants file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
