//! Error types for the store.

use thiserror::Error;

/// Errors returned by [`crate::Database`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded.
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Preparing the database location failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Builds a [`StoreError::NotFound`] for a peer id.
    #[must_use]
    pub fn peer_not_found(id: i64) -> Self {
        Self::NotFound(format!("peer {id}"))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
