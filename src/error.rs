//! Error types for reconcile-rs.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown requested before the cache finished its initial sync")]
    CacheSync,

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("conflict writing {name}: expected version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("reconcile action failed: {0}")]
    Handler(String),

    #[error("reconcile handler panicked: {0}")]
    Panicked(String),

    #[error("invalid controller transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("bad manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is an optimistic-concurrency conflict that the
    /// caller can resolve by re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
