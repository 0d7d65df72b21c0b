use std::path::PathBuf;

use cask_backend::BackendError;

/// Errors surfaced to engine clients.
///
/// Recoverable conditions are returned by value: a missing resource is
/// `None`, a commit conflict is `Ok(false)`. Invariant violations
/// (refcount underflow, malformed refcount rows) are assertions, not
/// errors — the writer treats them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The client key is not storable (currently only: empty).
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    /// Another process holds the database directory.
    #[error("database directory is locked: {0}")]
    DirectoryLocked(PathBuf),

    /// Error from the storage backend.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The writer thread is no longer accepting work.
    #[error("writer thread stopped")]
    WriterStopped,
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Backend(BackendError::Io(e))
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
