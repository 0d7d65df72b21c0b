/// Errors from the storage backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Error surfaced by LMDB. A full map (`MDB_MAP_FULL`) arrives
    /// through here and is fatal to the writer.
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),

    /// Filesystem error while preparing the database directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
