use thiserror::Error;

/// Errors surfaced by the disk store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error from the underlying filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk data which does not conform to the expected format.
    ///
    /// This is fatal at load: the store refuses to start on malformed data.
    #[error("malformed data: {0}")]
    Malformed(String),
    /// On-disk data which is structurally valid but fails integrity checks.
    ///
    /// This is fatal at load: the store refuses to start on corrupt data.
    #[error("corrupt data: {0}")]
    Corrupt(String),
    /// The store is closing; the operation was canceled.
    #[error("the operation was canceled")]
    Canceled,
    /// The store's directory is locked by another process.
    #[error("the directory {0} is locked by another process")]
    Locked(String),
}
