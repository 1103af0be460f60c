use thiserror::Error;

/// Errors raised by storage enumeration.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Failed to open read transaction: {0}")]
    Transaction(String),

    #[error("Storage read failed: {0}")]
    Read(String),
}
