use thiserror::Error;

/// A failed delivery. There is no partial success: the whole batch is undelivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    #[error("Destination rejected the batch: {0}")]
    Rejected(String),

    #[error("Load cancelled")]
    Cancelled,
}
