use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsensusError {
    /// Leader unavailable or an election in progress; worth retrying shortly.
    #[error("Transient cluster failure: {0}")]
    Transient(String),

    #[error("Command rejected by the leader: {0}")]
    Rejected(String),

    #[error("Timed out waiting for index {index} to be applied")]
    Timeout { index: u64 },

    #[error("Operation cancelled")]
    Cancelled,
}

impl ConsensusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConsensusError::Transient(_))
    }
}
