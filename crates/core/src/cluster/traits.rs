use std::time::Duration;

use async_trait::async_trait;

use crate::state::ProcessState;
use crate::task::{DatabaseTopology, EtlConfiguration};

use super::{ConsensusError, UpdateProcessStateCommand};

/// The cluster's replicated state machine, as seen by one node.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Locally applied checkpoint. Empty when none was ever committed or after a reset.
    fn process_state(&self, database: &str, configuration: &str, transformation: &str)
        -> ProcessState;

    /// Submit a checkpoint update to the leader. Returns the command's log index.
    async fn send_to_leader(
        &self,
        command: UpdateProcessStateCommand,
    ) -> Result<(u64, ProcessState), ConsensusError>;

    /// Wait until the local node applied `index`.
    async fn wait_for_index_applied(&self, index: u64, timeout: Duration)
        -> Result<(), ConsensusError>;
}

/// Decides which node runs a task.
pub trait OwnershipOracle: Send + Sync {
    fn whose_task_is_it(
        &self,
        topology: &DatabaseTopology,
        configuration: &EtlConfiguration,
        state: &ProcessState,
    ) -> Option<String>;
}
