//! Cluster collaborators: consensus-replicated checkpoints and task ownership.

mod error;
mod traits;
mod types;

pub use error::ConsensusError;
pub use traits::{Consensus, OwnershipOracle};
pub use types::UpdateProcessStateCommand;
