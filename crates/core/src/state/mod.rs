//! Replicated checkpoint state and the version vectors it is compared with.

mod change_vector;
mod types;

pub use change_vector::{ChangeVector, ChangeVectorEntry, ChangeVectorError, ConflictStatus};
pub use types::ProcessState;
