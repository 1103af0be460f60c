use serde::{Deserialize, Serialize};

use crate::state::ProcessState;

/// Replicated command that moves a task's checkpoint forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProcessStateCommand {
    pub database: String,
    pub configuration_name: String,
    pub transformation_name: String,
    pub node_tag: String,
    pub last_processed_etag: u64,
    pub change_vector: String,
}

impl UpdateProcessStateCommand {
    /// Apply to the stored state. A checkpoint never moves backwards for the
    /// committing node.
    pub fn apply(&self, state: &mut ProcessState) {
        state.configuration_name = self.configuration_name.clone();
        state.transformation_name = self.transformation_name.clone();
        state.advance(
            &self.node_tag,
            self.last_processed_etag,
            self.change_vector.clone(),
        );
    }
}
