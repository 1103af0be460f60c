use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ChangeVector;

/// Durable checkpoint of one (configuration, transformation) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub configuration_name: String,
    pub transformation_name: String,
    /// Highest processed etag, per node that has owned the task.
    #[serde(default)]
    pub last_processed_etag_per_node: BTreeMap<String, u64>,
    /// Merge of the change vectors of everything processed so far.
    #[serde(default)]
    pub change_vector: String,
    /// Node that committed the checkpoint last.
    #[serde(default)]
    pub node_tag: Option<String>,
}

impl ProcessState {
    pub fn new(configuration_name: impl Into<String>, transformation_name: impl Into<String>) -> Self {
        Self {
            configuration_name: configuration_name.into(),
            transformation_name: transformation_name.into(),
            ..Default::default()
        }
    }

    /// Checkpoint for `node_tag`, 0 when this node never processed anything.
    pub fn last_processed_etag_for(&self, node_tag: &str) -> u64 {
        self.last_processed_etag_per_node
            .get(node_tag)
            .copied()
            .unwrap_or(0)
    }

    pub fn parsed_change_vector(&self) -> ChangeVector {
        ChangeVector::parse_lenient(&self.change_vector)
    }

    /// True after a reset or before the first commit.
    pub fn is_empty(&self) -> bool {
        self.last_processed_etag_per_node.is_empty() && self.change_vector.is_empty()
    }

    /// Record progress by `node_tag`. A node's etag never moves backwards.
    pub fn advance(&mut self, node_tag: &str, etag: u64, change_vector: String) {
        let last = self
            .last_processed_etag_per_node
            .entry(node_tag.to_string())
            .or_insert(0);
        *last = (*last).max(etag);
        self.change_vector = change_vector;
        self.node_tag = Some(node_tag.to_string());
    }
}
