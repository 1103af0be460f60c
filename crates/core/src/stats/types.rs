use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::ItemType;

/// Counters split by item type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts {
    pub documents: u64,
    pub counter_groups: u64,
}

impl TypeCounts {
    pub fn get(&self, item_type: ItemType) -> u64 {
        match item_type {
            ItemType::Document => self.documents,
            ItemType::CounterGroup => self.counter_groups,
        }
    }

    pub fn increment(&mut self, item_type: ItemType) {
        match item_type {
            ItemType::Document => self.documents += 1,
            ItemType::CounterGroup => self.counter_groups += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.documents + self.counter_groups
    }
}

/// What happened during one batch. Kept in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlRunStats {
    pub batch_id: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub extracted: TypeCounts,
    pub transformed: TypeCounts,
    pub filtered: TypeCounts,
    pub loaded: u64,
    pub transformation_errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    /// Why admission control cut the batch short.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_stop_reason: Option<String>,
    /// Set when the stream ran dry before any limit was hit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_complete_reason: Option<String>,
    pub last_extracted_etag: u64,
    pub last_transformed_etag: u64,
    pub last_filtered_etag: u64,
    pub allocated_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_vector: Option<String>,
    /// Checkpoint committed at the end of the batch, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_etag: Option<u64>,
}

impl EtlRunStats {
    pub fn new(batch_id: u64) -> Self {
        Self {
            batch_id,
            started_at: Utc::now(),
            duration_ms: 0,
            extracted: TypeCounts::default(),
            transformed: TypeCounts::default(),
            filtered: TypeCounts::default(),
            loaded: 0,
            transformation_errors: 0,
            load_error: None,
            batch_stop_reason: None,
            batch_complete_reason: None,
            last_extracted_etag: 0,
            last_transformed_etag: 0,
            last_filtered_etag: 0,
            allocated_bytes: 0,
            change_vector: None,
            committed_etag: None,
        }
    }

    /// Highest etag that is safe to checkpoint.
    pub fn checkpoint_candidate(&self) -> u64 {
        self.last_transformed_etag.max(self.last_filtered_etag)
    }

    /// Items that went through the transform step, filtered or not.
    pub fn processed(&self) -> u64 {
        self.transformed.total() + self.filtered.total()
    }
}
