use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which notification stream a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Documents,
    Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    DocumentPut,
    DocumentDelete,
    CounterChange,
}

/// A committed storage mutation, used purely as a wake-up signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageChange {
    pub kind: ChangeKind,
    pub id: String,
    pub collection: String,
}

impl StorageChange {
    pub fn new(kind: ChangeKind, id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            collection: collection.into(),
        }
    }

    pub fn is_counter_change(&self) -> bool {
        self.kind == ChangeKind::CounterChange
    }
}

/// Handle returned by [`ChangeNotifications::subscribe`](super::ChangeNotifications::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type ChangeCallback = Arc<dyn Fn(&StorageChange) + Send + Sync>;
