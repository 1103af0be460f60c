use crate::item::{RawCounterGroup, RawDocument, RawTombstone};

use super::{ChangeCallback, StorageError, SubscriptionId, SubscriptionKind};

/// Lazily evaluated, etag-ordered enumeration bound to a read transaction.
pub type ItemIter<'a, T> = Box<dyn Iterator<Item = Result<T, StorageError>> + 'a>;

/// The local document store.
pub trait DocumentStorage: Send + Sync {
    /// Open a short-lived snapshot for one batch.
    fn begin_read(&self) -> Result<Box<dyn ReadTransaction + '_>, StorageError>;
}

/// A consistent snapshot of the store.
///
/// Every enumeration yields items with `etag >= from_etag` in ascending etag
/// order. A `None` collection enumerates across all collections.
pub trait ReadTransaction {
    fn documents_from(&self, collection: Option<&str>, from_etag: u64) -> ItemIter<'_, RawDocument>;

    fn tombstones_from(&self, collection: Option<&str>, from_etag: u64) -> ItemIter<'_, RawTombstone>;

    fn attachment_tombstones_from(&self, from_etag: u64) -> ItemIter<'_, RawTombstone>;

    fn counter_groups_from(
        &self,
        collection: Option<&str>,
        from_etag: u64,
    ) -> ItemIter<'_, RawCounterGroup>;

    fn count_documents_after(&self, collection: Option<&str>, etag: u64) -> Result<u64, StorageError>;

    fn count_tombstones_after(&self, collection: Option<&str>, etag: u64) -> Result<u64, StorageError>;

    fn count_counter_groups_after(
        &self,
        collection: Option<&str>,
        etag: u64,
    ) -> Result<u64, StorageError>;

    /// Highest etag of any kind visible in this snapshot.
    fn last_etag(&self) -> u64;

    /// The transaction grew too large to be kept around after this batch.
    fn mark_non_reusable(&self) {}
}

/// Source of storage change callbacks.
pub trait ChangeNotifications: Send + Sync {
    fn subscribe(&self, kind: SubscriptionKind, callback: ChangeCallback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}
