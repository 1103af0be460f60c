//! In-memory document store for testing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::item::{
    RawCounterGroup, RawDocument, RawTombstone, TombstoneKind, COLLECTION_KEY, METADATA_KEY,
};
use crate::storage::{
    ChangeCallback, ChangeKind, ChangeNotifications, DocumentStorage, ItemIter, ReadTransaction,
    StorageChange, StorageError, SubscriptionId, SubscriptionKind,
};
use crate::sync::lock;

#[derive(Debug, Clone, Default)]
struct StorageData {
    last_etag: u64,
    /// Keyed by lowercase id.
    documents: BTreeMap<String, RawDocument>,
    tombstones: Vec<RawTombstone>,
    /// Keyed by lowercase document id.
    counters: BTreeMap<String, RawCounterGroup>,
}

/// Mock implementation of [`DocumentStorage`].
///
/// Every write takes the next etag and gets a `TAG:ETAG-DBID` change vector.
/// Read transactions see a snapshot taken when they were opened.
///
/// # Example
///
/// ```rust,ignore
/// use changefeed_core::testing::MockStorage;
///
/// let storage = MockStorage::new("A", "dbA");
/// storage.put_document("orders/1", "Orders", json!({"total": 10}));
/// storage.delete_document("orders/1");
/// assert_eq!(storage.last_etag(), 2);
/// ```
pub struct MockStorage {
    node_tag: String,
    database_id: String,
    data: Mutex<StorageData>,
    notifications: Option<Arc<MockChangeNotifications>>,
    fail_reads: AtomicBool,
    non_reusable: AtomicU64,
}

impl MockStorage {
    pub fn new(node_tag: &str, database_id: &str) -> Self {
        Self {
            node_tag: node_tag.to_string(),
            database_id: database_id.to_string(),
            data: Mutex::new(StorageData::default()),
            notifications: None,
            fail_reads: AtomicBool::new(false),
            non_reusable: AtomicU64::new(0),
        }
    }

    /// Publish every write to `notifications`.
    pub fn with_notifications(mut self, notifications: Arc<MockChangeNotifications>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Create or replace a document. Returns its new etag.
    pub fn put_document(&self, id: &str, collection: &str, data: Value) -> u64 {
        let mut data = data;
        set_collection(&mut data, collection);

        let etag = {
            let mut store = lock(&self.data);
            let etag = next_etag(&mut store);
            let document = RawDocument {
                id: id.to_string(),
                etag,
                change_vector: self.change_vector(etag),
                data,
            };
            store.tombstones.retain(|t| !t.id.eq_ignore_ascii_case(id));
            if let Some(group) = store.counters.get_mut(&id.to_lowercase()) {
                group.document_etag = etag;
            }
            store.documents.insert(id.to_lowercase(), document);
            etag
        };

        self.publish(StorageChange::new(ChangeKind::DocumentPut, id, collection));
        etag
    }

    /// Store a document that arrived with its own change vector, e.g. by
    /// replication. The etag is assigned locally.
    pub fn put_raw_document(&self, collection: &str, mut document: RawDocument) -> u64 {
        set_collection(&mut document.data, collection);
        let id = document.id.clone();

        let etag = {
            let mut store = lock(&self.data);
            let etag = next_etag(&mut store);
            document.etag = etag;
            store.tombstones.retain(|t| !t.id.eq_ignore_ascii_case(&id));
            if let Some(group) = store.counters.get_mut(&id.to_lowercase()) {
                group.document_etag = etag;
            }
            store.documents.insert(id.to_lowercase(), document);
            etag
        };

        self.publish(StorageChange::new(ChangeKind::DocumentPut, id, collection));
        etag
    }

    /// Delete a document, leaving a tombstone. Its counters go with it.
    pub fn delete_document(&self, id: &str) -> Option<u64> {
        let (etag, collection) = {
            let mut store = lock(&self.data);
            let document = store.documents.remove(&id.to_lowercase())?;
            store.counters.remove(&id.to_lowercase());
            let etag = next_etag(&mut store);
            let collection = document
                .metadata_collection()
                .unwrap_or_default()
                .to_string();
            store.tombstones.push(RawTombstone {
                id: document.id.clone(),
                etag,
                change_vector: self.change_vector(etag),
                collection: collection.clone(),
                kind: TombstoneKind::Document,
            });
            (etag, collection)
        };

        self.publish(StorageChange::new(ChangeKind::DocumentDelete, id, collection));
        Some(etag)
    }

    /// Set one counter of a document. The whole counter group gets a new etag.
    pub fn put_counter(&self, document_id: &str, name: &str, value: i64) -> u64 {
        let (etag, collection) = {
            let mut store = lock(&self.data);
            let etag = next_etag(&mut store);
            let (document_etag, collection) = store
                .documents
                .get(&document_id.to_lowercase())
                .map(|d| (d.etag, d.metadata_collection().unwrap_or_default().to_string()))
                .unwrap_or_default();

            let change_vector = self.change_vector(etag);
            let group = store
                .counters
                .entry(document_id.to_lowercase())
                .or_insert_with(|| RawCounterGroup {
                    document_id: document_id.to_string(),
                    etag,
                    change_vector: change_vector.clone(),
                    collection: collection.clone(),
                    document_etag,
                    counters: json!({}),
                });
            group.etag = etag;
            group.change_vector = change_vector;
            group.document_etag = document_etag;
            group.collection = collection.clone();
            if let Value::Object(counters) = &mut group.counters {
                counters.insert(name.to_string(), json!(value));
            }
            (etag, collection)
        };

        self.publish(StorageChange::new(ChangeKind::CounterChange, document_id, collection));
        etag
    }

    /// Delete an attachment, leaving an attachment tombstone.
    pub fn delete_attachment(&self, document_id: &str, collection: &str, name: &str) -> u64 {
        let mut store = lock(&self.data);
        let etag = next_etag(&mut store);
        store.tombstones.push(RawTombstone {
            id: format!("{}/{}", document_id, name),
            etag,
            change_vector: self.change_vector(etag),
            collection: collection.to_string(),
            kind: TombstoneKind::Attachment,
        });
        etag
    }

    /// Make `begin_read` fail until cleared.
    pub fn set_read_failure(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn last_etag(&self) -> u64 {
        lock(&self.data).last_etag
    }

    pub fn document(&self, id: &str) -> Option<RawDocument> {
        lock(&self.data).documents.get(&id.to_lowercase()).cloned()
    }

    /// How many read transactions were marked non-reusable.
    pub fn non_reusable_count(&self) -> u64 {
        self.non_reusable.load(Ordering::SeqCst)
    }

    fn change_vector(&self, etag: u64) -> String {
        format!("{}:{}-{}", self.node_tag, etag, self.database_id)
    }

    fn publish(&self, change: StorageChange) {
        if let Some(notifications) = &self.notifications {
            notifications.publish(&change);
        }
    }
}

impl DocumentStorage for MockStorage {
    fn begin_read(&self) -> Result<Box<dyn ReadTransaction + '_>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Transaction("simulated storage failure".to_string()));
        }
        Ok(Box::new(MockReadTransaction {
            data: lock(&self.data).clone(),
            non_reusable: &self.non_reusable,
        }))
    }
}

struct MockReadTransaction<'a> {
    data: StorageData,
    non_reusable: &'a AtomicU64,
}

impl MockReadTransaction<'_> {
    fn documents(&self, collection: Option<&str>, from_etag: u64) -> Vec<RawDocument> {
        let mut documents: Vec<RawDocument> = self
            .data
            .documents
            .values()
            .filter(|d| d.etag >= from_etag)
            .filter(|d| in_collection(d.metadata_collection().unwrap_or_default(), collection))
            .cloned()
            .collect();
        documents.sort_by_key(|d| d.etag);
        documents
    }

    fn tombstones(&self, kind: TombstoneKind, collection: Option<&str>, from_etag: u64) -> Vec<RawTombstone> {
        let mut tombstones: Vec<RawTombstone> = self
            .data
            .tombstones
            .iter()
            .filter(|t| t.kind == kind && t.etag >= from_etag)
            .filter(|t| in_collection(&t.collection, collection))
            .cloned()
            .collect();
        tombstones.sort_by_key(|t| t.etag);
        tombstones
    }

    fn counter_groups(&self, collection: Option<&str>, from_etag: u64) -> Vec<RawCounterGroup> {
        let mut groups: Vec<RawCounterGroup> = self
            .data
            .counters
            .values()
            .filter(|g| g.etag >= from_etag)
            .filter(|g| in_collection(&g.collection, collection))
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.etag);
        groups
    }
}

impl ReadTransaction for MockReadTransaction<'_> {
    fn documents_from(&self, collection: Option<&str>, from_etag: u64) -> ItemIter<'_, RawDocument> {
        Box::new(self.documents(collection, from_etag).into_iter().map(Ok))
    }

    fn tombstones_from(&self, collection: Option<&str>, from_etag: u64) -> ItemIter<'_, RawTombstone> {
        Box::new(
            self.tombstones(TombstoneKind::Document, collection, from_etag)
                .into_iter()
                .map(Ok),
        )
    }

    fn attachment_tombstones_from(&self, from_etag: u64) -> ItemIter<'_, RawTombstone> {
        Box::new(
            self.tombstones(TombstoneKind::Attachment, None, from_etag)
                .into_iter()
                .map(Ok),
        )
    }

    fn counter_groups_from(
        &self,
        collection: Option<&str>,
        from_etag: u64,
    ) -> ItemIter<'_, RawCounterGroup> {
        Box::new(self.counter_groups(collection, from_etag).into_iter().map(Ok))
    }

    fn count_documents_after(&self, collection: Option<&str>, etag: u64) -> Result<u64, StorageError> {
        Ok(self.documents(collection, etag + 1).len() as u64)
    }

    fn count_tombstones_after(&self, collection: Option<&str>, etag: u64) -> Result<u64, StorageError> {
        Ok(self
            .tombstones(TombstoneKind::Document, collection, etag + 1)
            .len() as u64)
    }

    fn count_counter_groups_after(
        &self,
        collection: Option<&str>,
        etag: u64,
    ) -> Result<u64, StorageError> {
        Ok(self.counter_groups(collection, etag + 1).len() as u64)
    }

    fn last_etag(&self) -> u64 {
        self.data.last_etag
    }

    fn mark_non_reusable(&self) {
        self.non_reusable.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock implementation of [`ChangeNotifications`].
///
/// Callbacks run synchronously on the publishing thread.
#[derive(Default)]
pub struct MockChangeNotifications {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<(SubscriptionId, SubscriptionKind, ChangeCallback)>>,
}

impl MockChangeNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `change` to every matching subscriber.
    pub fn publish(&self, change: &StorageChange) {
        let kind = if change.is_counter_change() {
            SubscriptionKind::Counters
        } else {
            SubscriptionKind::Documents
        };
        let callbacks: Vec<ChangeCallback> = lock(&self.subscriptions)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(change);
        }
    }

    /// Number of live subscriptions of `kind`.
    pub fn active(&self, kind: SubscriptionKind) -> usize {
        lock(&self.subscriptions)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }
}

impl ChangeNotifications for MockChangeNotifications {
    fn subscribe(&self, kind: SubscriptionKind, callback: ChangeCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.subscriptions).push((id, kind, callback));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.subscriptions).retain(|(existing, _, _)| *existing != id);
    }
}

fn next_etag(store: &mut StorageData) -> u64 {
    store.last_etag += 1;
    store.last_etag
}

fn in_collection(actual: &str, wanted: Option<&str>) -> bool {
    wanted.map_or(true, |wanted| actual.eq_ignore_ascii_case(wanted))
}

fn set_collection(data: &mut Value, collection: &str) {
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    if let Value::Object(object) = data {
        let metadata = object
            .entry(METADATA_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert(COLLECTION_KEY.to_string(), Value::String(collection.to_string()));
        }
    }
}
