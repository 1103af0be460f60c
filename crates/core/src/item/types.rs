//! Raw storage records and the uniform change unit built from them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::buffer::{AllocationTracker, PayloadBuffer};

/// Key of the metadata object embedded in every document body.
pub const METADATA_KEY: &str = "@metadata";

/// Metadata property holding the document's collection.
pub const COLLECTION_KEY: &str = "@collection";

/// Id prefix of the internal id-generator bookkeeping documents.
pub const ID_GENERATOR_PREFIX: &str = "hilo/";

/// A live document as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub etag: u64,
    pub change_vector: String,
    pub data: Value,
}

impl RawDocument {
    /// Collection recorded in the document metadata.
    pub fn metadata_collection(&self) -> Option<&str> {
        self.data
            .get(METADATA_KEY)
            .and_then(|m| m.get(COLLECTION_KEY))
            .and_then(Value::as_str)
    }
}

/// What a tombstone marks as deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TombstoneKind {
    Document,
    Attachment,
}

/// Durable deletion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTombstone {
    pub id: String,
    pub etag: u64,
    pub change_vector: String,
    pub collection: String,
    pub kind: TombstoneKind,
}

impl RawTombstone {
    /// Tombstone for `document`, reusing its etag and change vector.
    pub fn for_document(document: &RawDocument) -> Self {
        Self {
            id: document.id.clone(),
            etag: document.etag,
            change_vector: document.change_vector.clone(),
            collection: document.metadata_collection().unwrap_or_default().to_string(),
            kind: TombstoneKind::Document,
        }
    }
}

/// All counters of one document, versioned as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCounterGroup {
    pub document_id: String,
    pub etag: u64,
    pub change_vector: String,
    pub collection: String,
    /// Current etag of the document the counters belong to.
    pub document_etag: u64,
    pub counters: Value,
}

/// Item type used for per-type limits and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// Documents and their tombstones.
    Document,
    CounterGroup,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Document => "documents",
            ItemType::CounterGroup => "counter groups",
        }
    }
}

/// The variant an extracted item was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    Document,
    Tombstone { of: TombstoneKind },
    CounterGroup { document_etag: u64 },
}

/// One change flowing through a pipeline.
#[derive(Debug)]
pub struct ExtractedItem {
    pub id: String,
    pub etag: u64,
    pub change_vector: String,
    pub collection: Option<String>,
    pub is_delete: bool,
    pub filtered: bool,
    kind: ItemKind,
    payload: Option<PayloadBuffer>,
}

impl ExtractedItem {
    /// Build from a live document. Without an explicit collection the
    /// metadata collection is used.
    pub fn from_document(document: RawDocument, collection: Option<&str>) -> Self {
        let collection = collection
            .map(str::to_string)
            .or_else(|| document.metadata_collection().map(str::to_string));

        Self {
            id: document.id,
            etag: document.etag,
            change_vector: document.change_vector,
            collection,
            is_delete: false,
            filtered: false,
            kind: ItemKind::Document,
            payload: Some(PayloadBuffer::new(document.data)),
        }
    }

    /// Build from a tombstone. Without an explicit collection the
    /// tombstone's recorded collection is used.
    pub fn from_tombstone(tombstone: RawTombstone, collection: Option<&str>) -> Self {
        let collection = match collection {
            Some(c) => Some(c.to_string()),
            None if tombstone.collection.is_empty() => None,
            None => Some(tombstone.collection),
        };

        Self {
            id: tombstone.id,
            etag: tombstone.etag,
            change_vector: tombstone.change_vector,
            collection,
            is_delete: true,
            filtered: false,
            kind: ItemKind::Tombstone { of: tombstone.kind },
            payload: None,
        }
    }

    pub fn from_counter_group(group: RawCounterGroup, collection: Option<&str>) -> Self {
        let collection = collection
            .map(str::to_string)
            .or(Some(group.collection));

        Self {
            id: group.document_id,
            etag: group.etag,
            change_vector: group.change_vector,
            collection,
            is_delete: false,
            filtered: false,
            kind: ItemKind::CounterGroup {
                document_etag: group.document_etag,
            },
            payload: Some(PayloadBuffer::new(group.counters)),
        }
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn item_type(&self) -> ItemType {
        match self.kind {
            ItemKind::Document | ItemKind::Tombstone { .. } => ItemType::Document,
            ItemKind::CounterGroup { .. } => ItemType::CounterGroup,
        }
    }

    /// Document body or counter values; `None` for tombstones and disposed items.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref().map(PayloadBuffer::data)
    }

    pub fn payload_size(&self) -> u64 {
        self.payload.as_ref().map_or(0, PayloadBuffer::size)
    }

    /// Current etag of the owning document, for counter groups.
    pub fn document_etag(&self) -> Option<u64> {
        match self.kind {
            ItemKind::CounterGroup { document_etag } => Some(document_etag),
            _ => None,
        }
    }

    pub fn is_id_generator(&self) -> bool {
        self.id.len() >= ID_GENERATOR_PREFIX.len()
            && self.id[..ID_GENERATOR_PREFIX.len()].eq_ignore_ascii_case(ID_GENERATOR_PREFIX)
    }

    /// Charge the payload buffer to `tracker`.
    pub fn track(&mut self, tracker: &Arc<AllocationTracker>) {
        if let Some(payload) = self.payload.as_mut() {
            payload.attach(tracker);
        }
    }

    /// Release owned buffers. Safe to call any number of times.
    pub fn dispose(&mut self) {
        self.payload.take();
    }

    pub fn is_disposed(&self) -> bool {
        self.payload.is_none()
    }
}

impl Drop for ExtractedItem {
    fn drop(&mut self) {
        self.dispose();
    }
}
