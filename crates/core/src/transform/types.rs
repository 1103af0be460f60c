use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::item::ItemType;
use crate::task::{CollectionFilter, DestinationKind};

/// Output of a transformation, handed to the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedItem {
    pub id: String,
    /// Etag of the extracted item this was produced from.
    pub etag: u64,
    pub collection: Option<String>,
    pub is_delete: bool,
    pub item_type: ItemType,
    pub payload: Option<Value>,
}

/// Everything that determines how a script compiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    pub transformation: String,
    pub script: String,
    pub collections: CollectionFilter,
    pub destination: DestinationKind,
}

impl ScriptSource {
    /// SHA-256 over every field, hex encoded.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.transformation.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.script.as_bytes());
        hasher.update([0u8]);
        match &self.collections {
            CollectionFilter::All => hasher.update(b"*"),
            CollectionFilter::Only(collections) => {
                for collection in collections {
                    hasher.update(collection.as_bytes());
                    hasher.update([0u8]);
                }
            }
        }
        hasher.update([0u8]);
        hasher.update(self.destination.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(script: &str) -> ScriptSource {
        ScriptSource {
            transformation: "orders".to_string(),
            script: script.to_string(),
            collections: CollectionFilter::only(["Orders"]),
            destination: DestinationKind::Relational,
        }
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let hash = source("load(this)").content_hash();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, source("load(this)").content_hash());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let base = source("load(this)");
        let mut other_destination = base.clone();
        other_destination.destination = DestinationKind::Peer;
        let mut all_collections = base.clone();
        all_collections.collections = CollectionFilter::All;

        assert_ne!(base.content_hash(), source("load(that)").content_hash());
        assert_ne!(base.content_hash(), other_destination.content_hash());
        assert_ne!(base.content_hash(), all_collections.content_hash());
    }
}
