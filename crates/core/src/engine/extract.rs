//! Etag-ordered extraction over several storage enumerations.

use std::iter::Peekable;

use crate::item::ExtractedItem;
use crate::storage::{ReadTransaction, StorageError};
use crate::task::CollectionFilter;

pub(crate) type ItemStream<'a> = Box<dyn Iterator<Item = Result<ExtractedItem, StorageError>> + 'a>;

/// K-way merge of etag-ordered streams into one etag-ordered stream.
///
/// A storage error from any source is surfaced as soon as it is peeked.
pub(crate) struct EtagOrdered<'a> {
    sources: Vec<Peekable<ItemStream<'a>>>,
}

impl<'a> EtagOrdered<'a> {
    pub(crate) fn new(sources: Vec<ItemStream<'a>>) -> Self {
        Self {
            sources: sources.into_iter().map(Iterator::peekable).collect(),
        }
    }
}

impl Iterator for EtagOrdered<'_> {
    type Item = Result<ExtractedItem, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut lowest: Option<(usize, u64)> = None;

        for (index, source) in self.sources.iter_mut().enumerate() {
            if matches!(source.peek(), Some(Err(_))) {
                return source.next();
            }
            if let Some(Ok(item)) = source.peek() {
                if lowest.map_or(true, |(_, etag)| item.etag < etag) {
                    lowest = Some((index, item.etag));
                }
            }
        }

        let (index, _) = lowest?;
        self.sources[index].next()
    }
}

/// Documents and their tombstones from `from_etag` on, for every collection
/// of `filter`. Attachment tombstones are only enumerated for all-collections
/// filters.
pub(crate) fn document_stream<'a>(
    tx: &'a dyn ReadTransaction,
    filter: &'a CollectionFilter,
    from_etag: u64,
    include_attachment_tombstones: bool,
) -> EtagOrdered<'a> {
    let mut sources: Vec<ItemStream<'a>> = Vec::new();

    match filter {
        CollectionFilter::All => {
            sources.push(Box::new(
                tx.documents_from(None, from_etag)
                    .map(|r| r.map(|doc| ExtractedItem::from_document(doc, None))),
            ));
            sources.push(Box::new(
                tx.tombstones_from(None, from_etag)
                    .map(|r| r.map(|t| ExtractedItem::from_tombstone(t, None))),
            ));
            if include_attachment_tombstones {
                sources.push(Box::new(
                    tx.attachment_tombstones_from(from_etag)
                        .map(|r| r.map(|t| ExtractedItem::from_tombstone(t, None))),
                ));
            }
        }
        CollectionFilter::Only(collections) => {
            for collection in collections {
                let name = collection.as_str();
                sources.push(Box::new(
                    tx.documents_from(Some(name), from_etag)
                        .map(move |r| r.map(|doc| ExtractedItem::from_document(doc, Some(name)))),
                ));
                sources.push(Box::new(
                    tx.tombstones_from(Some(name), from_etag)
                        .map(move |r| r.map(|t| ExtractedItem::from_tombstone(t, Some(name)))),
                ));
            }
        }
    }

    EtagOrdered::new(sources)
}

/// Counter groups from `from_etag` on, for every collection of `filter`.
pub(crate) fn counter_stream<'a>(
    tx: &'a dyn ReadTransaction,
    filter: &'a CollectionFilter,
    from_etag: u64,
) -> EtagOrdered<'a> {
    let sources: Vec<ItemStream<'a>> = match filter {
        CollectionFilter::All => vec![Box::new(
            tx.counter_groups_from(None, from_etag)
                .map(|r| r.map(|g| ExtractedItem::from_counter_group(g, None))),
        )],
        CollectionFilter::Only(collections) => collections
            .iter()
            .map(|collection| {
                let name = collection.as_str();
                Box::new(
                    tx.counter_groups_from(Some(name), from_etag)
                        .map(move |r| r.map(|g| ExtractedItem::from_counter_group(g, Some(name)))),
                ) as ItemStream<'a>
            })
            .collect(),
    };

    EtagOrdered::new(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::item::{ItemKind, RawDocument};
    use crate::testing::MockStorage;
    use crate::storage::DocumentStorage;

    fn items(stream: EtagOrdered<'_>) -> Vec<(u64, String, bool)> {
        stream
            .map(|r| r.unwrap())
            .map(|i| (i.etag, i.id.clone(), i.is_delete))
            .collect()
    }

    #[test]
    fn test_merge_orders_by_etag() {
        let storage = MockStorage::new("A", "dbA");
        storage.put_document("orders/1", "Orders", json!({}));
        storage.put_document("orders/2", "Orders", json!({}));
        storage.put_document("invoices/1", "Invoices", json!({}));
        storage.delete_document("orders/1");
        storage.put_document("orders/3", "Orders", json!({}));

        let tx = storage.begin_read().unwrap();
        let filter = CollectionFilter::only(["Orders", "Invoices"]);
        let got = items(document_stream(&*tx, &filter, 1, false));

        let etags: Vec<u64> = got.iter().map(|(e, _, _)| *e).collect();
        assert_eq!(etags, vec![2, 3, 4, 5]);
        assert_eq!(got[2], (4, "orders/1".to_string(), true));
    }

    #[test]
    fn test_explicit_collection_is_passed_through() {
        let storage = MockStorage::new("A", "dbA");
        storage.put_document("orders/1", "Orders", json!({}));

        let tx = storage.begin_read().unwrap();
        let filter = CollectionFilter::only(["orders"]);
        let item = document_stream(&*tx, &filter, 0, false).next().unwrap().unwrap();
        assert_eq!(item.collection.as_deref(), Some("orders"));
    }

    #[test]
    fn test_all_collections_includes_attachment_tombstones_on_request() {
        let storage = MockStorage::new("A", "dbA");
        storage.put_document("orders/1", "Orders", json!({}));
        storage.delete_attachment("orders/1", "Orders", "invoice.pdf");

        let tx = storage.begin_read().unwrap();
        let filter = CollectionFilter::All;
        assert_eq!(document_stream(&*tx, &filter, 0, false).count(), 1);

        let all: Vec<_> = document_stream(&*tx, &filter, 0, true)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].collection.as_deref(), Some("Orders"));
        assert!(matches!(all[1].kind(), ItemKind::Tombstone { .. }));
    }

    #[test]
    fn test_counter_stream_carries_document_etag() {
        let storage = MockStorage::new("A", "dbA");
        storage.put_document("orders/1", "Orders", json!({}));
        storage.put_counter("orders/1", "likes", 2);

        let tx = storage.begin_read().unwrap();
        let filter = CollectionFilter::only(["Orders"]);
        let counters: Vec<_> = counter_stream(&*tx, &filter, 0).map(|r| r.unwrap()).collect();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].etag, 2);
        assert_eq!(counters[0].document_etag(), Some(1));
        assert_eq!(counters[0].payload(), Some(&json!({"likes": 2})));
    }

    #[test]
    fn test_raw_documents_keep_their_change_vector() {
        let storage = MockStorage::new("A", "dbA");
        storage.put_raw_document(
            "Orders",
            RawDocument {
                id: "orders/9".to_string(),
                etag: 0,
                change_vector: "B:3-dbB".to_string(),
                data: json!({}),
            },
        );

        let tx = storage.begin_read().unwrap();
        let filter = CollectionFilter::All;
        let item = document_stream(&*tx, &filter, 0, false).next().unwrap().unwrap();
        assert_eq!(item.change_vector, "B:3-dbB");
        assert_eq!(item.etag, 1);
    }
}
