//! Contains the types of results returned by operations.

use std::collections::HashMap;

use serde_json::Value;

use crate::operation::bulk_write::IndexMap;

/// The caller-visible outcome of a bulk write. Indices always refer to the position of the
/// sub-request in the original request list, regardless of how the requests were batched or
/// retried on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// Number of documents inserted.
    pub inserted_count: u64,

    /// Number of documents matched by update sub-requests.
    pub matched_count: u64,

    /// Number of documents modified by update sub-requests.
    pub modified_count: u64,

    /// Number of documents deleted.
    pub deleted_count: u64,

    /// Number of documents upserted.
    pub upserted_count: u64,

    /// The ids of inserted documents, keyed by the original index of the insert sub-request.
    pub inserted_ids: HashMap<usize, Value>,

    /// The upserts performed, under original indices.
    pub upserts: Vec<BulkWriteUpsert>,
}

impl BulkWriteResult {
    /// Folds the result of one batch into this result. Upserts re-reported by a retried
    /// attempt are deduplicated by equality.
    pub(crate) fn merge(&mut self, other: BulkWriteResult) {
        self.inserted_count += other.inserted_count;
        self.matched_count += other.matched_count;
        self.modified_count += other.modified_count;
        self.deleted_count += other.deleted_count;
        self.inserted_ids.extend(other.inserted_ids);

        for upsert in other.upserts {
            if !self.upserts.contains(&upsert) {
                self.upserts.push(upsert);
            }
        }
        self.upserted_count = self.upserts.len() as u64;
    }
}

/// One document upserted by a bulk write.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct BulkWriteUpsert {
    /// The original index of the update sub-request that caused the upsert.
    pub index: usize,

    /// The id of the upserted document.
    pub id: Value,
}

impl BulkWriteUpsert {
    pub(crate) fn new(index: usize, id: Value) -> Self {
        Self { index, id }
    }

    /// Remaps this upsert's batch-local index to the original one. Returns the value
    /// unchanged when the map leaves the index fixed, so equality-based deduplication keeps
    /// working across retried attempts.
    pub(crate) fn with_mapped_index(self, index_map: &IndexMap) -> Self {
        match index_map.map(self.index) {
            Some(original) if original != self.index => Self {
                index: original,
                id: self.id,
            },
            _ => self,
        }
    }
}
