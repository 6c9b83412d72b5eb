use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    binding::WriteBinding,
    channel::{Command, Response},
    cluster::Cluster,
    error::{BulkWriteFailure, Error, ErrorKind, Result, WriteError},
    executor::{execute_write, RetryableWriteContext},
    operation::{check_success, Operation, Retryability, WriteResponseBody},
    results::{BulkWriteResult, BulkWriteUpsert},
    session::SessionHandle,
};

const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 1000;

/// One sub-request of a bulk write.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteRequest {
    /// Insert a document.
    Insert {
        /// The document to insert.
        document: Value,
    },

    /// Update the documents matching a filter.
    Update {
        /// Selects the documents to update.
        filter: Value,

        /// The modifications to apply.
        update: Value,

        /// Whether every matching document is updated, rather than just the first.
        multi: bool,

        /// Whether a document is inserted when nothing matches the filter.
        upsert: bool,
    },

    /// Delete the documents matching a filter.
    Delete {
        /// Selects the documents to delete.
        filter: Value,

        /// The maximum number of documents to delete. `0` means all matching documents.
        limit: u32,
    },
}

impl WriteRequest {
    /// Whether re-executing this request after an ambiguous failure is safe. Multi-updates
    /// and delete-all requests are not: a retry could affect documents the first attempt
    /// never saw.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            WriteRequest::Insert { .. } => true,
            WriteRequest::Update { multi, .. } => !multi,
            WriteRequest::Delete { limit, .. } => *limit != 0,
        }
    }

    fn to_op_document(&self) -> Value {
        match self {
            WriteRequest::Insert { document } => json!({ "insert": document }),
            WriteRequest::Update {
                filter,
                update,
                multi,
                upsert,
            } => json!({
                "update": {
                    "filter": filter,
                    "update": update,
                    "multi": multi,
                    "upsert": upsert,
                }
            }),
            WriteRequest::Delete { filter, limit } => json!({
                "delete": {
                    "filter": filter,
                    "limit": limit,
                }
            }),
        }
    }
}

/// Maps the position of a sub-request within one wire command back to its position in the
/// caller's original request list. Total: every local index pushed at split time resolves to
/// exactly one original index.
#[derive(Clone, Debug, Default)]
pub(crate) struct IndexMap {
    entries: Vec<usize>,
}

impl IndexMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A map under which the first `len` indices map to themselves.
    pub(crate) fn identity(len: usize) -> Self {
        Self {
            entries: (0..len).collect(),
        }
    }

    /// Records the original index of the next local position.
    pub(crate) fn push(&mut self, original: usize) {
        self.entries.push(original);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolves a local index to the original one.
    pub(crate) fn map(&self, local: usize) -> Option<usize> {
        self.entries.get(local).copied()
    }

    pub(crate) fn is_identity(&self) -> bool {
        self.entries.iter().enumerate().all(|(i, &o)| i == o)
    }
}

/// A bulk write of heterogeneous sub-requests against one collection.
///
/// Requests are split into batches, each batch executes (and retries) independently, and the
/// per-batch results are stitched back together under the indices of the original request
/// list.
#[derive(Debug)]
pub struct BulkWrite {
    collection: String,
    requests: Vec<WriteRequest>,
    ordered: bool,
}

impl BulkWrite {
    /// Creates an ordered bulk write.
    pub fn new(collection: impl Into<String>, requests: Vec<WriteRequest>) -> Self {
        Self {
            collection: collection.into(),
            requests,
            ordered: true,
        }
    }

    /// Sets whether the sub-requests must execute in order. An ordered bulk write stops at
    /// the first failed batch; an unordered one runs every batch and aggregates the errors.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Executes this bulk write on the given cluster.
    pub async fn execute(
        mut self,
        cluster: &Cluster,
        session: &SessionHandle,
    ) -> Result<BulkWriteResult> {
        if self.requests.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "bulk write requires at least one request".to_string(),
            }
            .into());
        }

        let max_batch_size = cluster
            .options()
            .max_write_batch_size
            .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE);
        let retry_enabled = cluster.options().retry_writes.unwrap_or(true);

        let insert_ids = self.assign_insert_ids();
        let batches = self.split_into_batches(max_batch_size, &insert_ids);

        let mut result = BulkWriteResult::default();
        let mut failure = BulkWriteFailure::default();
        let mut error_labels: Option<Vec<String>> = None;

        for mut batch in batches {
            let binding = WriteBinding::new(cluster.clone(), session.fork());
            let mut context =
                RetryableWriteContext::new(binding, batch.retryability(), retry_enabled).await?;

            match execute_write(&mut batch, &mut context).await {
                Ok(batch_result) => result.merge(batch_result),
                Err(err) => {
                    let labels = err.labels().to_vec();
                    match *err.kind {
                        ErrorKind::BulkWrite(mut batch_failure) => {
                            if let Some(partial) = batch_failure.partial_result.take() {
                                result.merge(partial);
                            }
                            failure.merge(batch_failure);
                            if !labels.is_empty() {
                                error_labels = Some(labels);
                            }
                            if self.ordered {
                                break;
                            }
                        }
                        _ => return Err(err),
                    }
                }
            }
        }

        if !failure.write_errors.is_empty() || failure.write_concern_error.is_some() {
            failure.partial_result = Some(result);
            return Err(Error::new(ErrorKind::BulkWrite(failure), error_labels));
        }

        Ok(result)
    }

    /// Gives every insert document an `_id` up front so that a retried attempt reinserts the
    /// same document. Returns the id of each insert, keyed by original index.
    fn assign_insert_ids(&mut self) -> HashMap<usize, Value> {
        let mut ids = HashMap::new();
        for (index, request) in self.requests.iter_mut().enumerate() {
            if let WriteRequest::Insert { ref mut document } = request {
                if let Value::Object(ref mut map) = document {
                    let id = map
                        .entry("_id")
                        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
                    ids.insert(index, id.clone());
                }
            }
        }
        ids
    }

    fn split_into_batches(
        &self,
        max_batch_size: usize,
        insert_ids: &HashMap<usize, Value>,
    ) -> Vec<BatchedWrite> {
        self.requests
            .chunks(max_batch_size.max(1))
            .enumerate()
            .map(|(batch_number, chunk)| {
                let offset = batch_number * max_batch_size.max(1);
                let mut index_map = IndexMap::new();
                let mut batch_insert_ids = Vec::new();
                for (local, request) in chunk.iter().enumerate() {
                    let original = offset + local;
                    index_map.push(original);
                    if matches!(request, WriteRequest::Insert { .. }) {
                        if let Some(id) = insert_ids.get(&original) {
                            batch_insert_ids.push((local, id.clone()));
                        }
                    }
                }
                BatchedWrite {
                    collection: self.collection.clone(),
                    requests: chunk.to_vec(),
                    ordered: self.ordered,
                    index_map,
                    insert_ids: batch_insert_ids,
                }
            })
            .collect()
    }
}

/// One wire command's worth of a bulk write. Results and errors are remapped to original
/// indices before they leave this type.
#[derive(Debug)]
pub(crate) struct BatchedWrite {
    collection: String,
    requests: Vec<WriteRequest>,
    ordered: bool,
    index_map: IndexMap,
    insert_ids: Vec<(usize, Value)>,
}

impl BatchedWrite {
    fn map_index(&self, local: usize) -> Result<usize> {
        self.index_map.map(local).ok_or_else(|| {
            Error::invalid_response(format!(
                "server reported index {} but the batch only has {} requests",
                local,
                self.index_map.len()
            ))
        })
    }
}

impl Operation for BatchedWrite {
    type O = BulkWriteResult;

    const NAME: &'static str = "bulkWrite";

    fn build(&mut self) -> Result<Command> {
        let ops: Vec<Value> = self
            .requests
            .iter()
            .map(WriteRequest::to_op_document)
            .collect();
        let body = json!({
            Self::NAME: self.collection,
            "ordered": self.ordered,
            "ops": ops,
        });
        Ok(Command::new(Self::NAME, body))
    }

    fn handle_response(&self, response: Response) -> Result<Self::O> {
        check_success(&response)?;
        let body: WriteResponseBody = response.body_as()?;

        let mut result = BulkWriteResult {
            inserted_count: body.n_inserted,
            matched_count: body.n_matched,
            modified_count: body.n_modified,
            deleted_count: body.n_deleted,
            ..Default::default()
        };

        for upserted in &body.upserted {
            self.map_index(upserted.index)?;
            let upsert = BulkWriteUpsert::new(upserted.index, upserted.id.clone())
                .with_mapped_index(&self.index_map);
            result.upserts.push(upsert);
        }
        result.upserted_count = result.upserts.len() as u64;

        let mut write_errors = HashMap::new();
        let mut failed_locals = HashSet::new();
        if let Some(ref errors) = body.write_errors {
            for error in errors {
                failed_locals.insert(error.index);
                write_errors.insert(
                    self.map_index(error.index)?,
                    WriteError {
                        code: error.code,
                        code_name: error.code_name.clone(),
                        message: error.message.clone(),
                    },
                );
            }
        }

        // An ordered command stops at its first failure, so everything past the first failed
        // position never ran.
        let first_failure = failed_locals.iter().min().copied().unwrap_or(usize::MAX);
        for (local, id) in &self.insert_ids {
            let succeeded = if self.ordered {
                *local < first_failure
            } else {
                !failed_locals.contains(local)
            };
            if succeeded {
                result.inserted_ids.insert(self.map_index(*local)?, id.clone());
            }
        }

        if !write_errors.is_empty() || body.write_concern_error.is_some() {
            return Err(Error::new(
                ErrorKind::BulkWrite(BulkWriteFailure {
                    write_errors,
                    write_concern_error: body.write_concern_error,
                    partial_result: Some(result),
                }),
                body.error_labels,
            ));
        }

        Ok(result)
    }

    fn retryability(&self) -> Retryability {
        if self.requests.iter().all(WriteRequest::is_retryable) {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}
