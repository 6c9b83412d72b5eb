//! Contains the `Operation` trait and the concrete operations that implement it.

pub(crate) mod bulk_write;
mod find;

use serde::Deserialize;
use serde_json::Value;

use crate::{
    channel::{Command, Response},
    error::{CommandError, Error, ErrorKind, Result, WriteConcernError},
    selection_criteria::SelectionCriteria,
};

pub use self::{
    bulk_write::{BulkWrite, WriteRequest},
    find::Find,
};

/// A single command that can be run against the cluster through the retry framework.
///
/// Implementors translate themselves to a wire command, interpret the reply, and declare how
/// they may be retried.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the command this operation issues.
    const NAME: &'static str;

    /// Returns the command that should be sent for this operation.
    fn build(&mut self) -> Result<Command>;

    /// Interprets the server's reply to the command.
    fn handle_response(&self, response: Response) -> Result<Self::O>;

    /// The selection criteria for this operation, if it cares which server runs it.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether and how this operation may be retried.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Hook invoked before the retry attempt is built.
    fn update_for_retry(&mut self) {}

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// The retry behavior an operation supports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Retryability {
    /// The operation is an idempotent write when tagged with a transaction number.
    Write,

    /// The operation is a read and can always be re-run.
    Read,

    /// The operation must not be retried.
    None,
}

/// The shape of a failed command reply.
#[derive(Debug, Deserialize)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(body: CommandErrorBody) -> Self {
        Error::new(
            ErrorKind::Command(body.command_error),
            body.error_labels,
        )
    }
}

/// Returns an error if the server reported the command as failed.
pub(crate) fn check_success(response: &Response) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    let body: CommandErrorBody = response.body_as()?;
    Err(body.into())
}

/// The shape of a successful write command reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WriteResponseBody {
    #[serde(default)]
    pub(crate) n_inserted: u64,

    #[serde(default)]
    pub(crate) n_matched: u64,

    #[serde(default)]
    pub(crate) n_modified: u64,

    #[serde(default)]
    pub(crate) n_deleted: u64,

    #[serde(default)]
    pub(crate) upserted: Vec<UpsertedId>,

    pub(crate) write_errors: Option<Vec<IndexedWriteError>>,

    pub(crate) write_concern_error: Option<WriteConcernError>,

    pub(crate) error_labels: Option<Vec<String>>,
}

/// The id the server assigned to an upserted document, under the index of the sub-request
/// within the command that produced it.
#[derive(Debug, Deserialize)]
pub(crate) struct UpsertedId {
    pub(crate) index: usize,

    #[serde(rename = "_id")]
    pub(crate) id: Value,
}

/// A write error under the index of the failed sub-request within the command.
#[derive(Debug, Deserialize)]
pub(crate) struct IndexedWriteError {
    pub(crate) index: usize,

    pub(crate) code: i32,

    #[serde(rename = "codeName", default)]
    pub(crate) code_name: Option<String>,

    #[serde(rename = "errmsg", default)]
    pub(crate) message: String,
}
