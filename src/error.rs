//! Contains the `Error` and `Result` types that `replicore` uses.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::{
    cluster::description::topology::TopologyDescription,
    options::ServerAddress,
    results::BulkWriteResult,
};

/// Server error codes that indicate a read may be retried against another member: the node
/// was shutting down, stepping down, or unreachable when the command arrived.
const RETRYABLE_READ_CODES: &[i32] = &[6, 7, 89, 91, 189, 9001, 10107, 11600, 11602, 13435, 13436];

/// Codes that additionally permit a write retry when a transaction number is attached.
const RETRYABLE_WRITE_CODES: &[i32] = &[
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436,
];

/// The label a server attaches to an error response to mark a write as safely retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// The label attached to errors that invalidate an entire transaction; the transaction may be
/// retried from the beginning.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// The result type for all methods that can return an error in the `replicore` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `replicore` crate.
///
/// When an operation fails after its retry budget is exhausted, the number of attempts made
/// and the address of the last server attempted are attached for diagnostics.
#[derive(Clone, Debug, ThisError)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: Vec<String>,

    /// How many attempts the failed operation made, if the error surfaced from the retry
    /// framework.
    pub attempts: Option<u32>,

    /// The last server an attempt ran against, if the error surfaced from the retry
    /// framework.
    pub server: Option<ServerAddress>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<Vec<String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels.unwrap_or_default(),
            attempts: None,
            server: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error was caused by the transport rather than by the server.
    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    /// Whether a read operation may be retried if this error occurs on its first attempt.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether a write operation carrying a transaction number may be retried if this error
    /// occurs on its first attempt.
    pub(crate) fn is_write_retryable(&self) -> bool {
        if self.is_network_error() || self.contains_label(RETRYABLE_WRITE_ERROR) {
            return true;
        }
        match self.code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Gets the error code from this error, if applicable. For bulk write errors, the code is
    /// taken from the write concern error, if there is one.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.code),
            ErrorKind::BulkWrite(ref failure) => {
                failure.write_concern_error.as_ref().map(|wce| wce.code)
            }
            _ => None,
        }
    }

    /// Returns the labels attached to this error.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Whether this error carries the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels
            .iter()
            .any(|actual| actual.as_str() == label.as_ref())
    }

    /// Returns a copy of this error with the specified label added.
    #[allow(dead_code)]
    pub(crate) fn with_label<T: AsRef<str>>(mut self, label: T) -> Self {
        let label = label.as_ref().to_string();
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
        self
    }

    /// Attaches the attempt count and last server attempted before the error propagates out
    /// of the retry framework.
    pub(crate) fn with_operation_context(
        mut self,
        attempts: u32,
        server: Option<ServerAddress>,
    ) -> Self {
        self.attempts = Some(attempts);
        self.server = server;
        self
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into(), None)
    }
}

impl std::ops::Deref for Error {
    type Target = ErrorKind;

    fn deref(&self) -> &Self::Target {
        &self.kind
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Wrapper around [`std::io::Error`]. The `Arc` allows errors to be cloned when a single
    /// failure has to surface from several layers.
    #[error("{0}")]
    Io(Arc<std::io::Error>),

    /// An invalid argument was provided to an operation.
    #[error("invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The server returned an error to an attempted operation.
    #[error("command failed: {0}")]
    Command(CommandError),

    /// One or more sub-requests of a bulk write failed.
    #[error("bulk write failed: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// No server matching the selection criteria became available before the selection
    /// deadline. The last observed topology is attached so callers can distinguish an
    /// unreachable cluster from one that merely lacks an eligible role.
    #[error("server selection timed out: {message}")]
    #[non_exhaustive]
    ServerSelection {
        message: String,
        topology: TopologyDescription,
    },

    /// An operation was attempted on a binding after it was closed.
    #[error("binding has already been disposed: {message}")]
    #[non_exhaustive]
    BindingDisposed { message: String },

    /// A retry was attempted for an operation containing a sub-request that is not eligible
    /// for retry. This indicates a logic bug in the caller or the driver, never a transient
    /// condition.
    #[error("operation is not eligible for retry: {message}")]
    #[non_exhaustive]
    NotRetryable { message: String },

    /// The server returned a reply the driver could not interpret.
    #[error("invalid server response: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// A session was used in a way its current state does not allow.
    #[error("session error: {message}")]
    #[non_exhaustive]
    Session { message: String },

    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for ErrorKind {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

/// An error returned by the server in response to a failed command.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}): {}", self.code_name, self.message)
    }
}

/// An error that occurred during a single write that wasn't due to being unable to satisfy a
/// write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code. The server omits this in some cases, hence
    /// `code_name` being an `Option`.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// The set of errors that occurred during a bulk write, keyed by the caller-visible index of
/// the sub-request each error corresponds to.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The per-request errors, under the indices the caller originally supplied (already
    /// remapped from any batch-local positions).
    pub write_errors: HashMap<usize, WriteError>,

    /// The error that occurred on account of write concern failure, if any.
    pub write_concern_error: Option<WriteConcernError>,

    /// The results of the sub-requests that did succeed before the failure.
    pub partial_result: Option<BulkWriteResult>,
}

impl BulkWriteFailure {
    pub(crate) fn merge(&mut self, other: BulkWriteFailure) {
        self.write_errors.extend(other.write_errors);
        if other.write_concern_error.is_some() {
            self.write_concern_error = other.write_concern_error;
        }
        if let Some(partial) = other.partial_result {
            match self.partial_result {
                Some(ref mut existing) => existing.merge(partial),
                None => self.partial_result = Some(partial),
            }
        }
    }
}
