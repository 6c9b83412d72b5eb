//! Contains the types for client sessions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
};

/// The logical time of a cluster, gossiped between the driver and servers so that causally
/// related operations observe each other's effects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterTime {
    /// The cluster-wide logical timestamp.
    pub time: u64,
}

/// Whether a transaction is currently active on a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    InProgress,
}

#[derive(Debug, Default)]
struct SessionState {
    id: Uuid,
    txn_number: u64,
    pinned_server: Option<ServerAddress>,
    transaction: TransactionState,
    cluster_time: Option<ClusterTime>,
    dirty: bool,
}

/// The state shared by every fork of a session. Dropping the last handle releases any server
/// pin held by the session.
#[derive(Debug)]
struct SharedSession {
    state: Mutex<SessionState>,
}

impl Drop for SharedSession {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(ref address) = state.pinned_server {
            tracing::trace!(session_id = %state.id, server = %address, "releasing session pin");
        }
        state.pinned_server = None;
    }
}

/// A handle to a logical session.
///
/// Sessions allow retryable writes to carry a stable transaction number and allow
/// transactions to stay pinned to a single server. A session is forked (not cloned) so that a
/// channel source can hold a view of the session that outlives the binding it came from; all
/// forks share the same underlying state, which is released when the last fork drops.
///
/// Handles are `Send`, but a session is meant for sequential use by one logical operation
/// chain at a time.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    shared: Arc<SharedSession>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    /// Starts a new session.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedSession {
                state: Mutex::new(SessionState {
                    id: Uuid::new_v4(),
                    ..Default::default()
                }),
            }),
        }
    }

    /// Returns a new handle sharing this session's state. The state is released only when
    /// every handle has been dropped.
    pub fn fork(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    #[cfg(test)]
    pub(crate) fn reference_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The unique id of this session.
    pub fn id(&self) -> Uuid {
        self.lock().id
    }

    /// The server this session is pinned to, if any.
    pub fn pinned_server(&self) -> Option<ServerAddress> {
        self.lock().pinned_server.clone()
    }

    pub(crate) fn pin_server(&self, address: ServerAddress) {
        tracing::debug!(session_id = %self.id(), server = %address, "pinning session");
        self.lock().pinned_server = Some(address);
    }

    /// Whether a transaction is currently active on this session.
    pub fn in_transaction(&self) -> bool {
        self.lock().transaction == TransactionState::InProgress
    }

    /// Starts a transaction on this session.
    pub fn start_transaction(&self) -> Result<()> {
        let mut state = self.lock();
        if state.transaction == TransactionState::InProgress {
            return Err(ErrorKind::Session {
                message: "transaction already in progress".to_string(),
            }
            .into());
        }
        state.txn_number += 1;
        state.transaction = TransactionState::InProgress;
        Ok(())
    }

    /// Commits the transaction active on this session.
    pub fn commit_transaction(&self) -> Result<()> {
        self.end_transaction("no transaction started")
    }

    /// Aborts the transaction active on this session.
    pub fn abort_transaction(&self) -> Result<()> {
        self.end_transaction("no transaction to abort")
    }

    fn end_transaction(&self, no_txn_message: &str) -> Result<()> {
        let mut state = self.lock();
        if state.transaction != TransactionState::InProgress {
            return Err(ErrorKind::Session {
                message: no_txn_message.to_string(),
            }
            .into());
        }
        state.transaction = TransactionState::None;
        state.pinned_server = None;
        Ok(())
    }

    /// Allocates the transaction number used to make a retryable write idempotent. Both
    /// attempts of a retried write send the same number.
    pub(crate) fn next_txn_number(&self) -> u64 {
        let mut state = self.lock();
        state.txn_number += 1;
        state.txn_number
    }

    #[cfg(test)]
    pub(crate) fn txn_number(&self) -> u64 {
        self.lock().txn_number
    }

    /// The highest cluster time this session has observed.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.lock().cluster_time
    }

    /// Advances this session's cluster time. The time only moves forward.
    pub fn advance_cluster_time(&self, time: ClusterTime) {
        let mut state = self.lock();
        if state.cluster_time.map_or(true, |current| time > current) {
            state.cluster_time = Some(time);
        }
    }

    /// Marks this session dirty. Dirty sessions saw a network error and should not be reused
    /// for causally consistent reads.
    pub(crate) fn mark_dirty(&self) {
        self.lock().dirty = true;
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.lock().dirty
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forks_share_state() {
        let session = SessionHandle::new();
        let fork = session.fork();

        assert_eq!(session.id(), fork.id());
        assert_eq!(session.reference_count(), 2);

        let n = session.next_txn_number();
        assert_eq!(fork.txn_number(), n);
    }

    #[test]
    fn pin_survives_fork_drop() {
        let session = SessionHandle::new();
        session.pin_server(ServerAddress::new("a", None));

        let fork = session.fork();
        drop(fork);

        assert_eq!(session.pinned_server(), Some(ServerAddress::new("a", None)));
    }

    #[test]
    fn txn_numbers_are_monotonic() {
        let session = SessionHandle::new();
        let first = session.next_txn_number();
        let second = session.next_txn_number();
        assert!(second > first);
    }

    #[test]
    fn nested_transactions_are_rejected() {
        let session = SessionHandle::new();
        session.start_transaction().unwrap();
        assert!(session.start_transaction().is_err());
        session.commit_transaction().unwrap();
        assert!(session.commit_transaction().is_err());
    }

    #[test]
    fn aborting_unpins() {
        let session = SessionHandle::new();
        session.start_transaction().unwrap();
        session.pin_server(ServerAddress::new("a", None));
        session.abort_transaction().unwrap();
        assert!(session.pinned_server().is_none());
    }

    #[test]
    fn cluster_time_only_advances() {
        let session = SessionHandle::new();
        session.advance_cluster_time(ClusterTime { time: 5 });
        session.advance_cluster_time(ClusterTime { time: 3 });
        assert_eq!(session.cluster_time(), Some(ClusterTime { time: 5 }));
    }
}
