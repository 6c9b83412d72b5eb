use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    channel::{Channel, CommandRunner},
    options::ServerAddress,
};

/// The driver-side handle for a single cluster member. Tracks the number of operations
/// currently running against the server, which the selector uses to break ties.
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,

    /// Source of ids for channels to this server.
    channel_counter: AtomicU32,

    runner: Arc<dyn CommandRunner>,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, runner: Arc<dyn CommandRunner>) -> Arc<Self> {
        Arc::new(Self {
            address,
            operation_count: AtomicU32::new(0),
            channel_counter: AtomicU32::new(0),
            runner,
        })
    }

    /// Opens a new channel to this server.
    pub(crate) fn channel(&self) -> Channel {
        let id = self.channel_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Channel::new(self.address.clone(), id, Arc::clone(&self.runner))
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("operation_count", &self.operation_count())
            .finish()
    }
}
