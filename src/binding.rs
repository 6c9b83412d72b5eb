//! Contains the bindings that turn logical intent (a read preference, a session) into a
//! concrete channel source for one cluster member.

use crate::{
    channel::Channel,
    cluster::{Cluster, SelectedServer},
    error::{ErrorKind, Result},
    options::ServerAddress,
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::SessionHandle,
};

/// A binding that routes reads according to a selection criteria.
///
/// A binding owns its session for the duration of one logical operation chain. It must be
/// closed (explicitly or by drop) when the chain finishes; using it afterwards fails with
/// [`ErrorKind::BindingDisposed`].
pub struct ReadBinding {
    cluster: Cluster,
    criteria: SelectionCriteria,
    session: Option<SessionHandle>,
}

impl ReadBinding {
    /// Creates a binding for the given criteria and session.
    pub fn new(cluster: Cluster, criteria: SelectionCriteria, session: SessionHandle) -> Self {
        Self {
            cluster,
            criteria,
            session: Some(session),
        }
    }

    /// The session driving this binding.
    pub fn session(&self) -> Result<&SessionHandle> {
        self.session.as_ref().ok_or_else(|| {
            ErrorKind::BindingDisposed {
                message: "read binding".to_string(),
            }
            .into()
        })
    }

    /// Selects a server per this binding's criteria and wraps it, together with a fork of
    /// the session, as a channel source.
    pub async fn channel_source(&self, deprioritized: &[ServerAddress]) -> Result<ChannelSource> {
        let session = self.session()?;
        let server = self
            .cluster
            .select_server_and_pin_if_needed(session, &self.criteria, deprioritized)
            .await?;
        Ok(ChannelSource::new(server, session.fork()))
    }

    /// Closes this binding, releasing its session reference. Idempotent.
    pub fn close(&mut self) {
        if self.session.take().is_some() {
            tracing::trace!("read binding closed");
        }
    }

    /// Whether this binding has been closed.
    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }
}

impl Drop for ReadBinding {
    fn drop(&mut self) {
        self.close();
    }
}

/// A binding that routes writes to a server that can accept them (the primary of a replica
/// set, a router of a sharded deployment, or a standalone).
pub struct WriteBinding {
    cluster: Cluster,
    criteria: SelectionCriteria,
    session: Option<SessionHandle>,
}

impl WriteBinding {
    /// Creates a binding for the given session.
    pub fn new(cluster: Cluster, session: SessionHandle) -> Self {
        Self {
            cluster,
            criteria: SelectionCriteria::ReadPreference(ReadPreference::Primary),
            session: Some(session),
        }
    }

    /// The session driving this binding.
    pub fn session(&self) -> Result<&SessionHandle> {
        self.session.as_ref().ok_or_else(|| {
            ErrorKind::BindingDisposed {
                message: "write binding".to_string(),
            }
            .into()
        })
    }

    /// Selects a writable server and wraps it, together with a fork of the session, as a
    /// channel source.
    pub async fn channel_source(&self, deprioritized: &[ServerAddress]) -> Result<ChannelSource> {
        let session = self.session()?;
        let server = self
            .cluster
            .select_server_and_pin_if_needed(session, &self.criteria, deprioritized)
            .await?;
        Ok(ChannelSource::new(server, session.fork()))
    }

    /// Closes this binding, releasing its session reference. Idempotent.
    pub fn close(&mut self) {
        if self.session.take().is_some() {
            tracing::trace!("write binding closed");
        }
    }

    /// Whether this binding has been closed.
    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }
}

impl Drop for WriteBinding {
    fn drop(&mut self) {
        self.close();
    }
}

/// One selected server plus a fork of the driving session. Yields channels on demand and is
/// independently droppable without invalidating the binding it came from.
#[derive(Debug)]
pub struct ChannelSource {
    server: SelectedServer,
    session: SessionHandle,
}

impl ChannelSource {
    pub(crate) fn new(server: SelectedServer, session: SessionHandle) -> Self {
        Self { server, session }
    }

    /// The address of the selected server.
    pub fn address(&self) -> &ServerAddress {
        self.server.address()
    }

    /// The session fork attached to this source.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Opens a new channel to the selected server.
    pub fn channel(&self) -> Channel {
        self.server.channel()
    }
}
