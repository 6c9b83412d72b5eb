//! Contains the cluster state machine: the topology snapshot, the worker that maintains it,
//! and server selection.

pub(crate) mod description;
mod server;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    channel::{Channel, CommandRunner},
    error::{Error, ErrorKind, Result},
    options::{ClusterOptions, ServerAddress},
    selection_criteria::SelectionCriteria,
    session::SessionHandle,
};

pub use self::description::{ServerDescription, ServerType, TopologyDescription, TopologyType};
pub(crate) use self::server::Server;

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The full shared state of the cluster: the immutable description snapshot plus the live
/// server handles it refers to.
#[derive(Clone, Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// A message paired with a one-shot acknowledgement so the sender can observe that the
/// worker has applied it.
struct AcknowledgedMessage<M> {
    message: M,
    acknowledger: oneshot::Sender<bool>,
}

impl<M> AcknowledgedMessage<M> {
    fn package(message: M) -> (Self, AcknowledgmentReceiver) {
        let (acknowledger, receiver) = oneshot::channel();
        (
            Self {
                message,
                acknowledger,
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    fn into_parts(self) -> (M, oneshot::Sender<bool>) {
        (self.message, self.acknowledger)
    }
}

struct AcknowledgmentReceiver {
    receiver: oneshot::Receiver<bool>,
}

impl AcknowledgmentReceiver {
    /// Waits until the message is acknowledged. Returns false if the worker went away before
    /// applying it.
    async fn wait(self) -> bool {
        self.receiver.await.unwrap_or(false)
    }
}

enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    SyncHosts(Vec<ServerAddress>),
    MonitorError {
        address: ServerAddress,
        message: String,
    },
    Shutdown,
}

/// The write half of the topology: monitoring pushes what it observed about servers here,
/// and the worker folds each update into a fresh snapshot.
#[derive(Clone)]
pub struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedMessage<UpdateMessage>>,
}

impl TopologyUpdater {
    /// Applies a new description for one server. Returns whether the topology snapshot
    /// changed as a result; the update is guaranteed to have been applied (or rejected as a
    /// no-op) by the time this returns.
    pub async fn apply_update(&self, update: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(update)))
            .await
    }

    /// Replaces the set of hosts the cluster knows about.
    pub async fn sync_hosts(&self, hosts: Vec<ServerAddress>) -> bool {
        self.send_message(UpdateMessage::SyncHosts(hosts)).await
    }

    /// Records a monitoring failure for a server, marking it unknown.
    pub async fn handle_monitor_error(&self, address: ServerAddress, message: String) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, message })
            .await
    }

    async fn shutdown(&self) -> bool {
        self.send_message(UpdateMessage::Shutdown).await
    }

    async fn send_message(&self, message: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(message);
        if self.sender.send(message).is_err() {
            return false;
        }
        receiver.wait().await
    }
}

/// The read half of the topology. Cloning is cheap; each clone observes snapshots
/// independently.
#[derive(Clone)]
struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the worker maintaining the topology is still running.
    fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    fn peek_latest(&self) -> TopologyState {
        self.receiver.borrow().clone()
    }

    /// Waits for a snapshot newer than the last observed one, up to the given timeout.
    /// Returns whether a new snapshot arrived.
    async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

struct TopologyBroadcaster {
    sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.sender.borrow().clone()
    }

    fn publish(&self, state: TopologyState) {
        let _ = self.sender.send(state);
    }
}

/// The task that owns topology mutation. Updates arrive over a queue, are folded into a
/// clone of the current state, and the result is published atomically; selectors only ever
/// see complete snapshots.
struct TopologyWorker {
    update_receiver: mpsc::UnboundedReceiver<AcknowledgedMessage<UpdateMessage>>,
    broadcaster: TopologyBroadcaster,
    runner: Arc<dyn CommandRunner>,
}

impl TopologyWorker {
    fn start(mut self) {
        tokio::spawn(async move {
            while let Some(message) = self.update_receiver.recv().await {
                let (message, acknowledger) = message.into_parts();
                let changed = match message {
                    UpdateMessage::ServerUpdate(description) => self.update_server(*description),
                    UpdateMessage::SyncHosts(hosts) => {
                        let mut state = self.broadcaster.clone_latest();
                        state.description.sync_hosts(&hosts);
                        self.reconcile_servers(&mut state);
                        self.broadcaster.publish(state);
                        true
                    }
                    UpdateMessage::MonitorError { address, message } => {
                        tracing::debug!(server = %address, error = %message, "marking server unknown");
                        let description = ServerDescription {
                            error: Some(message),
                            ..ServerDescription::new(address)
                        };
                        self.update_server(description)
                    }
                    UpdateMessage::Shutdown => {
                        let _ = acknowledger.send(true);
                        break;
                    }
                };
                let _ = acknowledger.send(changed);
            }
            tracing::debug!("topology worker stopped");
        });
    }

    fn update_server(&self, description: ServerDescription) -> bool {
        let mut state = self.broadcaster.clone_latest();
        let changed = state.description.update(description);
        if changed {
            self.reconcile_servers(&mut state);
            self.broadcaster.publish(state);
        }
        changed
    }

    /// Keeps the live server handles in step with the description: new addresses get
    /// handles, removed addresses lose them. Existing handles (and their operation counts)
    /// are preserved.
    fn reconcile_servers(&self, state: &mut TopologyState) {
        let known = &state.description.servers;
        state.servers.retain(|address, _| known.contains_key(address));
        for address in known.keys() {
            if !state.servers.contains_key(address) {
                state.servers.insert(
                    address.clone(),
                    Server::new(address.clone(), Arc::clone(&self.runner)),
                );
            }
        }
    }
}

/// A handle to the cluster state. Cheap to clone; all clones share the same topology.
#[derive(Clone)]
pub struct Cluster {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    options: ClusterOptions,
}

impl Cluster {
    /// Creates a cluster from the given options and starts its topology worker. Monitoring
    /// pushes updates through [`Cluster::updater`].
    pub fn new(options: ClusterOptions, runner: Arc<dyn CommandRunner>) -> Self {
        let description = TopologyDescription::new(&options);
        let servers = options
            .hosts
            .iter()
            .map(|address| {
                (
                    address.clone(),
                    Server::new(address.clone(), Arc::clone(&runner)),
                )
            })
            .collect();

        let (watch_sender, watch_receiver) = watch::channel(TopologyState {
            description,
            servers,
        });
        let (update_sender, update_receiver) = mpsc::unbounded_channel();

        TopologyWorker {
            update_receiver,
            broadcaster: TopologyBroadcaster {
                sender: watch_sender,
            },
            runner,
        }
        .start();

        Self {
            watcher: TopologyWatcher {
                receiver: watch_receiver,
            },
            updater: TopologyUpdater {
                sender: update_sender,
            },
            options,
        }
    }

    /// The handle monitoring uses to push topology updates.
    pub fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// The current topology snapshot.
    pub fn description(&self) -> TopologyDescription {
        self.watcher.peek_latest().description
    }

    pub(crate) fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Stops the topology worker. Selections in flight fail once the worker is gone.
    pub async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    /// Selects a server matching the given criteria, waiting for topology updates until one
    /// becomes suitable or the selection timeout elapses.
    ///
    /// Servers in `deprioritized` are avoided unless they are the only candidates.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        deprioritized: &[ServerAddress],
    ) -> Result<SelectedServer> {
        let timeout = self
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let start = Instant::now();
        let mut watcher = self.watcher.clone();

        loop {
            let state = watcher.observe_latest();

            if let Some(server) = attempt_to_select_server(criteria, deprioritized, &state)? {
                tracing::debug!(server = %server.address(), %criteria, "selected server");
                return Ok(server);
            }

            let updated = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) => watcher.wait_for_update(remaining).await,
                None => false,
            };

            if !updated {
                if !watcher.is_alive() {
                    return Err(Error::internal("cluster has been shut down"));
                }
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                    topology: state.description,
                }
                .into());
            }
        }
    }

    /// Like [`Cluster::select_server`], but honors and establishes session pins: a pinned
    /// session always gets its pinned server back, and a session inside a transaction on a
    /// sharded topology is pinned to whatever server gets selected.
    pub(crate) async fn select_server_and_pin_if_needed(
        &self,
        session: &SessionHandle,
        criteria: &SelectionCriteria,
        deprioritized: &[ServerAddress],
    ) -> Result<SelectedServer> {
        if let Some(address) = session.pinned_server() {
            let pinned = SelectionCriteria::from_address(address);
            return self.select_server(&pinned, &[]).await;
        }

        let server = self.select_server(criteria, deprioritized).await?;

        if session.in_transaction()
            && self.watcher.peek_latest().description.topology_type == TopologyType::Sharded
        {
            session.pin_server(server.address().clone());
        }

        Ok(server)
    }
}

fn attempt_to_select_server(
    criteria: &SelectionCriteria,
    deprioritized: &[ServerAddress],
    state: &TopologyState,
) -> Result<Option<SelectedServer>> {
    let in_window = state
        .description
        .suitable_servers_in_latency_window(criteria)?;

    let preferred: Vec<_> = in_window
        .iter()
        .filter(|description| !deprioritized.contains(&description.address))
        .copied()
        .collect();
    // A deprioritized server is still better than none.
    let candidates = if preferred.is_empty() {
        in_window
    } else {
        preferred
    };

    let in_window_servers: Vec<_> = candidates
        .into_iter()
        .filter_map(|description| state.servers.get(&description.address))
        .collect();

    Ok(select_server_in_latency_window(&in_window_servers).map(SelectedServer::new))
}

/// Breaks ties among equally suitable servers: two candidates are picked at random and the
/// one with fewer operations in flight wins.
fn select_server_in_latency_window(in_window: &[&Arc<Server>]) -> Option<Arc<Server>> {
    if in_window.is_empty() {
        return None;
    }
    if in_window.len() == 1 {
        return Some(Arc::clone(in_window[0]));
    }

    let mut rng = rand::rng();
    in_window
        .choose_multiple(&mut rng, 2)
        .min_by_key(|server| server.operation_count())
        .map(|server| Arc::clone(server))
}

/// A server handle checked out for one operation. Holding it counts toward the server's
/// in-flight operation count; dropping it releases the count.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server.address
    }

    pub(crate) fn channel(&self) -> Channel {
        self.server.channel()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

#[cfg(test)]
mod test {
    use futures_util::future::BoxFuture;
    use serde_json::json;

    use super::*;
    use crate::{
        channel::{Command, Response},
        selection_criteria::ReadPreference,
    };

    struct NoopRunner;

    impl CommandRunner for NoopRunner {
        fn run_command<'a>(
            &'a self,
            _channel: &'a Channel,
            _command: Command,
        ) -> BoxFuture<'a, Result<Response>> {
            Box::pin(async { Ok(Response::new(json!({ "ok": 1 }))) })
        }
    }

    fn address(host: &str) -> ServerAddress {
        ServerAddress::new(host, None)
    }

    fn available(host: &str, server_type: ServerType) -> ServerDescription {
        ServerDescription {
            server_type,
            average_round_trip_time: Some(Duration::from_millis(10)),
            ..ServerDescription::new(address(host))
        }
    }

    fn cluster_with_hosts(hosts: &[&str], timeout: Duration) -> Cluster {
        let options = ClusterOptions::builder()
            .hosts(hosts.iter().map(|h| address(h)).collect::<Vec<_>>())
            .server_selection_timeout(timeout)
            .build();
        Cluster::new(options, Arc::new(NoopRunner))
    }

    #[tokio::test]
    async fn selection_wakes_up_on_topology_update() {
        let cluster = cluster_with_hosts(&["a"], Duration::from_secs(5));
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);

        let selector = {
            let cluster = cluster.clone();
            let criteria = criteria.clone();
            tokio::spawn(async move { cluster.select_server(&criteria, &[]).await })
        };

        assert!(
            cluster
                .updater()
                .apply_update(available("a", ServerType::Standalone))
                .await
        );

        let selected = selector.await.unwrap().unwrap();
        assert_eq!(selected.address(), &address("a"));
    }

    #[tokio::test]
    async fn selection_times_out_with_topology_attached() {
        let cluster = cluster_with_hosts(&["a"], Duration::from_millis(20));
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);

        let err = cluster.select_server(&criteria, &[]).await.unwrap_err();
        match *err.kind {
            ErrorKind::ServerSelection { ref topology, .. } => {
                assert!(topology.servers.contains_key(&address("a")));
            }
            ref other => panic!("expected server selection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pinned_session_bypasses_selection() {
        let cluster = cluster_with_hosts(&["a", "b"], Duration::from_secs(5));
        let updater = cluster.updater();
        updater.apply_update(available("a", ServerType::Router)).await;
        updater.apply_update(available("b", ServerType::Router)).await;

        let session = SessionHandle::new();
        session.pin_server(address("b"));

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        // Even with the pinned server deprioritized, the pin wins.
        let selected = cluster
            .select_server_and_pin_if_needed(&session, &criteria, &[address("b")])
            .await
            .unwrap();
        assert_eq!(selected.address(), &address("b"));
    }

    #[tokio::test]
    async fn sharded_transaction_pins_on_selection() {
        let cluster = cluster_with_hosts(&["a"], Duration::from_secs(5));
        cluster
            .updater()
            .apply_update(available("a", ServerType::Router))
            .await;

        let session = SessionHandle::new();
        session.start_transaction().unwrap();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let selected = cluster
            .select_server_and_pin_if_needed(&session, &criteria, &[])
            .await
            .unwrap();
        assert_eq!(session.pinned_server().as_ref(), Some(selected.address()));
    }

    #[tokio::test]
    async fn deprioritized_only_candidate_is_still_selected() {
        let cluster = cluster_with_hosts(&["a"], Duration::from_secs(5));
        cluster
            .updater()
            .apply_update(available("a", ServerType::Standalone))
            .await;

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let selected = cluster
            .select_server(&criteria, &[address("a")])
            .await
            .unwrap();
        assert_eq!(selected.address(), &address("a"));
    }

    #[tokio::test]
    async fn tie_break_prefers_less_loaded_server() {
        let cluster = cluster_with_hosts(&["a", "b"], Duration::from_secs(5));
        let updater = cluster.updater();
        updater.apply_update(available("a", ServerType::Router)).await;
        updater.apply_update(available("b", ServerType::Router)).await;

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);

        // Load up "a" and verify subsequent selections go to "b".
        let busy = cluster.select_server(&criteria, &[address("b")]).await.unwrap();
        assert_eq!(busy.address(), &address("a"));

        for _ in 0..16 {
            let selected = cluster.select_server(&criteria, &[]).await.unwrap();
            assert_eq!(selected.address(), &address("b"));
        }
    }

    #[tokio::test]
    async fn selection_fails_after_shutdown() {
        let cluster = cluster_with_hosts(&["a"], Duration::from_secs(5));
        cluster.shutdown().await;

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let err = cluster.select_server(&criteria, &[]).await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::Internal { .. }));
    }
}
