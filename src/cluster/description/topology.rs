use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    time::{Duration, Instant},
};

use crate::{
    cluster::description::server::{ServerDescription, ServerType},
    error::Result,
    options::{ClusterOptions, ServerAddress},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The overall shape of the cluster, derived from the roles of its members.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single standalone server.
    Single,

    /// A sharded deployment reached through one or more routers.
    Sharded,

    /// A replica set with a reachable primary.
    ReplicaSetWithPrimary,

    /// A replica set whose primary is currently unknown.
    ReplicaSetNoPrimary,

    /// Nothing is known about the cluster yet.
    #[default]
    Unknown,
}

impl Display for TopologyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyType::Single => "Single",
            TopologyType::Sharded => "Sharded",
            TopologyType::ReplicaSetWithPrimary => "ReplicaSetWithPrimary",
            TopologyType::ReplicaSetNoPrimary => "ReplicaSetNoPrimary",
            TopologyType::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// An immutable snapshot of everything the driver knows about the cluster. Server selection
/// is a pure function over one of these snapshots; the snapshot is never mutated in place,
/// only replaced wholesale by the topology worker.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    /// The current shape of the cluster.
    pub topology_type: TopologyType,

    /// What is known about each member, keyed by address.
    pub servers: HashMap<ServerAddress, ServerDescription>,

    local_threshold: Option<Duration>,
    heartbeat_frequency: Option<Duration>,
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClusterOptions) -> Self {
        let servers = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address.clone())))
            .collect();

        Self {
            topology_type: TopologyType::Unknown,
            servers,
            local_threshold: options.local_threshold,
            heartbeat_frequency: options.heartbeat_frequency,
        }
    }

    /// Applies a new description for one server. Returns whether the snapshot changed.
    pub(crate) fn update(&mut self, description: ServerDescription) -> bool {
        match self.servers.get(&description.address) {
            Some(existing) if existing == &description => false,
            _ => {
                self.servers
                    .insert(description.address.clone(), description);
                self.topology_type = self.recompute_topology_type();
                true
            }
        }
    }

    /// Replaces the set of known hosts, adding unknown descriptions for new ones and
    /// forgetting servers no longer in the list.
    pub(crate) fn sync_hosts(&mut self, hosts: &[ServerAddress]) {
        self.servers.retain(|address, _| hosts.contains(address));
        for address in hosts {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(address.clone()));
        }
        self.topology_type = self.recompute_topology_type();
    }

    fn recompute_topology_type(&self) -> TopologyType {
        let mut has_primary = false;
        let mut has_secondary = false;
        let mut has_router = false;
        let mut has_standalone = false;

        for server in self.servers.values() {
            match server.server_type {
                ServerType::ReplicaPrimary => has_primary = true,
                ServerType::ReplicaSecondary => has_secondary = true,
                ServerType::Router => has_router = true,
                ServerType::Standalone => has_standalone = true,
                ServerType::Unknown => {}
            }
        }

        if has_router {
            TopologyType::Sharded
        } else if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else if has_secondary {
            TopologyType::ReplicaSetNoPrimary
        } else if has_standalone {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        }
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_frequency
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    fn local_threshold(&self) -> Duration {
        self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD)
    }

    /// Whether any server in the snapshot could serve any operation at all.
    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "none of the available servers suitable for criteria {}, topology: {}",
                criteria, self
            )
        } else {
            format!(
                "no servers available for criteria {}, topology: {}",
                criteria, self
            )
        }
    }

    /// The servers suitable for the given criteria that also fall within the latency window.
    /// Pure with respect to the snapshot.
    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&ServerDescription>> {
        let mut suitable = self.suitable_servers(criteria)?;
        self.retain_servers_within_latency_window(&mut suitable);
        Ok(suitable)
    }

    fn suitable_servers(&self, criteria: &SelectionCriteria) -> Result<Vec<&ServerDescription>> {
        let candidates = match (self.topology_type, criteria) {
            (TopologyType::Unknown, _) => Vec::new(),
            (TopologyType::Single, _) | (TopologyType::Sharded, _) => self
                .servers
                .values()
                .filter(|server| server.server_type.is_data_bearing())
                .collect(),
            (_, SelectionCriteria::ReadPreference(ref read_pref)) => {
                self.suitable_servers_for_read_preference(read_pref)
            }
            (_, SelectionCriteria::Predicate(ref filter)) => self
                .servers
                .values()
                .filter(|server| server.is_available() && filter(server))
                .collect(),
        };

        Ok(candidates)
    }

    fn suitable_servers_for_read_preference(
        &self,
        read_pref: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        match read_pref {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::ReplicaPrimary]),
            ReadPreference::Secondary { ref options } => self.eligible_servers(
                &[ServerType::ReplicaSecondary],
                options.max_staleness,
                options.tag_sets.as_deref(),
            ),
            ReadPreference::PrimaryPreferred { ref options } => {
                let primaries = self.servers_with_type(&[ServerType::ReplicaPrimary]);
                if !primaries.is_empty() {
                    primaries
                } else {
                    self.eligible_servers(
                        &[ServerType::ReplicaSecondary],
                        options.max_staleness,
                        options.tag_sets.as_deref(),
                    )
                }
            }
            ReadPreference::SecondaryPreferred { ref options } => {
                let secondaries = self.eligible_servers(
                    &[ServerType::ReplicaSecondary],
                    options.max_staleness,
                    options.tag_sets.as_deref(),
                );
                if !secondaries.is_empty() {
                    secondaries
                } else {
                    self.servers_with_type(&[ServerType::ReplicaPrimary])
                }
            }
            ReadPreference::Nearest { ref options } => self.eligible_servers(
                &[ServerType::ReplicaPrimary, ServerType::ReplicaSecondary],
                options.max_staleness,
                options.tag_sets.as_deref(),
            ),
        }
    }

    fn eligible_servers(
        &self,
        types: &[ServerType],
        max_staleness: Option<Duration>,
        tag_sets: Option<&[TagSet]>,
    ) -> Vec<&ServerDescription> {
        let mut eligible = self.servers_with_type(types);
        if let Some(max_staleness) = max_staleness {
            self.filter_servers_by_max_staleness(&mut eligible, max_staleness);
        }
        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut eligible, tag_sets);
        }
        eligible
    }

    fn servers_with_type(&self, types: &[ServerType]) -> Vec<&ServerDescription> {
        self.servers
            .values()
            .filter(|server| types.contains(&server.server_type))
            .collect()
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = max_staleness.as_millis() as i128;
        let heartbeat_ms = self.heartbeat_frequency().as_millis() as i128;

        let primary = self
            .servers
            .values()
            .find(|server| server.server_type == ServerType::ReplicaPrimary);

        match primary {
            Some(primary) => {
                let primary_lag = lag_millis(primary);
                servers.retain(|server| {
                    server.server_type != ServerType::ReplicaSecondary
                        || lag_millis(server) - primary_lag + heartbeat_ms <= max_staleness_ms
                });
            }
            None => {
                // Without a primary, staleness is measured against the most up to date
                // secondary.
                let max_write = self
                    .servers
                    .values()
                    .filter(|server| server.server_type == ServerType::ReplicaSecondary)
                    .filter_map(|server| server.last_write_date)
                    .max();

                if let Some(max_write) = max_write {
                    servers.retain(|server| {
                        server.server_type != ServerType::ReplicaSecondary
                            || write_lag_millis(server, max_write) + heartbeat_ms
                                <= max_staleness_ms
                    });
                }
            }
        }
    }

    fn retain_servers_within_latency_window(&self, suitable: &mut Vec<&ServerDescription>) {
        let shortest_rtt = suitable
            .iter()
            .filter_map(|server| server.average_round_trip_time)
            .min();

        if let Some(shortest_rtt) = shortest_rtt {
            let window = shortest_rtt + self.local_threshold();
            suitable.retain(|server| {
                server
                    .average_round_trip_time
                    .map_or(false, |rtt| rtt <= window)
            });
        }
    }
}

/// How far behind its own last heartbeat a server's last write is, in milliseconds.
fn lag_millis(server: &ServerDescription) -> i128 {
    match (server.last_update_time, server.last_write_date) {
        (Some(update), Some(write)) => update.saturating_duration_since(write).as_millis() as i128,
        _ => 0,
    }
}

fn write_lag_millis(server: &ServerDescription, max_write: Instant) -> i128 {
    match server.last_write_date {
        Some(write) => max_write.saturating_duration_since(write).as_millis() as i128,
        None => 0,
    }
}

/// Retains the servers matching the first tag set that matches anything. An empty tag set
/// matches every tagged server, so a list ending in `{}` never filters everything out.
fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches: Vec<_> = servers
            .iter()
            .filter(|server| server.matches_tag_set(tag_set))
            .copied()
            .collect();

        if !matches.is_empty() {
            *servers = matches;
            return;
        }
    }

    servers.clear();
}

impl Display for TopologyDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{ type: {}, servers: [", self.topology_type)?;
        for (i, server) in self.servers.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", server)?;
        }
        write!(f, "] }}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn address(host: &str) -> ServerAddress {
        ServerAddress::new(host, None)
    }

    fn server(host: &str, server_type: ServerType) -> ServerDescription {
        ServerDescription {
            server_type,
            average_round_trip_time: Some(Duration::from_millis(10)),
            ..ServerDescription::new(address(host))
        }
    }

    fn tagged(host: &str, server_type: ServerType, pairs: &[(&str, &str)]) -> ServerDescription {
        ServerDescription {
            tags: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..server(host, server_type)
        }
    }

    fn replica_set() -> TopologyDescription {
        let options = ClusterOptions::builder()
            .hosts(vec![address("a"), address("b"), address("c")])
            .build();
        let mut description = TopologyDescription::new(&options);
        description.update(server("a", ServerType::ReplicaPrimary));
        description.update(server("b", ServerType::ReplicaSecondary));
        description.update(server("c", ServerType::ReplicaSecondary));
        description
    }

    fn addresses(servers: &[&ServerDescription]) -> Vec<ServerAddress> {
        let mut addresses: Vec<_> = servers.iter().map(|s| s.address.clone()).collect();
        addresses.sort();
        addresses
    }

    #[test]
    fn primary_selects_exactly_the_primary() {
        let description = replica_set();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let suitable = description.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec![address("a")]);
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let options = ClusterOptions::builder().hosts(vec![address("a")]).build();
        let mut description = TopologyDescription::new(&options);
        description.update(server("a", ServerType::ReplicaPrimary));

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
            options: Default::default(),
        });
        let suitable = description.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec![address("a")]);
    }

    #[test]
    fn first_matching_tag_set_wins() {
        let options = ClusterOptions::builder()
            .hosts(vec![address("a"), address("b"), address("c")])
            .build();
        let mut description = TopologyDescription::new(&options);
        description.update(server("a", ServerType::ReplicaPrimary));
        description.update(tagged("b", ServerType::ReplicaSecondary, &[("dc", "east")]));
        description.update(tagged("c", ServerType::ReplicaSecondary, &[("dc", "west")]));

        let read_pref = ReadPreference::Secondary {
            options: Default::default(),
        }
        .with_tags(vec![
            [("dc".to_string(), "north".to_string())].into_iter().collect(),
            [("dc".to_string(), "west".to_string())].into_iter().collect(),
            [("dc".to_string(), "east".to_string())].into_iter().collect(),
        ])
        .unwrap();

        let criteria = SelectionCriteria::ReadPreference(read_pref);
        let suitable = description.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec![address("c")]);
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let options = ClusterOptions::builder()
            .hosts(vec![address("a"), address("b")])
            .build();
        let mut description = TopologyDescription::new(&options);
        description.update(ServerDescription {
            average_round_trip_time: Some(Duration::from_millis(5)),
            ..server("a", ServerType::ReplicaSecondary)
        });
        description.update(ServerDescription {
            average_round_trip_time: Some(Duration::from_millis(100)),
            ..server("b", ServerType::ReplicaSecondary)
        });

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Default::default(),
        });
        let suitable = description.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec![address("a")]);
    }

    #[test]
    fn selection_does_not_mutate_the_snapshot() {
        let description = replica_set();
        let before = description.clone();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        });
        let _ = description.suitable_servers_in_latency_window(&criteria).unwrap();
        let _ = description.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(description.servers, before.servers);
        assert_eq!(description.topology_type, before.topology_type);
    }

    #[test]
    fn routers_make_the_topology_sharded() {
        let options = ClusterOptions::builder().hosts(vec![address("r")]).build();
        let mut description = TopologyDescription::new(&options);
        assert_eq!(description.topology_type, TopologyType::Unknown);

        description.update(server("r", ServerType::Router));
        assert_eq!(description.topology_type, TopologyType::Sharded);
    }

    #[test]
    fn sync_hosts_adds_and_removes() {
        let mut description = replica_set();
        description.sync_hosts(&[address("a"), address("d")]);
        assert!(description.servers.contains_key(&address("a")));
        assert!(description.servers.contains_key(&address("d")));
        assert!(!description.servers.contains_key(&address("b")));
        assert_eq!(
            description.servers[&address("d")].server_type,
            ServerType::Unknown
        );
    }

    #[test]
    fn stale_secondaries_are_filtered() {
        let now = Instant::now();
        let options = ClusterOptions::builder()
            .hosts(vec![address("a"), address("b"), address("c")])
            .heartbeat_frequency(Duration::from_secs(1))
            .build();
        let mut description = TopologyDescription::new(&options);
        description.update(ServerDescription {
            last_update_time: Some(now),
            last_write_date: Some(now),
            ..server("a", ServerType::ReplicaPrimary)
        });
        // "b" saw its last write 60 seconds before its last heartbeat.
        description.update(ServerDescription {
            last_update_time: Some(now),
            last_write_date: Some(now - Duration::from_secs(60)),
            ..server("b", ServerType::ReplicaSecondary)
        });
        description.update(ServerDescription {
            last_update_time: Some(now),
            last_write_date: Some(now),
            ..server("c", ServerType::ReplicaSecondary)
        });

        let read_pref = ReadPreference::Secondary {
            options: Default::default(),
        }
        .with_max_staleness(Duration::from_secs(30))
        .unwrap();
        let criteria = SelectionCriteria::ReadPreference(read_pref);
        let suitable = description.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec![address("c")]);
    }
}
