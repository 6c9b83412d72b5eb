use std::{
    fmt::{self, Display, Formatter},
    time::{Duration, Instant},
};

use crate::{options::ServerAddress, selection_criteria::TagSet};

/// The role a server plays in the cluster, as reported by monitoring.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A lone server outside any replica set or sharded deployment.
    Standalone,

    /// A router that fronts a sharded deployment.
    Router,

    /// The primary of a replica set.
    ReplicaPrimary,

    /// A secondary of a replica set.
    ReplicaSecondary,

    /// A server whose role has not been determined yet, typically because no heartbeat has
    /// completed since it was added to the topology.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::Router
                | ServerType::ReplicaPrimary
                | ServerType::ReplicaSecondary
        )
    }

    /// Whether this server can serve operations at all.
    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

impl Display for ServerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerType::Standalone => "Standalone",
            ServerType::Router => "Router",
            ServerType::ReplicaPrimary => "ReplicaPrimary",
            ServerType::ReplicaSecondary => "ReplicaSecondary",
            ServerType::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A snapshot of what monitoring last observed about one server.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    /// The address of this server.
    pub address: ServerAddress,

    /// The role this server was last observed to play.
    pub server_type: ServerType,

    /// The moving average of how long a heartbeat round trip to this server takes.
    pub average_round_trip_time: Option<Duration>,

    /// When monitoring last heard from this server.
    pub last_update_time: Option<Instant>,

    /// The last write the server had applied when monitoring last heard from it. Used for
    /// max-staleness filtering.
    pub last_write_date: Option<Instant>,

    /// The replica set tags attached to this server.
    pub tags: Option<TagSet>,

    /// The newest wire protocol version this server speaks.
    pub max_wire_version: Option<i32>,

    /// The message of the monitoring error that marked this server unknown, if any.
    pub error: Option<String>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.server_type == other.server_type
            && self.tags == other.tags
            && self.max_wire_version == other.max_wire_version
            && self.error == other.error
    }
}

impl ServerDescription {
    /// A description for a server nothing is known about yet.
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address: ServerAddress::new(address.host, address.port),
            server_type: ServerType::Unknown,
            average_round_trip_time: None,
            last_update_time: None,
            last_write_date: None,
            tags: None,
            max_wire_version: None,
            error: None,
        }
    }

    /// Whether this server is available for selection.
    pub fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags {
            Some(ref tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

impl Display for ServerDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{ address: {}, type: {}", self.address, self.server_type)?;
        if let Some(ref error) = self.error {
            write!(f, ", error: {}", error)?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn unknown_servers_are_not_available() {
        let description = ServerDescription::new(ServerAddress::new("a", None));
        assert!(!description.is_available());
        assert!(!description.server_type.is_data_bearing());
    }

    #[test]
    fn tag_set_matching_requires_all_pairs() {
        let description = ServerDescription {
            tags: Some(tags(&[("dc", "east"), ("rack", "1")])),
            ..ServerDescription::new(ServerAddress::new("a", None))
        };

        assert!(description.matches_tag_set(&tags(&[("dc", "east")])));
        assert!(description.matches_tag_set(&TagSet::new()));
        assert!(!description.matches_tag_set(&tags(&[("dc", "west")])));
        assert!(!description.matches_tag_set(&tags(&[("dc", "east"), ("rack", "2")])));
    }

    #[test]
    fn untagged_servers_match_nothing() {
        let description = ServerDescription::new(ServerAddress::new("a", None));
        assert!(!description.matches_tag_set(&TagSet::new()));
    }
}
