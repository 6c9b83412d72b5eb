//! Contains the types for read preferences and server selection criteria.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    cluster::description::server::ServerDescription,
    error::{ErrorKind, Result},
    options::ServerAddress,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that determines which servers in a cluster are suitable.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(Predicate),
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Fn(&ServerDescription) -> bool + Send + Sync>;

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "ReadPreference({:?})", read_pref),
            Self::Predicate(..) => write!(f, "Predicate"),
        }
    }
}

impl fmt::Display for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "{:?}", read_pref),
            Self::Predicate(..) => write!(f, "custom predicate"),
        }
    }
}

impl SelectionCriteria {
    /// A criteria that matches only the server at the given address.
    pub fn from_address(address: ServerAddress) -> Self {
        Self::Predicate(Arc::new(move |server| server.address == address))
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

/// Specifies how the driver routes a read operation to members of a cluster.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a cluster, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to be
/// considered for the given operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary { options: ReadPreferenceOptions },

    /// Route this operation to the primary if it's available, but fall back to the
    /// secondaries if not.
    PrimaryPreferred { options: ReadPreferenceOptions },

    /// Route this operation to a secondary if one is available, but fall back to the primary
    /// if not.
    SecondaryPreferred { options: ReadPreferenceOptions },

    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest { options: ReadPreferenceOptions },
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for the given read
    /// preference. If none of the tag sets match any eligible servers, the driver will use
    /// servers with no associated tags instead. The driver will iterate over the list of tag
    /// sets until it finds one that matches at least one eligible server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given read preference. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    /// The maximum staleness configured on this read preference, if any.
    pub fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    /// The tag sets configured on this read preference, if any.
    pub fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// The options of this read preference. `Primary` carries none.
    pub fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { ref options }
            | Self::PrimaryPreferred { ref options }
            | Self::SecondaryPreferred { ref options }
            | Self::Nearest { ref options } => Some(options),
        }
    }

    fn options_mut(&mut self) -> Result<&mut ReadPreferenceOptions> {
        match self {
            Self::Primary => Err(ErrorKind::InvalidArgument {
                message: "read preference options cannot be specified with a primary read \
                          preference"
                    .to_string(),
            }
            .into()),
            Self::Secondary { ref mut options }
            | Self::PrimaryPreferred { ref mut options }
            | Self::SecondaryPreferred { ref mut options }
            | Self::Nearest { ref mut options } => Ok(options),
        }
    }

    /// Returns a copy of this read preference with the given tag sets.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        self.options_mut()?.tag_sets = Some(tag_sets);
        Ok(self)
    }

    /// Returns a copy of this read preference with the given max staleness.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        self.options_mut()?.max_staleness = Some(max_staleness);
        Ok(self)
    }
}

/// A read preference tag set. Members of a cluster carry arbitrary string key/value tags
/// (e.g. `{ "dc": "east" }`) that read preferences can target.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_rejects_options() {
        let result = ReadPreference::Primary.with_tags(vec![TagSet::new()]);
        assert!(result.is_err());

        let result = ReadPreference::Primary.with_max_staleness(Duration::from_secs(100));
        assert!(result.is_err());
    }

    #[test]
    fn with_tags_sets_tag_sets() {
        let mut tags = TagSet::new();
        tags.insert("dc".to_string(), "east".to_string());

        let read_pref = ReadPreference::Secondary {
            options: Default::default(),
        }
        .with_tags(vec![tags.clone()])
        .unwrap();

        assert_eq!(read_pref.tag_sets(), Some(&vec![tags]));
    }
}
