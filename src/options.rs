//! Contains the types for cluster configuration.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{ErrorKind, Result};

/// The port a cluster member listens on when none is specified.
pub const DEFAULT_PORT: u16 = 7117;

/// An address of a cluster member that the driver can connect to.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    /// The hostname of the address.
    pub host: String,

    /// The port of the address. When `None`, [`DEFAULT_PORT`] is used.
    pub port: Option<u16>,
}

impl ServerAddress {
    /// Creates an address from a hostname and an optional port.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
        }
    }

    /// Parses an address from a `"host"` or `"host:port"` string.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = part.parse::<u16>().map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be an integer between 1 and 65535, got \"{}\"",
                        part
                    ),
                })?;
                Some(port)
            }
            None => None,
        };

        if parts.next().is_some() {
            return Err(ErrorKind::InvalidArgument {
                message: format!("invalid server address: \"{}\"", address),
            }
            .into());
        }

        Ok(Self::new(host, port))
    }

    /// The port of this address, or the default port when none was specified.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl FromStr for ServerAddress {
    type Err = crate::error::Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = crate::error::Error;

    fn try_from(address: String) -> Result<Self> {
        Self::parse(address)
    }
}

impl From<ServerAddress> for String {
    fn from(address: ServerAddress) -> Self {
        address.to_string()
    }
}

impl Display for ServerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port_or_default())
    }
}

/// Options used to configure a [`Cluster`](crate::Cluster).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClusterOptions {
    /// The initial list of seed addresses the cluster is aware of.
    #[builder(!default)]
    pub hosts: Vec<ServerAddress>,

    /// The amount by which a server's average round trip time may exceed the fastest
    /// eligible server's and still be selected. Defaults to 15 ms.
    pub local_threshold: Option<Duration>,

    /// The amount of time the driver waits for a suitable server to become available before
    /// failing an operation. Defaults to 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The interval between topology checks, used when evaluating staleness. Defaults to 10
    /// seconds.
    pub heartbeat_frequency: Option<Duration>,

    /// Whether eligible write operations are retried once on transient failures. Defaults to
    /// true.
    pub retry_writes: Option<bool>,

    /// Whether read operations are retried once on transient failures. Defaults to true.
    pub retry_reads: Option<bool>,

    /// The maximum number of write sub-requests sent in a single command. Larger bulk writes
    /// are split into batches of at most this size. Defaults to 1000.
    pub max_write_batch_size: Option<usize>,
}
