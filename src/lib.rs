//! A client-side execution core for replicated and sharded document-store clusters.
//!
//! `replicore` handles the parts of talking to a cluster that are independent of the wire
//! protocol: tracking the topology as monitoring reports change, selecting servers per read
//! preference, running operations with transparent single-retry failover, and splitting bulk
//! writes into batches whose results are stitched back together under the caller's original
//! request indices.
//!
//! The actual transport is pluggable: implement [`CommandRunner`] to connect commands to a
//! wire protocol (or to a script, in tests), and feed topology observations through
//! [`TopologyUpdater`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use replicore::{BulkWrite, Cluster, ClusterOptions, CommandRunner, ServerAddress,
//! #     SessionHandle, WriteRequest};
//! # async fn demo(runner: Arc<dyn CommandRunner>) -> replicore::error::Result<()> {
//! let options = ClusterOptions::builder()
//!     .hosts(vec![ServerAddress::parse("db1.example.com:7117")?])
//!     .build();
//! let cluster = Cluster::new(options, runner);
//!
//! let session = SessionHandle::new();
//! let result = BulkWrite::new(
//!     "users",
//!     vec![WriteRequest::Insert {
//!         document: serde_json::json!({ "name": "a" }),
//!     }],
//! )
//! .execute(&cluster, &session)
//! .await?;
//! assert_eq!(result.inserted_count, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod binding;
mod channel;
mod cluster;
pub mod error;
mod executor;
mod operation;
pub mod options;
pub mod results;
pub mod selection_criteria;
pub mod session;

pub use crate::{
    binding::{ChannelSource, ReadBinding, WriteBinding},
    channel::{Channel, Command, CommandRunner, Response},
    cluster::{
        Cluster,
        ServerDescription,
        ServerType,
        TopologyDescription,
        TopologyType,
        TopologyUpdater,
    },
    error::{Error, ErrorKind},
    operation::{BulkWrite, Find, WriteRequest},
    options::{ClusterOptions, ServerAddress},
    results::{BulkWriteResult, BulkWriteUpsert},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
    session::{ClusterTime, SessionHandle},
};
