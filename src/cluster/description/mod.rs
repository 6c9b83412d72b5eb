pub(crate) mod server;
pub(crate) mod topology;

pub use self::{
    server::{ServerDescription, ServerType},
    topology::{TopologyDescription, TopologyType},
};
