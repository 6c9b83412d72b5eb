//! Contains the command/response types and the pluggable transport trait.

use std::{fmt, sync::Arc};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{error::Result, options::ServerAddress, session::ClusterTime};

/// A single command destined for a cluster member. The body is a JSON document whose first
/// key is the command name.
#[derive(Clone, Debug)]
pub struct Command {
    /// The name of the command.
    pub name: String,

    /// The full command document, including the name key.
    pub body: Value,
}

impl Command {
    pub(crate) fn new(name: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Adds a top-level key to the command body.
    pub(crate) fn insert(&mut self, key: &str, value: impl Into<Value>) {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.to_string(), value.into());
        }
    }
}

/// The reply a cluster member sent for a single command.
#[derive(Clone, Debug)]
pub struct Response {
    body: Value,
}

impl Response {
    /// Wraps a raw reply document.
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    /// Whether the server reported the command as successful.
    pub(crate) fn is_success(&self) -> bool {
        self.body.get("ok").and_then(Value::as_i64) == Some(1)
    }

    /// Deserializes the reply body into a typed response.
    pub(crate) fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// The cluster time the server attached to the reply, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.body
            .get("$clusterTime")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Sends commands to a specific cluster member and returns the replies.
///
/// The wire format and socket handling live behind this trait; the driver core only deals in
/// [`Command`] and [`Response`] values. Implementations must be safe to share across tasks.
pub trait CommandRunner: Send + Sync + 'static {
    /// Executes a single command over the given channel.
    fn run_command<'a>(
        &'a self,
        channel: &'a Channel,
        command: Command,
    ) -> BoxFuture<'a, Result<Response>>;
}

/// A logical connection to a single cluster member. Each channel sends one command at a time;
/// a fresh channel is acquired for every attempt of an operation.
#[derive(Clone)]
pub struct Channel {
    address: ServerAddress,
    id: u32,
    runner: Arc<dyn CommandRunner>,
}

impl Channel {
    pub(crate) fn new(address: ServerAddress, id: u32, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            address,
            id,
            runner,
        }
    }

    /// The address of the server this channel is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The driver-generated id of this channel, unique per server.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) async fn run_command(&self, command: Command) -> Result<Response> {
        self.runner.run_command(self, command).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn is_success_requires_ok_one() {
        assert!(Response::new(json!({ "ok": 1 })).is_success());
        assert!(!Response::new(json!({ "ok": 0, "code": 11600 })).is_success());
        assert!(!Response::new(json!({})).is_success());
    }

    #[test]
    fn cluster_time_is_extracted() {
        let response = Response::new(json!({ "ok": 1, "$clusterTime": { "time": 42 } }));
        assert_eq!(response.cluster_time(), Some(ClusterTime { time: 42 }));
    }

    #[test]
    fn insert_adds_top_level_key() {
        let mut command = Command::new("find", json!({ "find": "users" }));
        command.insert("txnNumber", 3);
        assert_eq!(command.body["txnNumber"], 3);
    }
}
