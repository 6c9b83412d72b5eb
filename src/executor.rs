//! Contains the retryable attempt loop that drives operations against bindings.

use crate::{
    binding::{ChannelSource, ReadBinding, WriteBinding},
    channel::Command,
    cluster::Cluster,
    error::{ErrorKind, Result},
    operation::{Operation, Retryability},
    options::ServerAddress,
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::SessionHandle,
};

/// A write runs at most twice: the initial attempt plus one retry.
const MAX_WRITE_ATTEMPTS: u32 = 2;

/// A read runs at most twice: the initial attempt plus one retry.
const MAX_READ_ATTEMPTS: u32 = 2;

/// Owns everything one retryable read needs across its attempts: the binding, the current
/// channel source, and the attempt bookkeeping. Never shared between concurrent operations.
pub(crate) struct RetryableReadContext {
    binding: ReadBinding,
    source: ChannelSource,
    attempt: u32,
    deprioritized: Vec<ServerAddress>,
    retry_enabled: bool,
}

impl RetryableReadContext {
    /// Acquires the initial channel source for the binding.
    pub(crate) async fn new(binding: ReadBinding, retry_enabled: bool) -> Result<Self> {
        let source = binding.channel_source(&[]).await?;
        Ok(Self {
            binding,
            source,
            attempt: 0,
            deprioritized: Vec::new(),
            retry_enabled,
        })
    }
}

/// Owns everything one retryable write needs across its attempts. Retry eligibility is
/// computed up front: if the operation is a retryable write executing outside a transaction,
/// a transaction number is allocated before the first attempt and the same number is sent on
/// both attempts.
pub(crate) struct RetryableWriteContext {
    binding: WriteBinding,
    source: ChannelSource,
    attempt: u32,
    deprioritized: Vec<ServerAddress>,
    txn_number: Option<u64>,
}

impl RetryableWriteContext {
    /// Acquires the initial channel source for the binding and allocates the transaction
    /// number when the operation is eligible for retry.
    pub(crate) async fn new(
        binding: WriteBinding,
        retryability: Retryability,
        retry_enabled: bool,
    ) -> Result<Self> {
        let source = binding.channel_source(&[]).await?;
        let txn_number = if retry_enabled
            && retryability == Retryability::Write
            && !source.session().in_transaction()
        {
            Some(source.session().next_txn_number())
        } else {
            None
        };
        Ok(Self {
            binding,
            source,
            attempt: 0,
            deprioritized: Vec::new(),
            txn_number,
        })
    }

}

/// Runs a write operation through its context, retrying once on transient failures when a
/// transaction number was allocated.
pub(crate) async fn execute_write<T: Operation>(
    operation: &mut T,
    context: &mut RetryableWriteContext,
) -> Result<T::O> {
    // A transaction number makes the command idempotent on the server. Sending one with an
    // ineligible sub-request would make an unsafe retry look safe, so that combination is
    // rejected outright.
    if context.txn_number.is_some() && operation.retryability() != Retryability::Write {
        return Err(ErrorKind::NotRetryable {
            message: format!("{} contains a request that cannot be retried", operation.name()),
        }
        .into());
    }

    loop {
        context.attempt += 1;
        let server = context.source.address().clone();

        let result = execute_attempt(operation, &context.source, context.txn_number).await;

        match result {
            Ok(output) => return Ok(output),
            Err(err) => {
                if err.is_network_error() {
                    context.source.session().mark_dirty();
                }

                let can_retry = context.txn_number.is_some()
                    && context.attempt < MAX_WRITE_ATTEMPTS
                    && err.is_write_retryable();
                if !can_retry {
                    return Err(err.with_operation_context(context.attempt, Some(server)));
                }

                tracing::debug!(
                    operation = operation.name(),
                    %server,
                    attempt = context.attempt,
                    error = %err,
                    "retrying write"
                );

                // A pinned session must stay on its server; otherwise the failed server is
                // avoided for the retry.
                if context.source.session().pinned_server().is_none() {
                    context.deprioritized.push(server.clone());
                }

                match context.binding.channel_source(&context.deprioritized).await {
                    Ok(source) => context.source = source,
                    // The original failure is more informative than the re-selection one.
                    Err(_) => {
                        return Err(err.with_operation_context(context.attempt, Some(server)))
                    }
                }

                operation.update_for_retry();
            }
        }
    }
}

/// Runs a read operation through its context, retrying once on transient failures.
pub(crate) async fn execute_read<T: Operation>(
    operation: &mut T,
    context: &mut RetryableReadContext,
) -> Result<T::O> {
    loop {
        context.attempt += 1;
        let server = context.source.address().clone();

        let result = execute_attempt(operation, &context.source, None).await;

        match result {
            Ok(output) => return Ok(output),
            Err(err) => {
                if err.is_network_error() {
                    context.source.session().mark_dirty();
                }

                let can_retry = context.retry_enabled
                    && context.attempt < MAX_READ_ATTEMPTS
                    && err.is_read_retryable();
                if !can_retry {
                    return Err(err.with_operation_context(context.attempt, Some(server)));
                }

                tracing::debug!(
                    operation = operation.name(),
                    %server,
                    attempt = context.attempt,
                    error = %err,
                    "retrying read"
                );

                if context.source.session().pinned_server().is_none() {
                    context.deprioritized.push(server.clone());
                }

                match context.binding.channel_source(&context.deprioritized).await {
                    Ok(source) => context.source = source,
                    Err(_) => {
                        return Err(err.with_operation_context(context.attempt, Some(server)))
                    }
                }

                operation.update_for_retry();
            }
        }
    }
}

/// Runs a single attempt: builds the command, stamps the session fields onto it, sends it
/// over a fresh channel, and interprets the reply. The channel lives only for the attempt.
async fn execute_attempt<T: Operation>(
    operation: &mut T,
    source: &ChannelSource,
    txn_number: Option<u64>,
) -> Result<T::O> {
    let mut command = operation.build()?;
    attach_session(&mut command, source.session(), txn_number);

    let channel = source.channel();
    let response = channel.run_command(command).await?;

    if let Some(time) = response.cluster_time() {
        source.session().advance_cluster_time(time);
    }

    operation.handle_response(response)
}

fn attach_session(command: &mut Command, session: &SessionHandle, txn_number: Option<u64>) {
    command.insert("lsid", session.id().to_string());
    if let Some(time) = session.cluster_time() {
        command.insert("$clusterTime", serde_json::json!({ "time": time.time }));
    }
    if let Some(txn_number) = txn_number {
        command.insert("txnNumber", txn_number);
    }
}

/// Convenience wrapper: runs a read operation with a fresh binding built from the
/// operation's criteria (or `Primary` when it has none).
pub(crate) async fn execute_read_operation<T: Operation>(
    operation: &mut T,
    cluster: &Cluster,
    session: &SessionHandle,
) -> Result<T::O> {
    let criteria = operation
        .selection_criteria()
        .cloned()
        .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));
    let retry_enabled = cluster.options().retry_reads.unwrap_or(true);
    let binding = ReadBinding::new(cluster.clone(), criteria, session.fork());
    let mut context = RetryableReadContext::new(binding, retry_enabled).await?;
    execute_read(operation, &mut context).await
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use futures_util::future::BoxFuture;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        channel::{Channel, CommandRunner, Response},
        cluster::{ServerDescription, ServerType},
        error::Error,
        operation::Find,
        options::ClusterOptions,
    };

    /// Replays one scripted reply per attempt and records what was sent.
    struct ScriptedRunner {
        replies: Mutex<Vec<Result<Value>>>,
        seen: Mutex<Vec<(ServerAddress, u32, Value)>>,
    }

    impl ScriptedRunner {
        fn new(replies: Vec<Result<Value>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<(ServerAddress, u32, Value)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run_command<'a>(
            &'a self,
            channel: &'a Channel,
            command: Command,
        ) -> BoxFuture<'a, Result<Response>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push((
                    channel.address().clone(),
                    channel.id(),
                    command.body,
                ));
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    return Ok(Response::new(json!({ "ok": 1 })));
                }
                replies.remove(0).map(Response::new)
            })
        }
    }

    fn network_error() -> Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into()
    }

    fn address(host: &str) -> ServerAddress {
        ServerAddress::new(host, None)
    }

    async fn router_cluster(hosts: &[&str], runner: Arc<ScriptedRunner>) -> Cluster {
        let options = ClusterOptions::builder()
            .hosts(hosts.iter().map(|h| address(h)).collect::<Vec<_>>())
            .server_selection_timeout(Duration::from_secs(5))
            .build();
        let cluster = Cluster::new(options, runner);
        for host in hosts {
            cluster
                .updater()
                .apply_update(ServerDescription {
                    server_type: ServerType::Router,
                    average_round_trip_time: Some(Duration::from_millis(1)),
                    ..ServerDescription::new(address(host))
                })
                .await;
        }
        cluster
    }

    fn insert_batch() -> crate::operation::BulkWrite {
        crate::operation::BulkWrite::new(
            "c",
            vec![crate::operation::WriteRequest::Insert {
                document: json!({ "x": 1 }),
            }],
        )
    }

    #[tokio::test]
    async fn retried_write_reuses_txn_number_on_another_server() {
        let runner = ScriptedRunner::new(vec![
            Err(network_error()),
            Ok(json!({ "ok": 1, "nInserted": 1 })),
        ]);
        let cluster = router_cluster(&["a", "b"], Arc::clone(&runner)).await;
        let session = SessionHandle::new();

        let result = insert_batch().execute(&cluster, &session).await.unwrap();
        assert_eq!(result.inserted_count, 1);

        let seen = runner.seen();
        assert_eq!(seen.len(), 2);
        // Both attempts carried the same transaction number.
        let first_txn = &seen[0].2["txnNumber"];
        let second_txn = &seen[1].2["txnNumber"];
        assert!(first_txn.is_u64());
        assert_eq!(first_txn, second_txn);
        // The retry avoided the failed server.
        assert_ne!(seen[0].0, seen[1].0);
    }

    #[tokio::test]
    async fn second_failure_is_reported_with_attempt_count() {
        let runner = ScriptedRunner::new(vec![
            Err(network_error()),
            Ok(json!({
                "ok": 0,
                "code": 91,
                "codeName": "ShutdownInProgress",
                "errmsg": "shutting down",
            })),
        ]);
        let cluster = router_cluster(&["a", "b"], Arc::clone(&runner)).await;
        let session = SessionHandle::new();

        let err = insert_batch().execute(&cluster, &session).await.unwrap_err();
        // The most recent error wins, with the retry bookkeeping attached.
        assert_eq!(err.code(), Some(91));
        assert_eq!(err.attempts, Some(2));
        assert!(err.server.is_some());
        assert_eq!(runner.seen().len(), 2);
    }

    #[tokio::test]
    async fn delete_all_is_not_retried_and_carries_no_txn_number() {
        let runner = ScriptedRunner::new(vec![Err(network_error())]);
        let cluster = router_cluster(&["a", "b"], Arc::clone(&runner)).await;
        let session = SessionHandle::new();

        let bulk = crate::operation::BulkWrite::new(
            "c",
            vec![crate::operation::WriteRequest::Delete {
                filter: json!({}),
                limit: 0,
            }],
        );
        let err = bulk.execute(&cluster, &session).await.unwrap_err();
        assert!(err.is_network_error());
        assert_eq!(err.attempts, Some(1));

        let seen = runner.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].2.get("txnNumber").is_none());
    }

    #[tokio::test]
    async fn pinned_session_retries_on_the_same_server() {
        let runner = ScriptedRunner::new(vec![
            Err(network_error()),
            Ok(json!({ "ok": 1, "documents": [] })),
        ]);
        let cluster = router_cluster(&["a", "b"], Arc::clone(&runner)).await;
        let session = SessionHandle::new();
        session.start_transaction().unwrap();

        let mut find = Find::new("c", json!({}), None);
        let documents = execute_read_operation(&mut find, &cluster, &session)
            .await
            .unwrap();
        assert!(documents.is_empty());

        let seen = runner.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, seen[1].0);
        assert_eq!(session.pinned_server(), Some(seen[0].0.clone()));
    }

    #[tokio::test]
    async fn each_attempt_uses_a_fresh_channel() {
        let runner = ScriptedRunner::new(vec![
            Err(network_error()),
            Ok(json!({ "ok": 1, "documents": [] })),
        ]);
        let cluster = router_cluster(&["a"], Arc::clone(&runner)).await;
        let session = SessionHandle::new();

        let mut find = Find::new("c", json!({}), None);
        execute_read_operation(&mut find, &cluster, &session)
            .await
            .unwrap();

        let seen = runner.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, seen[1].0);
        assert_ne!(seen[0].1, seen[1].1);
    }

    #[tokio::test]
    async fn network_error_marks_the_session_dirty() {
        let runner = ScriptedRunner::new(vec![
            Err(network_error()),
            Ok(json!({ "ok": 1, "documents": [] })),
        ]);
        let cluster = router_cluster(&["a", "b"], Arc::clone(&runner)).await;
        let session = SessionHandle::new();

        let mut find = Find::new("c", json!({}), None);
        execute_read_operation(&mut find, &cluster, &session)
            .await
            .unwrap();
        assert!(session.is_dirty());
    }

    #[tokio::test]
    async fn cluster_time_from_replies_advances_the_session() {
        let runner = ScriptedRunner::new(vec![Ok(
            json!({ "ok": 1, "documents": [], "$clusterTime": { "time": 9 } }),
        )]);
        let cluster = router_cluster(&["a"], Arc::clone(&runner)).await;
        let session = SessionHandle::new();

        let mut find = Find::new("c", json!({}), None);
        execute_read_operation(&mut find, &cluster, &session)
            .await
            .unwrap();
        assert_eq!(session.cluster_time().map(|t| t.time), Some(9));

        // The next command gossips the time back.
        let mut find = Find::new("c", json!({}), None);
        execute_read_operation(&mut find, &cluster, &session)
            .await
            .unwrap();
        let seen = runner.seen();
        assert_eq!(seen[1].2["$clusterTime"]["time"], 9);
    }
}
