//! Queue topology manager.
//!
//! Declares the per-request broker topology and publishes messages. Every
//! operation goes through one retry primitive: a connection-level failure
//! reconnects the channel and retries the same operation (bounded by the
//! [`RetryPolicy`]); any other broker error is returned as is.
//!
//! ## Per-request topology
//!
//! ```text
//! transformation_requests ──(<id>)────────► <id>
//! transformation_failures ──(<id>_errors)─► <id>_errors
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sluice_core::{retry_with_backoff, Did, RequestId, RetryPolicy};

use crate::broker::{BrokerChannel, BrokerError, ExchangeKind, DEFAULT_EXCHANGE};
use crate::error::{Error, Result};
use crate::messages::{LookupDispatch, WorkItem};
use crate::metrics::FlowMetrics;

/// Shared exchange carrying work items, routed by request id.
pub const WORK_EXCHANGE: &str = "transformation_requests";

/// Shared exchange carrying dead-lettered work items.
pub const FAILURE_EXCHANGE: &str = "transformation_failures";

/// Suffix of a request's error queue.
pub const ERROR_QUEUE_SUFFIX: &str = "_errors";

/// Name of a request's work queue.
#[must_use]
pub fn work_queue_name(request_id: &RequestId) -> String {
    request_id.to_string()
}

/// Name of a request's error queue.
#[must_use]
pub fn error_queue_name(request_id: &RequestId) -> String {
    format!("{request_id}{ERROR_QUEUE_SUFFIX}")
}

/// Declares broker topology and publishes messages with reconnect-and-retry.
pub struct QueueTopologyManager {
    channel: Arc<dyn BrokerChannel>,
    retry: RetryPolicy,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for QueueTopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTopologyManager")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl QueueTopologyManager {
    /// Creates a manager over an open channel.
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>, retry: RetryPolicy) -> Self {
        Self {
            channel,
            retry,
            metrics: FlowMetrics::new(),
        }
    }

    /// Sets the metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: FlowMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Runs `op` against the channel, reconnecting before each retry that
    /// follows a connection-level failure.
    async fn with_retry<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = std::result::Result<T, BrokerError>>,
    {
        let needs_reconnect = AtomicBool::new(false);
        let flag = &needs_reconnect;
        let channel = &self.channel;
        let op = &op;
        let metrics = &self.metrics;

        retry_with_backoff(
            &self.retry,
            name,
            move || async move {
                if flag.swap(false, Ordering::SeqCst) {
                    if let Err(err) = channel.reconnect().await {
                        flag.store(true, Ordering::SeqCst);
                        return Err(err);
                    }
                }
                let result = op(Arc::clone(channel)).await;
                if matches!(&result, Err(err) if err.is_connection_level()) {
                    flag.store(true, Ordering::SeqCst);
                }
                result
            },
            |err: &BrokerError| {
                let retry = err.is_connection_level();
                if retry {
                    metrics.record_retry(name);
                }
                retry
            },
        )
        .await
        .map_err(|source| Error::broker(None, source))
    }

    /// Declares a durable exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the declaration or stays unreachable.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.with_retry("declare_exchange", move |ch| async move {
            ch.declare_exchange(name, kind).await
        })
        .await
    }

    /// Declares a durable queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the declaration or stays unreachable.
    pub async fn declare_queue(&self, name: &str) -> Result<()> {
        self.with_retry("declare_queue", move |ch| async move {
            ch.declare_queue(name).await
        })
        .await
    }

    /// Binds `queue` to `exchange` for `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the binding or stays unreachable.
    pub async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_retry("bind_queue", move |ch| async move {
            ch.bind_queue(queue, exchange, routing_key).await
        })
        .await
    }

    /// Publishes with mandatory routing.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is unroutable, rejected, or the broker
    /// stays unreachable.
    pub async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.with_retry("publish", move |ch| async move {
            ch.publish(exchange, routing_key, body).await
        })
        .await
    }

    /// Deletes a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is absent (see [`Error::is_not_found`]),
    /// or the broker rejects the call or stays unreachable.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        self.with_retry("delete_queue", move |ch| async move {
            ch.delete_queue(name).await
        })
        .await
    }

    /// Declares the shared exchanges and the request's work and error queues.
    ///
    /// On failure the queues are deleted again (best effort) so no half-built
    /// topology is left behind.
    ///
    /// # Errors
    ///
    /// Returns the first broker error, tagged with the request id.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn setup_request_topology(&self, request_id: &RequestId) -> Result<()> {
        let work_queue = work_queue_name(request_id);
        let error_queue = error_queue_name(request_id);

        let result = async {
            self.declare_exchange(WORK_EXCHANGE, ExchangeKind::Direct).await?;
            self.declare_exchange(FAILURE_EXCHANGE, ExchangeKind::Direct)
                .await?;
            self.declare_queue(&work_queue).await?;
            self.declare_queue(&error_queue).await?;
            self.bind(&work_queue, WORK_EXCHANGE, &work_queue).await?;
            self.bind(&error_queue, FAILURE_EXCHANGE, &error_queue).await
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, "topology setup failed, removing queues");
            self.delete_request_queues(request_id).await;
            return Err(err.with_request_id(*request_id));
        }
        tracing::debug!(queue = %work_queue, "request topology declared");
        Ok(())
    }

    /// Deletes both request queues, ignoring failures. Used to unwind a
    /// partial setup.
    async fn delete_request_queues(&self, request_id: &RequestId) {
        for queue in [work_queue_name(request_id), error_queue_name(request_id)] {
            if let Err(err) = self.delete_queue(&queue).await {
                if !err.is_not_found() {
                    tracing::warn!(queue = %queue, error = %err, "failed to delete queue");
                }
            }
        }
    }

    /// Publishes one work item to the request's queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be serialized or published.
    pub async fn publish_work_item(&self, item: &WorkItem) -> Result<()> {
        let body = serde_json::to_vec(item)?;
        self.publish(WORK_EXCHANGE, &work_queue_name(&item.request_id), &body)
            .await
            .map_err(|e| e.with_request_id(item.request_id))
    }

    /// Sends a lookup dispatch to the resolver queue for `did`'s scheme.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be declared or the publish fails.
    #[tracing::instrument(skip(self, dispatch), fields(dataset_id = %dispatch.dataset_id))]
    pub async fn publish_lookup(&self, did: &Did, dispatch: &LookupDispatch) -> Result<()> {
        let queue = did.resolver_queue();
        self.declare_queue(&queue).await?;
        let body = serde_json::to_vec(dispatch)?;
        self.publish(DEFAULT_EXCHANGE, &queue, &body).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::memory::{BrokerOp, InMemoryBroker};
    use sluice_core::{DatasetId, FileId};

    fn manager(broker: &Arc<InMemoryBroker>) -> QueueTopologyManager {
        let policy = RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(2));
        QueueTopologyManager::new(Arc::clone(broker) as Arc<dyn BrokerChannel>, policy)
    }

    #[tokio::test]
    async fn setup_declares_both_queues() {
        let broker = Arc::new(InMemoryBroker::new());
        let id = RequestId::generate();
        manager(&broker).setup_request_topology(&id).await.unwrap();

        assert!(broker.exchange_exists(WORK_EXCHANGE));
        assert!(broker.exchange_exists(FAILURE_EXCHANGE));
        assert!(broker.queue_exists(&work_queue_name(&id)));
        assert!(broker.queue_exists(&error_queue_name(&id)));
    }

    #[tokio::test]
    async fn connection_failure_reconnects_and_retries() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject(
            BrokerOp::DeclareQueue,
            [BrokerError::ConnectionClosed("reset".into())],
        );
        manager(&broker).declare_queue("q").await.unwrap();

        assert!(broker.queue_exists("q"));
        assert_eq!(broker.calls(BrokerOp::DeclareQueue), 2);
        assert_eq!(broker.calls(BrokerOp::Reconnect), 1);
    }

    #[tokio::test]
    async fn channel_errors_are_not_retried() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject(
            BrokerOp::DeclareQueue,
            [BrokerError::Channel {
                code: 406,
                reason: "PRECONDITION_FAILED".into(),
            }],
        );
        let err = manager(&broker).declare_queue("q").await.unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(broker.calls(BrokerOp::DeclareQueue), 1);
        assert_eq!(broker.calls(BrokerOp::Reconnect), 0);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject(
            BrokerOp::Publish,
            (0..5).map(|_| BrokerError::ConnectionClosed("down".into())),
        );
        let err = manager(&broker).publish("", "q", b"{}").await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(broker.calls(BrokerOp::Publish), 3);
    }

    #[tokio::test]
    async fn failed_setup_removes_declared_queues() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject(
            BrokerOp::Bind,
            [BrokerError::Channel {
                code: 403,
                reason: "ACCESS_REFUSED".into(),
            }],
        );
        let id = RequestId::generate();
        let err = manager(&broker)
            .setup_request_topology(&id)
            .await
            .unwrap_err();

        assert_eq!(err.request_id(), Some(id));
        assert!(!broker.queue_exists(&work_queue_name(&id)));
        assert!(!broker.queue_exists(&error_queue_name(&id)));
    }

    #[tokio::test]
    async fn lookup_goes_to_scheme_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        let did = Did::parse("rucio://mc23:AOD", "rucio");
        let dispatch = LookupDispatch {
            dataset_id: DatasetId::new(7),
            name: did.name().to_string(),
            callback_endpoint: "http://sluice/internal/dataset/".into(),
        };
        manager(&broker).publish_lookup(&did, &dispatch).await.unwrap();

        let sent: Vec<LookupDispatch> = broker.drain("rucio_did_requests");
        assert_eq!(sent, vec![dispatch]);
    }

    #[tokio::test]
    async fn work_items_route_by_request_id() {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = manager(&broker);
        let id = RequestId::generate();
        topology.setup_request_topology(&id).await.unwrap();

        let item = WorkItem {
            request_id: id,
            file_id: FileId::new(1),
            paths: vec!["root://f".into()],
            service_endpoint: "http://sluice/internal/transformation/x".into(),
            result_destination: crate::request::ResultDestination::ObjectStore,
            result_format: crate::request::ResultFormat::Arrow,
        };
        topology.publish_work_item(&item).await.unwrap();
        assert_eq!(broker.depth(&work_queue_name(&id)), 1);
        assert_eq!(broker.depth(&error_queue_name(&id)), 0);
    }
}
