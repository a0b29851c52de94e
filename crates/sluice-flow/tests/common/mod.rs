//! Shared harness for sluice-flow integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sluice_core::{DatasetId, FileId, RequestId, RetryPolicy};
use sluice_flow::broker::memory::InMemoryBroker;
use sluice_flow::broker::{BrokerChannel, BrokerError, ExchangeKind};
use sluice_flow::cluster::memory::{ClusterOp, InMemoryCluster};
use sluice_flow::cluster::ClusterApi;
use sluice_flow::codegen::StaticCodeGenerator;
use sluice_flow::config::OrchestratorConfig;
use sluice_flow::dataset::{Dataset, NewDatasetFile};
use sluice_flow::fleet::fleet_name;
use sluice_flow::gateway::RequestGateway;
use sluice_flow::messages::{FileCompleteReport, FilesDiscovered, LookupDispatch, LookupSummary, WorkItem};
use sluice_flow::request::{FileOutcome, TransformRequest};
use sluice_flow::store::memory::InMemoryStore;
use sluice_flow::store::Store;
use sluice_flow::topology::work_queue_name;

/// Namespace every test fleet runs in.
pub const NAMESPACE: &str = "sluice-test";

/// Resolver inbound queue for the default scheme.
pub const RUCIO_QUEUE: &str = "rucio_did_requests";

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub broker: Arc<InMemoryBroker>,
    pub cluster: Arc<InMemoryCluster>,
    pub gateway: Arc<RequestGateway>,
    hooks: Option<Arc<HookedBroker>>,
}

/// Runs once on the next publish to its routing key, before the message is
/// delivered. An error fails the publish.
pub type PublishHook = Box<dyn FnOnce(Vec<u8>) -> BoxFuture<'static, Result<(), BrokerError>> + Send>;

/// Broker that runs a hook inside `publish`, so tests can act while a
/// publisher is still waiting on the broker.
pub struct HookedBroker {
    inner: Arc<InMemoryBroker>,
    hooks: Mutex<Vec<(String, PublishHook)>>,
}

impl HookedBroker {
    fn take_hook(&self, routing_key: &str) -> Option<PublishHook> {
        let mut hooks = self.hooks.lock().unwrap();
        let index = hooks.iter().position(|(key, _)| key == routing_key)?;
        Some(hooks.remove(index).1)
    }
}

#[async_trait]
impl BrokerChannel for HookedBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.inner.declare_exchange(name, kind).await
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.declare_queue(name).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        if let Some(hook) = self.take_hook(routing_key) {
            hook(body.to_vec()).await?;
        }
        self.inner.publish(exchange, routing_key, body).await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.delete_queue(name).await
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        self.inner.reconnect().await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        namespace: NAMESPACE.to_string(),
        default_image: Some("sluice/transformer:test".to_string()),
        retry: RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(5)),
        ..OrchestratorConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let cluster = Arc::new(InMemoryCluster::new());
        let gateway = Arc::new(RequestGateway::new(
            config,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&broker) as Arc<dyn BrokerChannel>,
            Arc::clone(&cluster) as Arc<dyn ClusterApi>,
            Arc::new(StaticCodeGenerator::default()),
        ));
        Self {
            store,
            broker,
            cluster,
            gateway,
            hooks: None,
        }
    }

    /// Harness whose broker runs hooks registered with [`Harness::on_publish`].
    pub fn hooked() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let cluster = Arc::new(InMemoryCluster::new());
        let hooks = Arc::new(HookedBroker {
            inner: Arc::clone(&broker),
            hooks: Mutex::new(Vec::new()),
        });
        let gateway = Arc::new(RequestGateway::new(
            test_config(),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&hooks) as Arc<dyn BrokerChannel>,
            Arc::clone(&cluster) as Arc<dyn ClusterApi>,
            Arc::new(StaticCodeGenerator::default()),
        ));
        Self {
            store,
            broker,
            cluster,
            gateway,
            hooks: Some(hooks),
        }
    }

    /// Runs `hook` on the next publish to `routing_key`.
    pub fn on_publish(&self, routing_key: &str, hook: PublishHook) {
        let hooks = self.hooks.as_ref().expect("harness built with Harness::hooked");
        hooks.hooks.lock().unwrap().push((routing_key.to_string(), hook));
    }

    pub async fn request(&self, id: &RequestId) -> TransformRequest {
        self.store.get_request(id).await.unwrap().unwrap()
    }

    pub async fn dataset(&self, id: DatasetId) -> Dataset {
        self.store.get_dataset(id).await.unwrap().unwrap()
    }

    /// Drains lookup dispatches sent to the default resolver.
    pub fn dispatches(&self) -> Vec<LookupDispatch> {
        self.broker.drain(RUCIO_QUEUE)
    }

    /// Drains the request's work queue.
    pub fn work_items(&self, id: &RequestId) -> Vec<WorkItem> {
        self.broker.drain(&work_queue_name(id))
    }

    /// Number of fleet shutdowns so far (one deployment delete per shutdown).
    pub fn shutdowns(&self) -> usize {
        self.cluster.calls(ClusterOp::DeleteDeployment)
    }

    pub fn has_fleet(&self, id: &RequestId) -> bool {
        self.cluster.deployment(NAMESPACE, &fleet_name(id)).is_some()
    }

    /// Delivers `count` discovered files for `dataset` and completes the lookup.
    pub async fn resolve_dataset(&self, dataset: DatasetId, count: usize) {
        if count > 0 {
            let files = (0..count)
                .map(|i| NewDatasetFile::from_path(format!("root://eos/file_{i}.root")))
                .collect();
            self.gateway
                .files_discovered(dataset, FilesDiscovered::Many(files))
                .await
                .unwrap();
        }
        self.gateway
            .lookup_complete(dataset, lookup_summary(count, None))
            .await
            .unwrap();
    }
}

pub fn lookup_summary(files: usize, error: Option<&str>) -> LookupSummary {
    let files = i64::try_from(files).unwrap();
    LookupSummary {
        files,
        total_events: files * 1000,
        total_bytes: files * 4096,
        elapsed_time: Some(1.25),
        error: error.map(str::to_string),
    }
}

pub fn report(file_id: FileId, status: FileOutcome) -> FileCompleteReport {
    FileCompleteReport {
        file_id,
        file_path: format!("root://eos/file_{}.root", file_id.get()),
        status,
        total_time: 2.0,
        total_events: 1000,
        total_bytes: 4096,
        avg_rate: 500.0,
    }
}

pub fn success(item: &WorkItem) -> FileCompleteReport {
    report(item.file_id, FileOutcome::Success)
}
