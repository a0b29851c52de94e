//! Dataset resolution and fan-out.
//!
//! The coordinator owns the dataset and dataset-file rows. It deduplicates
//! datasets by name, dispatches at most one resolver lookup per dataset, and
//! fans discovered files out to the requests reading them.
//!
//! ## Fan-out watermark
//!
//! A request's `files` counter is the number of dataset files (in discovery
//! order) already published to its work queue. Every fan-out claims the range
//! `[files, known_files)` by compare-and-swapping `files` forward, then
//! publishes exactly that range:
//!
//! ```text
//! dataset:   f0 f1 f2 f3 f4 f5
//! request:   |--- files=3 --|       claim 3 -> 6, publish f3..f5
//! ```
//!
//! Concurrent fan-outs to the same request cannot both win the same claim, so
//! each file is published to each request once.

use std::sync::Arc;

use chrono::Utc;

use sluice_core::{DatasetId, Did, RequestId};

use crate::dataset::{Dataset, DatasetFile, DatasetIdentifier, DatasetStatus, DatasetTotals, NewDataset, NewDatasetFile};
use crate::error::{Error, Result};
use crate::messages::{join_endpoint, LookupDispatch, WorkItem, DATASET_CALLBACK_PATH};
use crate::metrics::FlowMetrics;
use crate::request::{TransformRequest, TransformStatus};
use crate::store::{CasResult, Store};
use crate::topology::QueueTopologyManager;

/// A resolved dataset as seen by one submission.
///
/// The handle caches the row; call
/// [`DatasetResolutionCoordinator::refresh`] before acting on its status.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetHandle {
    dataset: Dataset,
    created: bool,
}

impl DatasetHandle {
    /// The cached row.
    #[must_use]
    pub const fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Dataset id.
    #[must_use]
    pub const fn id(&self) -> DatasetId {
        self.dataset.id
    }

    /// True if this resolution inserted the row.
    #[must_use]
    pub const fn created(&self) -> bool {
        self.created
    }

    /// True while no lookup has been dispatched.
    #[must_use]
    pub fn is_lookup_required(&self) -> bool {
        self.dataset.is_lookup_required()
    }

    /// True once the resolver has finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.dataset.is_complete()
    }
}

/// Per-request outcome of an `add_files` fan-out.
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// Files stored by this call.
    pub files: Vec<DatasetFile>,
    /// Requests whose fan-out succeeded, as of their claim.
    pub published: Vec<TransformRequest>,
    /// Requests whose fan-out failed.
    pub failed: Vec<(RequestId, Error)>,
}

/// Get-or-create, lookup dispatch and file fan-out for datasets.
pub struct DatasetResolutionCoordinator {
    store: Arc<dyn Store>,
    topology: Arc<QueueTopologyManager>,
    advertised_endpoint: String,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for DatasetResolutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetResolutionCoordinator")
            .field("advertised_endpoint", &self.advertised_endpoint)
            .finish_non_exhaustive()
    }
}

impl DatasetResolutionCoordinator {
    /// Creates a coordinator. `advertised_endpoint` is the base URL resolvers
    /// and workers call back on.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        topology: Arc<QueueTopologyManager>,
        advertised_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            store,
            topology,
            advertised_endpoint: advertised_endpoint.into(),
            metrics: FlowMetrics::new(),
        }
    }

    /// Sets the metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: FlowMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Finds or atomically creates the dataset named by `identifier`.
    ///
    /// DID datasets start in `created`. File-list datasets are named by the
    /// hash of their paths and start `complete` with their files. An existing
    /// dataset has its `last_used` refreshed.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty file list, or a storage error.
    #[tracing::instrument(skip(self, identifier))]
    pub async fn resolve(&self, identifier: &DatasetIdentifier) -> Result<DatasetHandle> {
        let new = match identifier {
            DatasetIdentifier::Did(did) => NewDataset::from_did(did),
            DatasetIdentifier::FileList(files) => {
                if files.is_empty() {
                    return Err(Error::validation("file list must not be empty"));
                }
                NewDataset::from_file_list(files)
            }
        };

        let (dataset, created) = self.store.get_or_create_dataset(&new).await?;
        if created {
            tracing::info!(dataset_id = %dataset.id, name = %dataset.name, "dataset created");
        } else {
            self.store.touch_dataset(dataset.id, Utc::now()).await?;
            tracing::debug!(dataset_id = %dataset.id, status = %dataset.lookup_status, "dataset reused");
        }
        Ok(DatasetHandle { dataset, created })
    }

    /// Re-reads the handle's row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetNotFound`] if the row vanished, or a storage
    /// error.
    pub async fn refresh(&self, handle: &mut DatasetHandle) -> Result<()> {
        handle.dataset = self.load(handle.id()).await?;
        Ok(())
    }

    async fn load(&self, id: DatasetId) -> Result<Dataset> {
        self.store
            .get_dataset(id)
            .await?
            .ok_or(Error::DatasetNotFound { dataset_id: id })
    }

    /// Claims the dataset (`created -> looking`) and sends the resolver one
    /// lookup dispatch.
    ///
    /// Returns `false` if another submission already claimed it; the handle
    /// is refreshed in that case.
    ///
    /// # Errors
    ///
    /// If the dispatch cannot be published the claim is released
    /// (`looking -> created`) and the broker error is returned.
    #[tracing::instrument(skip(self, handle), fields(dataset_id = %handle.id()))]
    pub async fn submit_lookup_request(&self, handle: &mut DatasetHandle) -> Result<bool> {
        let id = handle.id();
        let claim = self
            .store
            .cas_dataset_status(id, DatasetStatus::Created, DatasetStatus::Looking)
            .await?;
        match claim {
            CasResult::Success => {}
            CasResult::NotFound => return Err(Error::DatasetNotFound { dataset_id: id }),
            CasResult::Mismatch { actual } => {
                tracing::debug!(status = %actual, "lookup already claimed");
                self.refresh(handle).await?;
                return Ok(false);
            }
        }

        let did = Did::parse(&handle.dataset.name, &handle.dataset.did_finder);
        let dispatch = LookupDispatch {
            dataset_id: id,
            name: did.name().to_string(),
            callback_endpoint: join_endpoint(&self.advertised_endpoint, DATASET_CALLBACK_PATH),
        };

        if let Err(err) = self.topology.publish_lookup(&did, &dispatch).await {
            self.metrics.record_lookup_dispatch("failed");
            tracing::error!(error = %err, "lookup dispatch failed, releasing claim");
            if let Err(release) = self
                .store
                .cas_dataset_status(id, DatasetStatus::Looking, DatasetStatus::Created)
                .await
            {
                tracing::error!(error = %release, "failed to release lookup claim");
            }
            return Err(err);
        }

        self.metrics.record_lookup_dispatch("sent");
        tracing::info!(queue = %did.resolver_queue(), "lookup dispatched");
        handle.dataset.lookup_status = DatasetStatus::Looking;
        Ok(true)
    }

    /// Publishes every known file the request has not yet received and
    /// advances its `files` watermark.
    ///
    /// Leaves the status alone. Returns the request as of the last claim; a
    /// terminal request is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be read or a work item cannot be
    /// published. Files past the claimed watermark may then be missing from
    /// the request's queue, so callers fail the request.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn publish_files(&self, request: &TransformRequest) -> Result<TransformRequest> {
        let id = request.request_id;
        let mut current = request.clone();
        loop {
            if current.status.is_terminal() {
                return Ok(current);
            }
            let dataset = self.load(current.did_id).await?;
            let from = current.files;
            let to = dataset.known_files;
            if from >= to {
                return Ok(current);
            }

            match self.store.cas_request_files(&id, from, to).await? {
                CasResult::Success => {
                    let files = self.store.dataset_files(dataset.id, from, to).await?;
                    for file in &files {
                        let item = WorkItem::new(&current, file, &self.advertised_endpoint);
                        self.topology.publish_work_item(&item).await?;
                    }
                    self.metrics.record_files_published(files.len());
                    tracing::debug!(from, to, "files published");
                    current.files = to;
                    return Ok(current);
                }
                CasResult::Mismatch { actual } => current = actual,
                CasResult::NotFound => return Err(Error::RequestNotFound { request_id: id }),
            }
        }
    }

    /// Stores newly discovered files and fans them out to every request
    /// reading the dataset.
    ///
    /// Fan-out failures are reported per request; they do not fail the call.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset is unknown or the files cannot be
    /// stored.
    #[tracing::instrument(skip(self, files), fields(dataset_id = %dataset_id, count = files.len()))]
    pub async fn add_files(
        &self,
        dataset_id: DatasetId,
        files: &[NewDatasetFile],
    ) -> Result<FanOutReport> {
        self.load(dataset_id).await?;
        let stored = self.store.append_dataset_files(dataset_id, files).await?;

        let statuses = [
            TransformStatus::PendingLookup,
            TransformStatus::Lookup,
            TransformStatus::Running,
        ];
        let waiting = self.store.requests_for_dataset(dataset_id, &statuses).await?;

        let mut report = FanOutReport {
            files: stored,
            ..FanOutReport::default()
        };
        for request in waiting {
            match self.publish_files(&request).await {
                Ok(updated) => report.published.push(updated),
                Err(err) => {
                    tracing::warn!(request_id = %request.request_id, error = %err, "fan-out failed");
                    report.failed.push((request.request_id, err));
                }
            }
        }
        Ok(report)
    }

    /// Marks the lookup complete with the resolver's totals.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetNotFound`] for an unknown dataset.
    #[tracing::instrument(skip(self))]
    pub async fn complete_lookup(
        &self,
        dataset_id: DatasetId,
        totals: DatasetTotals,
    ) -> Result<Dataset> {
        let dataset = self
            .store
            .complete_dataset(dataset_id, totals)
            .await?
            .ok_or(Error::DatasetNotFound { dataset_id })?;
        tracing::info!(
            files = totals.files,
            known_files = dataset.known_files,
            "dataset lookup complete"
        );
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sluice_core::RetryPolicy;

    use super::*;
    use crate::broker::memory::{BrokerOp, InMemoryBroker};
    use crate::broker::{BrokerChannel, BrokerError};
    use crate::request::{ResultDestination, ResultFormat};
    use crate::store::memory::InMemoryStore;
    use crate::topology::work_queue_name;

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        topology: Arc<QueueTopologyManager>,
        coordinator: DatasetResolutionCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let retry = RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(1))
            .without_jitter();
        let topology = Arc::new(QueueTopologyManager::new(
            Arc::clone(&broker) as Arc<dyn BrokerChannel>,
            retry,
        ));
        let coordinator = DatasetResolutionCoordinator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&topology),
            "http://sluice:8000/",
        );
        Fixture {
            store,
            broker,
            topology,
            coordinator,
        }
    }

    fn did(name: &str) -> DatasetIdentifier {
        DatasetIdentifier::Did(Did::parse(name, "rucio"))
    }

    async fn running_request(fx: &Fixture, dataset: DatasetId) -> TransformRequest {
        let request = TransformRequest {
            request_id: RequestId::generate(),
            title: None,
            did: "rucio://scope:ds".into(),
            did_id: dataset,
            selection: "[jet_pt]".into(),
            tree_name: None,
            image: "sluice/transformer:1.0".into(),
            workers: 1,
            result_destination: ResultDestination::ObjectStore,
            result_format: ResultFormat::Arrow,
            status: TransformStatus::Lookup,
            files: 0,
            files_completed: 0,
            files_failed: 0,
            submit_time: Utc::now(),
            finish_time: None,
            generated_code_cm: None,
            transformer_language: None,
            transformer_command: None,
            failure_description: None,
        };
        fx.store.insert_request(&request).await.unwrap();
        fx.topology
            .setup_request_topology(&request.request_id)
            .await
            .unwrap();
        request
    }

    #[tokio::test]
    async fn resolve_deduplicates_by_name() {
        let fx = fixture();
        let first = fx.coordinator.resolve(&did("scope:ds")).await.unwrap();
        let second = fx.coordinator.resolve(&did("rucio://scope:ds")).await.unwrap();
        assert!(first.created());
        assert!(!second.created());
        assert_eq!(first.id(), second.id());
        assert!(second.is_lookup_required());
        assert_eq!(fx.store.dataset_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn identical_file_lists_share_a_dataset() {
        let fx = fixture();
        let files = vec!["root://a/1.root".to_string(), "root://a/2.root".to_string()];
        let first = fx
            .coordinator
            .resolve(&DatasetIdentifier::FileList(files.clone()))
            .await
            .unwrap();
        let second = fx
            .coordinator
            .resolve(&DatasetIdentifier::FileList(files))
            .await
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert!(second.is_complete());
        assert_eq!(second.dataset().known_files, 2);
    }

    #[tokio::test]
    async fn empty_file_list_is_rejected() {
        let fx = fixture();
        let err = fx
            .coordinator
            .resolve(&DatasetIdentifier::FileList(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn only_the_first_claim_dispatches() {
        let fx = fixture();
        let mut first = fx.coordinator.resolve(&did("scope:ds")).await.unwrap();
        let mut second = fx.coordinator.resolve(&did("scope:ds")).await.unwrap();

        assert!(fx.coordinator.submit_lookup_request(&mut first).await.unwrap());
        assert!(!fx.coordinator.submit_lookup_request(&mut second).await.unwrap());
        assert_eq!(second.dataset().lookup_status, DatasetStatus::Looking);

        let dispatched: Vec<LookupDispatch> = fx.broker.drain("rucio_did_requests");
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].name, "scope:ds");
        assert_eq!(
            dispatched[0].callback_endpoint,
            "http://sluice:8000/internal/dataset/"
        );
    }

    #[tokio::test]
    async fn failed_dispatch_releases_the_claim() {
        let fx = fixture();
        let mut handle = fx.coordinator.resolve(&did("scope:ds")).await.unwrap();
        fx.broker.inject(
            BrokerOp::Publish,
            [BrokerError::Channel {
                code: 404,
                reason: "NOT_FOUND".into(),
            }],
        );
        assert!(fx.coordinator.submit_lookup_request(&mut handle).await.is_err());
        fx.coordinator.refresh(&mut handle).await.unwrap();
        assert!(handle.is_lookup_required());
    }

    #[tokio::test]
    async fn publish_files_advances_the_watermark_once() {
        let fx = fixture();
        let handle = fx.coordinator.resolve(&did("scope:ds")).await.unwrap();
        let request = running_request(&fx, handle.id()).await;
        fx.store
            .append_dataset_files(
                handle.id(),
                &[
                    NewDatasetFile::from_path("root://a/1"),
                    NewDatasetFile::from_path("root://a/2"),
                ],
            )
            .await
            .unwrap();

        let updated = fx.coordinator.publish_files(&request).await.unwrap();
        assert_eq!(updated.files, 2);
        // The stale snapshot still says files=0; the CAS must not republish.
        let again = fx.coordinator.publish_files(&request).await.unwrap();
        assert_eq!(again.files, 2);

        let queue = work_queue_name(&request.request_id);
        let items: Vec<WorkItem> = fx.broker.drain(&queue);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].service_endpoint,
            format!("http://sluice:8000/internal/transformation/{}", request.request_id)
        );
    }

    #[tokio::test]
    async fn add_files_fans_out_incrementally() {
        let fx = fixture();
        let handle = fx.coordinator.resolve(&did("scope:ds")).await.unwrap();
        let request = running_request(&fx, handle.id()).await;

        let first = fx
            .coordinator
            .add_files(handle.id(), &[NewDatasetFile::from_path("root://a/1")])
            .await
            .unwrap();
        assert_eq!(first.published[0].files, 1);
        let second = fx
            .coordinator
            .add_files(
                handle.id(),
                &[
                    NewDatasetFile::from_path("root://a/2"),
                    NewDatasetFile::from_path("root://a/3"),
                ],
            )
            .await
            .unwrap();
        assert!(second.failed.is_empty());
        assert_eq!(second.files[0].ordinal, 1);

        let stored = fx.store.get_request(&request.request_id).await.unwrap().unwrap();
        assert_eq!(stored.files, 3);
        assert_eq!(fx.broker.depth(&work_queue_name(&request.request_id)), 3);
    }

    #[tokio::test]
    async fn complete_lookup_of_unknown_dataset() {
        let fx = fixture();
        let err = fx
            .coordinator
            .complete_lookup(DatasetId::new(404), DatasetTotals::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound { .. }));
    }
}
