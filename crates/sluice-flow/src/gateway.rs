//! Request gateway.
//!
//! The gateway is the only entry point into the orchestration core. It
//! validates submissions, creates request rows and forwards resolver and
//! worker callbacks to the tracker. Components are built once in
//! [`RequestGateway::new`] and shared by reference.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use sluice_core::{dataset_span, request_span, DatasetId, Did, RequestId};
use tracing::Instrument;

use crate::broker::BrokerChannel;
use crate::cluster::{ClusterApi, DeploymentStatus};
use crate::codegen::{CodeGenRequest, CodeGenerator};
use crate::config::OrchestratorConfig;
use crate::dataset::DatasetIdentifier;
use crate::error::{Error, Result};
use crate::fleet::FleetLifecycleManager;
use crate::messages::{FileCompleteReport, FilesDiscovered, LookupSummary};
use crate::metrics::{time_callback, FlowMetrics};
use crate::request::{
    ResultDestination, ResultFormat, TransformRequest, TransformStatistics, TransformStatus,
    MAX_TITLE_LEN,
};
use crate::resolution::DatasetResolutionCoordinator;
use crate::store::Store;
use crate::topology::QueueTopologyManager;
use crate::tracker::{CompletionTracker, FileCompletion};

const fn default_workers() -> u32 {
    1
}

/// A client's transform submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Dataset identifier; exclusive with `file_list`.
    #[serde(default)]
    pub did: Option<String>,
    /// Explicit input files; exclusive with `did`.
    #[serde(default)]
    pub file_list: Option<Vec<String>>,
    /// Selection or column expression.
    pub selection: String,
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
    /// Tree name inside the input files.
    #[serde(default)]
    pub tree_name: Option<String>,
    /// Transformer image.
    #[serde(default)]
    pub image: Option<String>,
    /// Requested worker count.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Output destination.
    pub result_destination: ResultDestination,
    /// Output format; defaults per destination.
    #[serde(default)]
    pub result_format: Option<ResultFormat>,
}

impl Submission {
    /// A submission for a dataset identifier with default settings.
    #[must_use]
    pub fn for_did(did: impl Into<String>, selection: impl Into<String>) -> Self {
        Self {
            did: Some(did.into()),
            file_list: None,
            selection: selection.into(),
            title: None,
            tree_name: None,
            image: None,
            workers: default_workers(),
            result_destination: ResultDestination::ObjectStore,
            result_format: None,
        }
    }

    /// A submission for explicit files with default settings.
    #[must_use]
    pub fn for_files(files: Vec<String>, selection: impl Into<String>) -> Self {
        Self {
            did: None,
            file_list: Some(files),
            ..Self::for_did(String::new(), selection)
        }
    }
}

/// A submission that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSubmission {
    /// Dataset to resolve.
    pub identifier: DatasetIdentifier,
    /// Output format after defaulting.
    pub result_format: ResultFormat,
}

/// Checks a submission against `config`, without touching any state.
///
/// # Errors
///
/// Returns a validation error describing the first problem found.
pub fn validate_submission(
    submission: &Submission,
    config: &OrchestratorConfig,
) -> Result<ValidatedSubmission> {
    let identifier = match (&submission.did, &submission.file_list) {
        (Some(_), Some(_)) => {
            return Err(Error::validation(
                "exactly one of 'did' and 'file_list' must be given, not both",
            ))
        }
        (None, None) => {
            return Err(Error::validation(
                "exactly one of 'did' and 'file_list' must be given",
            ))
        }
        (Some(raw), None) => {
            if raw.trim().is_empty() {
                return Err(Error::validation("'did' must not be empty"));
            }
            let did = Did::parse(raw.trim(), &config.did_default_scheme);
            if !config.valid_did_schemes.iter().any(|s| s == did.scheme()) {
                return Err(Error::validation(format!(
                    "DID scheme '{}' is not supported",
                    did.scheme()
                )));
            }
            DatasetIdentifier::Did(did)
        }
        (None, Some(files)) => {
            if files.is_empty() {
                return Err(Error::validation("'file_list' must not be empty"));
            }
            DatasetIdentifier::FileList(files.clone())
        }
    };

    if submission.selection.trim().is_empty() {
        return Err(Error::validation("'selection' must not be empty"));
    }
    if submission
        .title
        .as_ref()
        .is_some_and(|title| title.chars().count() > MAX_TITLE_LEN)
    {
        return Err(Error::validation(format!(
            "'title' must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    if submission.workers == 0 {
        return Err(Error::validation("'workers' must be at least 1"));
    }

    let destination = submission.result_destination;
    let result_format = match submission.result_format {
        Some(format) if !format.supports(destination) => {
            return Err(Error::validation(format!(
                "result format '{format}' cannot be written to '{destination}'"
            )))
        }
        Some(format) => format,
        None => ResultFormat::default_for(destination),
    };

    Ok(ValidatedSubmission {
        identifier,
        result_format,
    })
}

/// A request as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStatusView {
    /// The stored row.
    #[serde(flatten)]
    pub request: TransformRequest,
    /// Files still outstanding, absent while nothing is published.
    pub files_remaining: Option<i64>,
}

impl From<TransformRequest> for RequestStatusView {
    fn from(request: TransformRequest) -> Self {
        Self {
            files_remaining: request.files_remaining(),
            request,
        }
    }
}

/// Accepts submissions and callbacks and drives the orchestration core.
pub struct RequestGateway {
    config: OrchestratorConfig,
    store: Arc<dyn Store>,
    topology: Arc<QueueTopologyManager>,
    coordinator: Arc<DatasetResolutionCoordinator>,
    fleet: Arc<FleetLifecycleManager>,
    tracker: Arc<CompletionTracker>,
    codegen: Arc<dyn CodeGenerator>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RequestGateway {
    /// Wires the components over the given collaborators.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Store>,
        broker: Arc<dyn BrokerChannel>,
        cluster: Arc<dyn ClusterApi>,
        codegen: Arc<dyn CodeGenerator>,
    ) -> Self {
        let metrics = FlowMetrics::new();
        let topology = Arc::new(
            QueueTopologyManager::new(broker, config.retry.clone()).with_metrics(metrics.clone()),
        );
        let coordinator = Arc::new(
            DatasetResolutionCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&topology),
                config.advertised_endpoint.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let fleet = Arc::new(
            FleetLifecycleManager::new(
                cluster,
                Arc::clone(&topology),
                config.fleet.clone(),
                config.retry.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let tracker = Arc::new(
            CompletionTracker::new(
                Arc::clone(&store),
                Arc::clone(&coordinator),
                Arc::clone(&fleet),
                config.namespace.clone(),
                config.retry.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        Self {
            config,
            store,
            topology,
            coordinator,
            fleet,
            tracker,
            codegen,
            metrics,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The completion tracker.
    #[must_use]
    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// The dataset coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &DatasetResolutionCoordinator {
        &self.coordinator
    }

    /// The fleet manager.
    #[must_use]
    pub fn fleet(&self) -> &FleetLifecycleManager {
        &self.fleet
    }

    /// Accepts a submission and returns the new request id.
    ///
    /// The call returns once the lookup is dispatched or the files are
    /// published and the fleet is launched. A request whose dataset turns out
    /// to be empty is created as `fatal` and still returns its id.
    ///
    /// # Errors
    ///
    /// - Validation errors: nothing was created.
    /// - Topology errors: queues were removed again, no request exists.
    /// - Later infrastructure errors: the request exists as `fatal` and its
    ///   resources were torn down.
    #[tracing::instrument(skip(self, submission), fields(request_id))]
    pub async fn submit(&self, submission: Submission) -> Result<RequestId> {
        let result = self.submit_inner(submission).await;
        match &result {
            Ok(_) => self.metrics.record_submission("accepted"),
            Err(Error::Validation { .. }) => self.metrics.record_submission("rejected"),
            Err(_) => self.metrics.record_submission("failed"),
        }
        result
    }

    async fn submit_inner(&self, submission: Submission) -> Result<RequestId> {
        let validated = validate_submission(&submission, &self.config)?;
        let request_id = RequestId::generate();
        tracing::Span::current().record("request_id", tracing::field::display(request_id));

        let code = self
            .codegen
            .generate(&CodeGenRequest {
                selection: submission.selection.clone(),
                tree_name: submission.tree_name.clone(),
                result_format: validated.result_format.as_str().to_string(),
            })
            .await?;
        let image = submission
            .image
            .clone()
            .filter(|image| !image.trim().is_empty())
            .or_else(|| code.transformer_image.clone())
            .or_else(|| self.config.default_image.clone())
            .ok_or_else(|| Error::validation("no transformer image given or configured"))?;

        let mut dataset = self.coordinator.resolve(&validated.identifier).await?;

        self.topology.setup_request_topology(&request_id).await?;
        let namespace = self.tracker.namespace();

        let generated_code_cm = match self
            .fleet
            .stage_generated_code(&request_id, namespace, &code)
            .await
        {
            Ok(name) => name,
            Err(err) => {
                self.fleet.shutdown(&request_id, namespace).await;
                return Err(err);
            }
        };

        let request = TransformRequest {
            request_id,
            title: submission.title,
            did: dataset.dataset().name.clone(),
            did_id: dataset.id(),
            selection: submission.selection,
            tree_name: submission.tree_name,
            image,
            workers: submission.workers,
            result_destination: submission.result_destination,
            result_format: validated.result_format,
            status: TransformStatus::Submitted,
            files: 0,
            files_completed: 0,
            files_failed: 0,
            submit_time: Utc::now(),
            finish_time: None,
            generated_code_cm: Some(generated_code_cm),
            transformer_language: Some(code.language),
            transformer_command: Some(code.command),
            failure_description: None,
        };
        if let Err(err) = self.store.insert_request(&request).await {
            self.fleet.shutdown(&request_id, namespace).await;
            return Err(err);
        }
        tracing::info!(dataset_id = %request.did_id, did = %request.did, "request created");

        let status = match self.tracker.on_submission(&request, &mut dataset).await {
            Ok(status) => status,
            Err(err) => {
                self.fleet.shutdown(&request_id, namespace).await;
                return Err(err);
            }
        };
        if status.is_terminal() {
            self.fleet.shutdown(&request_id, namespace).await;
            return Ok(request_id);
        }

        let current = self.load(&request_id).await?;
        if let Err(err) = self.fleet.start(&current, namespace).await {
            self.tracker
                .fail(&request_id, format!("worker fleet could not be started: {err}"))
                .await?;
            return Err(err);
        }

        // A cancel or failure may have landed while the fleet was starting.
        if self.load(&request_id).await?.status.is_terminal() {
            self.fleet.shutdown(&request_id, namespace).await;
        }
        Ok(request_id)
    }

    async fn load(&self, id: &RequestId) -> Result<TransformRequest> {
        self.store
            .get_request(id)
            .await?
            .ok_or(Error::RequestNotFound { request_id: *id })
    }

    /// Current state of a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for an unknown id.
    pub async fn status(&self, id: &RequestId) -> Result<RequestStatusView> {
        self.load(id).await.map(RequestStatusView::from)
    }

    /// Aggregate statistics over the request's file reports; `None` before
    /// the first report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for an unknown id.
    pub async fn statistics(&self, id: &RequestId) -> Result<Option<TransformStatistics>> {
        self.load(id).await?;
        let results = self.store.transformation_results(id).await?;
        Ok(TransformStatistics::from_results(&results))
    }

    /// Deployment status of the request's fleet; `None` if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for an unknown id, or a cluster
    /// error.
    pub async fn fleet_status(&self, id: &RequestId) -> Result<Option<DeploymentStatus>> {
        self.load(id).await?;
        self.fleet.status(id, self.tracker.namespace()).await
    }

    /// Cancels a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyTerminal`] or [`Error::RequestNotFound`].
    pub async fn cancel(&self, id: &RequestId) -> Result<TransformRequest> {
        self.tracker.cancel(id).await
    }

    /// Resolver callback: files discovered for a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetNotFound`] or a storage error.
    pub async fn files_discovered(
        &self,
        dataset_id: DatasetId,
        files: FilesDiscovered,
    ) -> Result<usize> {
        let _timer = time_callback(&self.metrics, "files_discovered");
        self.tracker
            .on_files_discovered(dataset_id, &files.into_files())
            .instrument(dataset_span("files_discovered", dataset_id.get()))
            .await
    }

    /// Resolver callback: lookup finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetNotFound`] or the first per-request failure.
    pub async fn lookup_complete(&self, dataset_id: DatasetId, summary: LookupSummary) -> Result<()> {
        let _timer = time_callback(&self.metrics, "lookup_complete");
        self.tracker
            .on_lookup_complete(dataset_id, &summary)
            .instrument(dataset_span("lookup_complete", dataset_id.get()))
            .await
    }

    /// Worker callback: one file finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] or a storage error after retries.
    pub async fn file_complete(
        &self,
        request_id: &RequestId,
        report: FileCompleteReport,
    ) -> Result<FileCompletion> {
        let _timer = time_callback(&self.metrics, "file_complete");
        self.tracker
            .on_file_complete(request_id, &report)
            .instrument(request_span("file_complete", &request_id.to_string()))
            .await
    }
}
