//! Request lifecycle and completion tracking.
//!
//! The tracker drives every status change after a request row exists:
//!
//! ```text
//!              ┌──────────────► pending_lookup ──┐
//! submitted ───┼──────────────► lookup ──────────┼──► running ──► complete
//!              └─────────────────────────────────┘
//!        (any non-terminal) ──► fatal | canceled
//! ```
//!
//! Every edge is a compare-and-swap in the store, and file counters are
//! incremented by the store itself. When several callbacks race, exactly one
//! of them wins each transition and only the winner of a terminal transition
//! tears the fleet down.

use std::sync::Arc;

use chrono::Utc;

use sluice_core::{retry_with_backoff, DatasetId, RequestId, RetryPolicy};

use crate::dataset::NewDatasetFile;
use crate::error::{Error, Result};
use crate::fleet::FleetLifecycleManager;
use crate::messages::{FileCompleteReport, LookupSummary};
use crate::metrics::FlowMetrics;
use crate::request::{TransformRequest, TransformStatus, TransformationResult};
use crate::resolution::{DatasetHandle, DatasetResolutionCoordinator};
use crate::store::{CasResult, CounterUpdate, Store};

/// What a file-complete callback did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCompletion {
    /// The counter moved; `finalized` is true if this report completed the
    /// request.
    Counted {
        /// Whether the request became `complete`.
        finalized: bool,
    },
    /// The request was already terminal.
    IgnoredTerminal(TransformStatus),
    /// Every published file was already accounted for.
    IgnoredSurplus,
}

/// Owns request status transitions and the completion decision.
pub struct CompletionTracker {
    store: Arc<dyn Store>,
    coordinator: Arc<DatasetResolutionCoordinator>,
    fleet: Arc<FleetLifecycleManager>,
    namespace: String,
    retry: RetryPolicy,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("namespace", &self.namespace)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CompletionTracker {
    /// Creates a tracker.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        coordinator: Arc<DatasetResolutionCoordinator>,
        fleet: Arc<FleetLifecycleManager>,
        namespace: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            coordinator,
            fleet,
            namespace: namespace.into(),
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

    /// Namespace fleets are started in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn load(&self, id: &RequestId) -> Result<TransformRequest> {
        self.store
            .get_request(id)
            .await?
            .ok_or(Error::RequestNotFound { request_id: *id })
    }

    /// Applies `expected -> target`. Returns the status found on a mismatch.
    async fn transition(
        &self,
        id: &RequestId,
        expected: TransformStatus,
        target: TransformStatus,
        failure_description: Option<String>,
    ) -> Result<std::result::Result<(), TransformStatus>> {
        match self
            .store
            .cas_request_status(id, expected, target, failure_description)
            .await?
        {
            CasResult::Success => {
                self.metrics
                    .record_transition(expected.as_str(), target.as_str());
                tracing::info!(request_id = %id, from = %expected, to = %target, "request transitioned");
                Ok(Ok(()))
            }
            CasResult::Mismatch { actual } => Ok(Err(actual)),
            CasResult::NotFound => Err(Error::RequestNotFound { request_id: *id }),
        }
    }

    /// Moves a freshly stored request out of `submitted`.
    ///
    /// - Dataset needs a lookup and this submission claims it: `lookup`.
    /// - Dataset already complete: its files are published and the request
    ///   goes `running` (or `fatal` if the dataset is empty).
    /// - Lookup in flight elsewhere: `pending_lookup`. The dataset is then
    ///   re-read so a lookup that finished, or was released, in the meantime
    ///   is not missed.
    ///
    /// Returns the resulting status.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the lookup dispatch or the file
    /// fan-out failed; the request has been marked `fatal` by then.
    #[tracing::instrument(skip(self, request, dataset), fields(request_id = %request.request_id))]
    pub async fn on_submission(
        &self,
        request: &TransformRequest,
        dataset: &mut DatasetHandle,
    ) -> Result<TransformStatus> {
        let id = request.request_id;

        if dataset.is_lookup_required() {
            if let Some(status) = self
                .claim_lookup(&id, TransformStatus::Submitted, dataset)
                .await?
            {
                return Ok(status);
            }
        }

        if dataset.is_complete() {
            return self.start_running(&id, TransformStatus::Submitted).await;
        }

        if let Err(actual) = self
            .transition(&id, TransformStatus::Submitted, TransformStatus::PendingLookup, None)
            .await?
        {
            return Ok(actual);
        }
        self.await_lookup(&id, dataset).await
    }

    /// Re-reads the dataset of a `pending_lookup` request. Starts the request
    /// if the lookup already finished, and claims the lookup itself if the
    /// previous claim was released.
    async fn await_lookup(&self, id: &RequestId, dataset: &mut DatasetHandle) -> Result<TransformStatus> {
        self.coordinator.refresh(dataset).await?;
        if dataset.is_lookup_required() {
            if let Some(status) = self
                .claim_lookup(id, TransformStatus::PendingLookup, dataset)
                .await?
            {
                return Ok(status);
            }
        }
        if dataset.is_complete() {
            return self.start_running(id, TransformStatus::PendingLookup).await;
        }
        Ok(TransformStatus::PendingLookup)
    }

    /// Tries to claim and dispatch the dataset's lookup for a request in
    /// `from`. Returns `None` if another submission holds the claim.
    ///
    /// The resolver may answer before `from -> lookup` lands, while the
    /// callbacks cannot see the request yet, so the dataset is re-read after
    /// the swap.
    async fn claim_lookup(
        &self,
        id: &RequestId,
        from: TransformStatus,
        dataset: &mut DatasetHandle,
    ) -> Result<Option<TransformStatus>> {
        match self.coordinator.submit_lookup_request(dataset).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(err) => {
                let reason = format!("dataset lookup could not be dispatched: {err}");
                self.fail(id, reason.clone()).await?;
                self.fail_waiting(dataset.id(), &reason).await;
                return Err(err.with_request_id(*id));
            }
        }

        if let Err(actual) = self
            .transition(id, from, TransformStatus::Lookup, None)
            .await?
        {
            return Ok(Some(actual));
        }
        self.coordinator.refresh(dataset).await?;
        if dataset.is_complete() {
            return self.start_running(id, TransformStatus::Lookup).await.map(Some);
        }
        Ok(Some(TransformStatus::Lookup))
    }

    /// Fails every request still waiting on a lookup that could not be
    /// dispatched. Errors are logged.
    async fn fail_waiting(&self, dataset_id: DatasetId, reason: &str) {
        let waiting = match self
            .store
            .requests_for_dataset(dataset_id, &[TransformStatus::PendingLookup])
            .await
        {
            Ok(waiting) => waiting,
            Err(err) => {
                tracing::error!(dataset_id = %dataset_id, error = %err, "failed to list waiting requests");
                return;
            }
        };
        for request in waiting {
            if let Err(err) = self.fail(&request.request_id, reason).await {
                tracing::error!(request_id = %request.request_id, error = %err, "failed to mark request fatal");
            }
        }
    }

    /// Publishes the dataset to the request and moves it `from -> running`,
    /// then checks for completion. An empty dataset makes it `fatal`.
    async fn start_running(&self, id: &RequestId, from: TransformStatus) -> Result<TransformStatus> {
        let request = self.load(id).await?;
        if request.status != from {
            return Ok(request.status);
        }
        let dataset = self
            .store
            .get_dataset(request.did_id)
            .await?
            .ok_or(Error::DatasetNotFound {
                dataset_id: request.did_id,
            })?;
        if dataset.known_files == 0 {
            return self
                .fail(id, format!("dataset {} contains no files", dataset.name))
                .await;
        }

        let request = match self.coordinator.publish_files(&request).await {
            Ok(request) => request,
            Err(err) => {
                self.fail(id, format!("failed to publish files: {err}")).await?;
                return Err(err.with_request_id(*id));
            }
        };
        if request.status.is_terminal() {
            return Ok(request.status);
        }

        match self
            .transition(id, from, TransformStatus::Running, None)
            .await?
        {
            Ok(()) => {
                let request = self.load(id).await?;
                if self.try_finalize(&request).await? {
                    return Ok(TransformStatus::Complete);
                }
                Ok(TransformStatus::Running)
            }
            Err(actual) => Ok(actual),
        }
    }

    /// Stores a batch of discovered files and fans it out.
    ///
    /// Requests whose fan-out failed are marked `fatal`. Returns the number
    /// of files stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset is unknown or the files cannot be
    /// stored.
    #[tracing::instrument(skip(self, files), fields(dataset_id = %dataset_id))]
    pub async fn on_files_discovered(
        &self,
        dataset_id: DatasetId,
        files: &[NewDatasetFile],
    ) -> Result<usize> {
        let report = self.coordinator.add_files(dataset_id, files).await?;
        for (request_id, err) in report.failed {
            if let Err(fail_err) = self
                .fail(&request_id, format!("failed to publish files: {err}"))
                .await
            {
                tracing::error!(request_id = %request_id, error = %fail_err, "failed to mark request fatal");
            }
        }
        Ok(report.files.len())
    }

    /// Handles the resolver's completion callback.
    ///
    /// Requests waiting on the lookup go `running`, or `fatal` when the
    /// resolver failed or found nothing. Running requests get a completion
    /// check, since the dataset only now became final.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown dataset, or the first per-request
    /// error after every request has been handled.
    #[tracing::instrument(skip(self, summary), fields(dataset_id = %dataset_id))]
    pub async fn on_lookup_complete(
        &self,
        dataset_id: DatasetId,
        summary: &LookupSummary,
    ) -> Result<()> {
        let dataset = self
            .coordinator
            .complete_lookup(dataset_id, summary.totals())
            .await?;
        let failure = summary
            .failure()
            .map(|reason| format!("dataset {} could not be resolved: {reason}", dataset.name))
            .or_else(|| {
                (dataset.known_files == 0)
                    .then(|| format!("dataset {} contains no files", dataset.name))
            });

        let statuses = [
            TransformStatus::PendingLookup,
            TransformStatus::Lookup,
            TransformStatus::Running,
        ];
        let requests = self.store.requests_for_dataset(dataset_id, &statuses).await?;

        let mut first_error = None;
        for request in requests {
            let id = request.request_id;
            let result = match (&failure, request.status) {
                (Some(reason), _) => self.fail(&id, reason.clone()).await.map(drop),
                (None, TransformStatus::Running) => self.try_finalize(&request).await.map(drop),
                (None, status) => self.start_running(&id, status).await.map(drop),
            };
            if let Err(err) = result {
                tracing::error!(request_id = %id, error = %err, "lookup completion handling failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Handles a worker's file-complete report.
    ///
    /// The counter increment is retried on transient storage failures. A
    /// report for a terminal request, or one past the published total, is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] immediately for an unknown request,
    /// or the storage error once retries are exhausted.
    #[tracing::instrument(skip(self, report), fields(request_id = %request_id, file_id = %report.file_id))]
    pub async fn on_file_complete(
        &self,
        request_id: &RequestId,
        report: &FileCompleteReport,
    ) -> Result<FileCompletion> {
        let metrics = &self.metrics;
        let update = retry_with_backoff(
            &self.retry,
            "increment_file_counter",
            || self.store.increment_file_counter(request_id, report.status),
            |err: &Error| {
                let retry = err.is_retryable();
                if retry {
                    metrics.record_retry("increment_file_counter");
                }
                retry
            },
        )
        .await
        .map_err(|err| err.with_request_id(*request_id))?;

        let request = match update {
            CounterUpdate::Applied(request) => request,
            CounterUpdate::NotFound => {
                return Err(Error::RequestNotFound {
                    request_id: *request_id,
                })
            }
            CounterUpdate::Terminal(status) => {
                self.metrics.record_ignored_callback("terminal");
                tracing::debug!(%status, "report for terminal request ignored");
                return Ok(FileCompletion::IgnoredTerminal(status));
            }
            CounterUpdate::Saturated(request) => {
                self.metrics.record_ignored_callback("surplus");
                tracing::warn!(
                    files = request.files,
                    processed = request.files_processed(),
                    "surplus file report ignored"
                );
                return Ok(FileCompletion::IgnoredSurplus);
            }
        };

        self.metrics.record_file_completion(report.status.as_str());
        let result = TransformationResult {
            request_id: *request_id,
            file_id: report.file_id,
            file_path: report.file_path.clone(),
            status: report.status,
            total_time: report.total_time,
            total_events: report.total_events,
            total_bytes: report.total_bytes,
            avg_rate: report.avg_rate,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.record_transformation_result(&result).await {
            tracing::warn!(error = %err, "failed to record transformation result");
        }

        let finalized = self.try_finalize(&request).await?;
        Ok(FileCompletion::Counted { finalized })
    }

    /// Completes the request if it is running, its dataset is final and
    /// every published file is accounted for. The winner of the
    /// `running -> complete` swap shuts the fleet down.
    ///
    /// Returns true if this call completed the request.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn try_finalize(&self, request: &TransformRequest) -> Result<bool> {
        if request.status != TransformStatus::Running
            || request.files == 0
            || request.files_processed() != request.files
        {
            return Ok(false);
        }
        let final_count = self
            .store
            .get_dataset(request.did_id)
            .await?
            .is_some_and(|dataset| dataset.is_complete());
        if !final_count {
            return Ok(false);
        }

        let id = request.request_id;
        match self
            .transition(&id, TransformStatus::Running, TransformStatus::Complete, None)
            .await?
        {
            Ok(()) => {
                self.fleet.shutdown(&id, &self.namespace).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Cancels a request and tears its fleet down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyTerminal`] if the request already finished and
    /// [`Error::RequestNotFound`] if it does not exist.
    #[tracing::instrument(skip(self), fields(request_id = %id))]
    pub async fn cancel(&self, id: &RequestId) -> Result<TransformRequest> {
        let previous = self
            .terminate(id, TransformStatus::Canceled, Some("canceled by user".into()))
            .await?
            .map_err(|status| Error::AlreadyTerminal {
                request_id: *id,
                status,
            })?;
        if previous.may_own_fleet() {
            self.fleet.shutdown(id, &self.namespace).await;
        }
        self.load(id).await
    }

    /// Marks a request `fatal` with `reason` and tears its fleet down.
    ///
    /// Returns the request's final status; an already-terminal request is
    /// left as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] or a storage error.
    #[tracing::instrument(skip(self, reason), fields(request_id = %id))]
    pub async fn fail(&self, id: &RequestId, reason: impl Into<String>) -> Result<TransformStatus> {
        let reason = reason.into();
        match self
            .terminate(id, TransformStatus::Fatal, Some(reason.clone()))
            .await?
        {
            Ok(previous) => {
                tracing::warn!(%reason, "request failed");
                if previous.may_own_fleet() {
                    self.fleet.shutdown(id, &self.namespace).await;
                }
                Ok(TransformStatus::Fatal)
            }
            Err(status) => Ok(status),
        }
    }

    /// Swaps the current non-terminal status for `target`, following
    /// concurrent changes. Returns the status replaced, or the terminal status
    /// found.
    async fn terminate(
        &self,
        id: &RequestId,
        target: TransformStatus,
        description: Option<String>,
    ) -> Result<std::result::Result<TransformStatus, TransformStatus>> {
        let mut current = self.load(id).await?.status;
        loop {
            if current.is_terminal() {
                return Ok(Err(current));
            }
            match self
                .transition(id, current, target, description.clone())
                .await?
            {
                Ok(()) => return Ok(Ok(current)),
                Err(actual) => current = actual,
            }
        }
    }
}
