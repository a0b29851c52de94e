//! Pluggable storage for datasets, transform requests and file reports.
//!
//! ## Design Principles
//!
//! - **Atomic get-or-create**: one dataset row per name, even when many
//!   submissions race on a new name
//! - **CAS semantics**: every status change is a compare-and-swap, so exactly
//!   one caller wins each transition
//! - **Storage-side counters**: file completions are counted with a conditional
//!   increment in the store, never a read-modify-write in process memory
//! - **Testability**: in-memory implementation for tests, Postgres for production

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::{DatasetId, RequestId};

use crate::dataset::{Dataset, DatasetFile, DatasetStatus, DatasetTotals, NewDataset, NewDatasetFile};
use crate::error::{Error, Result};
use crate::request::{FileOutcome, TransformRequest, TransformStatus, TransformationResult};

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CasResult<T> {
    /// The swap was applied.
    Success,
    /// The row does not exist.
    NotFound,
    /// The row did not match the expected value.
    Mismatch {
        /// What was found instead.
        actual: T,
    },
}

impl<T> CasResult<T> {
    /// Returns true if the swap was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the row does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Outcome of a conditional file-counter increment.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterUpdate {
    /// The counter was incremented; carries the row as of the increment.
    Applied(TransformRequest),
    /// The request is terminal; nothing changed.
    Terminal(TransformStatus),
    /// Every published file is already accounted for; nothing changed.
    Saturated(TransformRequest),
    /// The request does not exist.
    NotFound,
}

/// Rejects `expected -> target` unless it is an edge of the request state
/// machine.
pub(crate) fn validate_transition(expected: TransformStatus, target: TransformStatus) -> Result<()> {
    if expected.can_transition_to(target) {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition {
            from: expected.to_string(),
            to: target.to_string(),
            reason: "not an edge of the request state machine".into(),
        })
    }
}

/// Storage abstraction for orchestration state.
///
/// Callbacks arrive on independent connections, possibly in different
/// processes, so every read-then-write below is a single atomic operation in
/// the backend.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Datasets ---

    /// Returns the dataset named `new.name`, creating it if absent.
    ///
    /// Concurrent calls with the same name create exactly one row. The flag
    /// is true only for the caller whose insert created it. Files in `new`
    /// are inserted together with the row.
    async fn get_or_create_dataset(&self, new: &NewDataset) -> Result<(Dataset, bool)>;

    /// Gets a dataset by id.
    async fn get_dataset(&self, id: DatasetId) -> Result<Option<Dataset>>;

    /// Gets a dataset by name.
    async fn find_dataset_by_name(&self, name: &str) -> Result<Option<Dataset>>;

    /// Sets `last_used`.
    async fn touch_dataset(&self, id: DatasetId, now: DateTime<Utc>) -> Result<()>;

    /// Moves the lookup status from `expected` to `target`.
    async fn cas_dataset_status(
        &self,
        id: DatasetId,
        expected: DatasetStatus,
        target: DatasetStatus,
    ) -> Result<CasResult<DatasetStatus>>;

    /// Appends discovered files, assigning consecutive ordinals after the
    /// current `known_files`. Returns the stored files.
    async fn append_dataset_files(
        &self,
        id: DatasetId,
        files: &[NewDatasetFile],
    ) -> Result<Vec<DatasetFile>>;

    /// Files with `from <= ordinal < to`, in ordinal order.
    async fn dataset_files(&self, id: DatasetId, from: i64, to: i64) -> Result<Vec<DatasetFile>>;

    /// Marks the lookup complete and records the resolver's totals.
    ///
    /// Returns the updated row, or `None` if the dataset does not exist.
    async fn complete_dataset(&self, id: DatasetId, totals: DatasetTotals)
        -> Result<Option<Dataset>>;

    // --- Requests ---

    /// Inserts a new request.
    async fn insert_request(&self, request: &TransformRequest) -> Result<()>;

    /// Gets a request by id.
    async fn get_request(&self, id: &RequestId) -> Result<Option<TransformRequest>>;

    /// Requests against `dataset` whose status is one of `statuses`.
    async fn requests_for_dataset(
        &self,
        dataset: DatasetId,
        statuses: &[TransformStatus],
    ) -> Result<Vec<TransformRequest>>;

    /// Moves a request from `expected` to `target`.
    ///
    /// A terminal `target` stamps `finish_time` in the same write, and
    /// `failure_description` is stored when given.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::InvalidStateTransition`] if the edge is
    /// not part of the state machine.
    async fn cas_request_status(
        &self,
        id: &RequestId,
        expected: TransformStatus,
        target: TransformStatus,
        failure_description: Option<String>,
    ) -> Result<CasResult<TransformStatus>>;

    /// Sets `files` to `new` if it is still `expected` and the request is not
    /// terminal. A mismatch carries the current row.
    async fn cas_request_files(
        &self,
        id: &RequestId,
        expected: i64,
        new: i64,
    ) -> Result<CasResult<TransformRequest>>;

    /// Increments `files_completed` or `files_failed`, only while the request
    /// is non-terminal and `files_completed + files_failed < files`.
    async fn increment_file_counter(
        &self,
        id: &RequestId,
        outcome: FileOutcome,
    ) -> Result<CounterUpdate>;

    // --- File reports ---

    /// Stores one file report.
    async fn record_transformation_result(&self, result: &TransformationResult) -> Result<()>;

    /// All reports for a request, oldest first.
    async fn transformation_results(&self, id: &RequestId) -> Result<Vec<TransformationResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_predicates() {
        assert!(CasResult::<DatasetStatus>::Success.is_success());
        assert!(CasResult::<DatasetStatus>::NotFound.is_not_found());
        let mismatch = CasResult::Mismatch {
            actual: DatasetStatus::Looking,
        };
        assert!(!mismatch.is_success());
        assert!(!mismatch.is_not_found());
    }

    #[test]
    fn terminal_statuses_cannot_be_left() {
        assert!(validate_transition(TransformStatus::Running, TransformStatus::Complete).is_ok());
        let err = validate_transition(TransformStatus::Complete, TransformStatus::Running)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }
}
