//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation of
//! the [`Store`] trait suitable for testing and local runs.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//!
//! Every operation takes one lock for its whole read-then-write, which gives
//! the same atomicity the Postgres backend gets from conditional updates.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::{DatasetId, FileId, RequestId};

use super::{validate_transition, CasResult, CounterUpdate, Store};
use crate::dataset::{
    Dataset, DatasetFile, DatasetStatus, DatasetTotals, NewDataset, NewDatasetFile,
};
use crate::error::{Error, Result};
use crate::request::{FileOutcome, TransformRequest, TransformStatus, TransformationResult};

#[derive(Debug, Default)]
struct State {
    datasets: HashMap<DatasetId, Dataset>,
    names: HashMap<String, DatasetId>,
    files: HashMap<DatasetId, Vec<DatasetFile>>,
    requests: HashMap<RequestId, TransformRequest>,
    results: Vec<TransformationResult>,
    next_dataset_id: i64,
    next_file_id: i64,
    increment_faults: usize,
}

impl State {
    fn append_files(&mut self, id: DatasetId, files: &[NewDatasetFile]) -> Vec<DatasetFile> {
        let start = self
            .datasets
            .get(&id)
            .map_or(0, |dataset| dataset.known_files);
        let mut stored = Vec::with_capacity(files.len());
        for (offset, file) in (0_i64..).zip(files) {
            self.next_file_id += 1;
            stored.push(DatasetFile {
                id: FileId::new(self.next_file_id),
                dataset_id: id,
                ordinal: start + offset,
                paths: file.paths.clone(),
                adler32: file.adler32.clone(),
                file_size: file.file_size,
                file_events: file.file_events,
            });
        }
        self.files.entry(id).or_default().extend(stored.iter().cloned());
        if let Some(dataset) = self.datasets.get_mut(&id) {
            dataset.known_files = start + i64::try_from(files.len()).unwrap_or(i64::MAX);
            dataset.last_updated = Utc::now();
        }
        stored
    }
}

/// In-memory store for testing.
///
/// ## Example
///
/// ```rust
/// use sluice_flow::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.dataset_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(poison_err)
    }

    /// Number of dataset rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dataset_count(&self) -> Result<usize> {
        Ok(self.lock()?.datasets.len())
    }

    /// Makes the next `count` counter increments fail with a retryable
    /// storage error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next_increments(&self, count: usize) -> Result<()> {
        self.lock()?.increment_faults = count;
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_or_create_dataset(&self, new: &NewDataset) -> Result<(Dataset, bool)> {
        let mut state = self.lock()?;
        if let Some(existing) = state
            .names
            .get(&new.name)
            .and_then(|id| state.datasets.get(id))
        {
            return Ok((existing.clone(), false));
        }

        state.next_dataset_id += 1;
        let id = DatasetId::new(state.next_dataset_id);
        let now = Utc::now();
        let n_files = i64::try_from(new.files.len()).unwrap_or(i64::MAX);
        let dataset = Dataset {
            id,
            name: new.name.clone(),
            did_finder: new.did_finder.clone(),
            lookup_status: new.lookup_status,
            n_files: if new.lookup_status == DatasetStatus::Complete {
                n_files
            } else {
                0
            },
            known_files: 0,
            size: 0,
            events: 0,
            last_used: now,
            last_updated: now,
        };
        state.names.insert(new.name.clone(), id);
        state.datasets.insert(id, dataset);
        state.append_files(id, &new.files);

        let created = state
            .datasets
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::storage("dataset vanished during insert"))?;
        drop(state);
        Ok((created, true))
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<Option<Dataset>> {
        Ok(self.lock()?.datasets.get(&id).cloned())
    }

    async fn find_dataset_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        let state = self.lock()?;
        Ok(state
            .names
            .get(name)
            .and_then(|id| state.datasets.get(id))
            .cloned())
    }

    async fn touch_dataset(&self, id: DatasetId, now: DateTime<Utc>) -> Result<()> {
        if let Some(dataset) = self.lock()?.datasets.get_mut(&id) {
            dataset.last_used = now;
        }
        Ok(())
    }

    async fn cas_dataset_status(
        &self,
        id: DatasetId,
        expected: DatasetStatus,
        target: DatasetStatus,
    ) -> Result<CasResult<DatasetStatus>> {
        let mut state = self.lock()?;
        let Some(dataset) = state.datasets.get_mut(&id) else {
            return Ok(CasResult::NotFound);
        };
        if dataset.lookup_status != expected {
            return Ok(CasResult::Mismatch {
                actual: dataset.lookup_status,
            });
        }
        dataset.lookup_status = target;
        dataset.last_updated = Utc::now();
        Ok(CasResult::Success)
    }

    async fn append_dataset_files(
        &self,
        id: DatasetId,
        files: &[NewDatasetFile],
    ) -> Result<Vec<DatasetFile>> {
        let mut state = self.lock()?;
        if !state.datasets.contains_key(&id) {
            return Err(Error::DatasetNotFound { dataset_id: id });
        }
        Ok(state.append_files(id, files))
    }

    async fn dataset_files(&self, id: DatasetId, from: i64, to: i64) -> Result<Vec<DatasetFile>> {
        let state = self.lock()?;
        Ok(state
            .files
            .get(&id)
            .map(|files| {
                files
                    .iter()
                    .filter(|f| f.ordinal >= from && f.ordinal < to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn complete_dataset(
        &self,
        id: DatasetId,
        totals: DatasetTotals,
    ) -> Result<Option<Dataset>> {
        let mut state = self.lock()?;
        let Some(dataset) = state.datasets.get_mut(&id) else {
            return Ok(None);
        };
        dataset.lookup_status = DatasetStatus::Complete;
        dataset.n_files = totals.files;
        dataset.size = totals.size;
        dataset.events = totals.events;
        dataset.last_updated = Utc::now();
        Ok(Some(dataset.clone()))
    }

    async fn insert_request(&self, request: &TransformRequest) -> Result<()> {
        let mut state = self.lock()?;
        if state.requests.contains_key(&request.request_id) {
            return Err(Error::storage(format!(
                "request {} already exists",
                request.request_id
            )));
        }
        state.requests.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<TransformRequest>> {
        Ok(self.lock()?.requests.get(id).cloned())
    }

    async fn requests_for_dataset(
        &self,
        dataset: DatasetId,
        statuses: &[TransformStatus],
    ) -> Result<Vec<TransformRequest>> {
        let state = self.lock()?;
        let mut matching: Vec<_> = state
            .requests
            .values()
            .filter(|r| r.did_id == dataset && statuses.contains(&r.status))
            .cloned()
            .collect();
        drop(state);
        matching.sort_by_key(|r| r.request_id);
        Ok(matching)
    }

    async fn cas_request_status(
        &self,
        id: &RequestId,
        expected: TransformStatus,
        target: TransformStatus,
        failure_description: Option<String>,
    ) -> Result<CasResult<TransformStatus>> {
        validate_transition(expected, target)?;
        let mut state = self.lock()?;
        let Some(request) = state.requests.get_mut(id) else {
            return Ok(CasResult::NotFound);
        };
        if request.status != expected {
            return Ok(CasResult::Mismatch {
                actual: request.status,
            });
        }
        request.status = target;
        if target.is_terminal() {
            request.finish_time = Some(Utc::now());
        }
        if failure_description.is_some() {
            request.failure_description = failure_description;
        }
        Ok(CasResult::Success)
    }

    async fn cas_request_files(
        &self,
        id: &RequestId,
        expected: i64,
        new: i64,
    ) -> Result<CasResult<TransformRequest>> {
        let mut state = self.lock()?;
        let Some(request) = state.requests.get_mut(id) else {
            return Ok(CasResult::NotFound);
        };
        if request.files != expected || request.status.is_terminal() {
            return Ok(CasResult::Mismatch {
                actual: request.clone(),
            });
        }
        request.files = new;
        Ok(CasResult::Success)
    }

    async fn increment_file_counter(
        &self,
        id: &RequestId,
        outcome: FileOutcome,
    ) -> Result<CounterUpdate> {
        let mut state = self.lock()?;
        if state.increment_faults > 0 {
            state.increment_faults -= 1;
            return Err(Error::storage("injected counter contention"));
        }
        let Some(request) = state.requests.get_mut(id) else {
            return Ok(CounterUpdate::NotFound);
        };
        if request.status.is_terminal() {
            return Ok(CounterUpdate::Terminal(request.status));
        }
        if request.is_saturated() {
            return Ok(CounterUpdate::Saturated(request.clone()));
        }
        match outcome {
            FileOutcome::Success => request.files_completed += 1,
            FileOutcome::Failure => request.files_failed += 1,
        }
        Ok(CounterUpdate::Applied(request.clone()))
    }

    async fn record_transformation_result(&self, result: &TransformationResult) -> Result<()> {
        self.lock()?.results.push(result.clone());
        Ok(())
    }

    async fn transformation_results(&self, id: &RequestId) -> Result<Vec<TransformationResult>> {
        Ok(self
            .lock()?
            .results
            .iter()
            .filter(|r| &r.request_id == id)
            .cloned()
            .collect())
    }
}
