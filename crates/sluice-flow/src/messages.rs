//! Wire payloads exchanged with the resolver and with workers.

use serde::{Deserialize, Serialize};

use sluice_core::{DatasetId, FileId, RequestId};

use crate::dataset::{DatasetFile, DatasetTotals, NewDatasetFile};
use crate::request::{FileOutcome, ResultDestination, ResultFormat, TransformRequest};

/// Path (relative to the advertised endpoint) of the resolver callbacks.
pub const DATASET_CALLBACK_PATH: &str = "internal/dataset/";

/// Path prefix (relative to the advertised endpoint) of the worker callbacks.
pub const TRANSFORMATION_CALLBACK_PATH: &str = "internal/transformation/";

/// Joins an advertised base URL and a relative path with exactly one slash.
#[must_use]
pub fn join_endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Lookup request sent to a resolver's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupDispatch {
    /// Dataset to resolve.
    pub dataset_id: DatasetId,
    /// Dataset name without its scheme.
    pub name: String,
    /// Base URL the resolver reports back to.
    pub callback_endpoint: String,
}

/// One file handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Owning request.
    pub request_id: RequestId,
    /// Dataset file id, echoed back in the completion report.
    pub file_id: FileId,
    /// Replica paths.
    pub paths: Vec<String>,
    /// Where the worker posts its completion report.
    pub service_endpoint: String,
    /// Output destination.
    pub result_destination: ResultDestination,
    /// Output format.
    pub result_format: ResultFormat,
}

impl WorkItem {
    /// Builds the work item for `file` on behalf of `request`.
    #[must_use]
    pub fn new(request: &TransformRequest, file: &DatasetFile, advertised_endpoint: &str) -> Self {
        Self {
            request_id: request.request_id,
            file_id: file.id,
            paths: file.paths.clone(),
            service_endpoint: join_endpoint(
                advertised_endpoint,
                &format!("{TRANSFORMATION_CALLBACK_PATH}{}", request.request_id),
            ),
            result_destination: request.result_destination,
            result_format: request.result_format,
        }
    }
}

/// Body of the "files discovered" callback: one file or a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilesDiscovered {
    /// A single file.
    One(NewDatasetFile),
    /// A batch of files.
    Many(Vec<NewDatasetFile>),
}

impl FilesDiscovered {
    /// Flattens into a list.
    #[must_use]
    pub fn into_files(self) -> Vec<NewDatasetFile> {
        match self {
            Self::One(file) => vec![file],
            Self::Many(files) => files,
        }
    }
}

/// Body of the "lookup complete" callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupSummary {
    /// Final file count.
    pub files: i64,
    /// Total event count.
    #[serde(default, alias = "total-events")]
    pub total_events: i64,
    /// Total size in bytes.
    #[serde(default, alias = "total-bytes")]
    pub total_bytes: i64,
    /// Resolver wall time in seconds.
    #[serde(default, alias = "elapsed-time")]
    pub elapsed_time: Option<f64>,
    /// Set when the resolver could not locate the dataset.
    #[serde(default)]
    pub error: Option<String>,
}

impl LookupSummary {
    /// Totals to store on the dataset.
    #[must_use]
    pub const fn totals(&self) -> DatasetTotals {
        DatasetTotals {
            files: self.files,
            size: self.total_bytes,
            events: self.total_events,
        }
    }

    /// The resolver's error, if it reported a non-empty one.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.error.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}

/// Body of the worker "file complete" callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCompleteReport {
    /// Dataset file id from the work item.
    #[serde(alias = "file-id")]
    pub file_id: FileId,
    /// Path the worker read.
    #[serde(default, alias = "file-path")]
    pub file_path: String,
    /// Outcome.
    pub status: FileOutcome,
    /// Wall time in seconds.
    #[serde(default, alias = "total-time")]
    pub total_time: f64,
    /// Events processed.
    #[serde(default, alias = "total-events")]
    pub total_events: i64,
    /// Bytes written.
    #[serde(default, alias = "total-bytes")]
    pub total_bytes: i64,
    /// Events per second.
    #[serde(default, alias = "avg-rate")]
    pub avg_rate: f64,
}
