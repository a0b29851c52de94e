//! Transform request model and state machine.
//!
//! ## State Machine
//!
//! ```text
//!              ┌──► pending_lookup ──┐
//!              │                     │
//! submitted ───┼──► lookup ──────────┼──► running ──► complete
//!              │                     │       │
//!              └─────────────────────┘       │
//!                                            ▼
//!                      (any non-terminal) ──► fatal | canceled
//! ```
//!
//! `complete`, `fatal` and `canceled` are terminal. A request never changes
//! after it reaches one of them, and `finish_time` is stamped by the same
//! write that makes the status terminal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::{DatasetId, FileId, RequestId};

use crate::error::{Error, Result};

/// Maximum length of a request title.
pub const MAX_TITLE_LEN: usize = 128;

/// Status of a transform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    /// Row created, dataset handling not decided yet.
    Submitted,
    /// Another request owns the dataset lookup; waiting for its fan-out.
    PendingLookup,
    /// This request dispatched the dataset lookup.
    Lookup,
    /// Files are published and workers are consuming them.
    Running,
    /// Every file has been reported (terminal).
    Complete,
    /// The request cannot produce output (terminal).
    Fatal,
    /// Canceled by the user (terminal).
    Canceled,
}

impl TransformStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Submitted,
        Self::PendingLookup,
        Self::Lookup,
        Self::Running,
        Self::Complete,
        Self::Fatal,
        Self::Canceled,
    ];

    /// Statuses that receive dataset fan-out.
    pub const AWAITING_LOOKUP: [Self; 2] = [Self::PendingLookup, Self::Lookup];

    /// Returns true for `complete`, `fatal` and `canceled`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fatal | Self::Canceled)
    }

    /// Returns true if the request may already own a worker fleet.
    #[must_use]
    pub const fn may_own_fleet(&self) -> bool {
        !matches!(self, Self::Submitted)
    }

    /// Returns true if `self -> target` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        use TransformStatus::{
            Canceled, Complete, Fatal, Lookup, PendingLookup, Running, Submitted,
        };
        matches!(
            (*self, target),
            (Submitted, PendingLookup | Lookup | Running | Fatal | Canceled)
                | (PendingLookup | Lookup, Running | Fatal | Canceled)
                | (Running, Complete | Fatal | Canceled)
        )
    }

    /// Storage and wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::PendingLookup => "pending_lookup",
            Self::Lookup => "lookup",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Fatal => "fatal",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TransformStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::serialization(format!("unknown transform status '{s}'")))
    }
}

/// Where workers write their output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultDestination {
    /// An object-store bucket named after the request.
    #[serde(rename = "object-store")]
    ObjectStore,
    /// A shared persistent volume.
    #[serde(rename = "volume")]
    Volume,
}

impl ResultDestination {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectStore => "object-store",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResultDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultDestination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "object-store" => Ok(Self::ObjectStore),
            "volume" => Ok(Self::Volume),
            other => Err(Error::validation(format!(
                "unsupported result destination '{other}'"
            ))),
        }
    }
}

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultFormat {
    /// Arrow record batches.
    #[serde(rename = "arrow")]
    Arrow,
    /// Parquet files.
    #[serde(rename = "parquet")]
    Parquet,
    /// ROOT files.
    #[serde(rename = "root-file")]
    RootFile,
}

impl ResultFormat {
    /// Format used when a submission names none.
    #[must_use]
    pub const fn default_for(destination: ResultDestination) -> Self {
        match destination {
            ResultDestination::ObjectStore => Self::Arrow,
            ResultDestination::Volume => Self::Parquet,
        }
    }

    /// Returns true if workers can write this format to `destination`.
    #[must_use]
    pub const fn supports(&self, destination: ResultDestination) -> bool {
        !matches!((destination, self), (ResultDestination::Volume, Self::Arrow))
    }

    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Arrow => "arrow",
            Self::Parquet => "parquet",
            Self::RootFile => "root-file",
        }
    }
}

impl fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arrow" => Ok(Self::Arrow),
            "parquet" => Ok(Self::Parquet),
            "root-file" => Ok(Self::RootFile),
            other => Err(Error::validation(format!(
                "unsupported result format '{other}'"
            ))),
        }
    }
}

/// A transform request row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    /// Generated request id.
    pub request_id: RequestId,
    /// Optional user-supplied title.
    pub title: Option<String>,
    /// Dataset display name.
    pub did: String,
    /// Dataset storage id.
    pub did_id: DatasetId,
    /// Selection or column expression handed to the code generator.
    pub selection: String,
    /// Tree (table) name inside the input files.
    pub tree_name: Option<String>,
    /// Worker image.
    pub image: String,
    /// Requested worker count.
    pub workers: u32,
    /// Output destination.
    pub result_destination: ResultDestination,
    /// Output format.
    pub result_format: ResultFormat,
    /// Current status.
    pub status: TransformStatus,
    /// Number of dataset files published to this request.
    pub files: i64,
    /// Files reported as successfully transformed.
    pub files_completed: i64,
    /// Files reported as failed.
    pub files_failed: i64,
    /// Submission time.
    pub submit_time: DateTime<Utc>,
    /// Set once, when the status first becomes terminal.
    pub finish_time: Option<DateTime<Utc>>,
    /// Name of the generated-code artifact.
    pub generated_code_cm: Option<String>,
    /// Language of the generated transformer.
    pub transformer_language: Option<String>,
    /// Command that runs the generated transformer.
    pub transformer_command: Option<String>,
    /// Reason attached to `fatal` requests.
    pub failure_description: Option<String>,
}

impl TransformRequest {
    /// Files reported so far, successful or not.
    #[must_use]
    pub const fn files_processed(&self) -> i64 {
        self.files_completed + self.files_failed
    }

    /// Files still outstanding, or `None` while nothing has been published.
    #[must_use]
    pub const fn files_remaining(&self) -> Option<i64> {
        if self.files == 0 {
            None
        } else {
            Some(self.files - self.files_processed())
        }
    }

    /// Returns true if another file report would exceed the published total.
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        self.files_processed() >= self.files
    }
}

/// Outcome of one file transform, as reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOutcome {
    /// The file was transformed.
    Success,
    /// The worker gave up on the file.
    Failure,
}

impl FileOutcome {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// One file-completion report. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationResult {
    /// Request the file belongs to.
    pub request_id: RequestId,
    /// Dataset file id.
    pub file_id: FileId,
    /// Path the worker read.
    pub file_path: String,
    /// Outcome.
    pub status: FileOutcome,
    /// Wall time in seconds.
    pub total_time: f64,
    /// Events processed.
    pub total_events: i64,
    /// Bytes written.
    pub total_bytes: i64,
    /// Events per second.
    pub avg_rate: f64,
    /// When the report was stored.
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate statistics over a request's file reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStatistics {
    /// Number of reports.
    pub total_files: usize,
    /// Shortest file time in seconds.
    pub min_time: f64,
    /// Longest file time in seconds.
    pub max_time: f64,
    /// Mean file time in seconds.
    pub avg_time: f64,
    /// Sum of file times in seconds.
    pub total_time: f64,
    /// Mean events per second.
    pub avg_rate: f64,
    /// Bytes written.
    pub total_bytes: i64,
    /// Events processed.
    pub total_events: i64,
}

impl TransformStatistics {
    /// Aggregates `results`. Returns `None` when there are none.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_results(results: &[TransformationResult]) -> Option<Self> {
        if results.is_empty() {
            return None;
        }
        let count = results.len() as f64;
        let total_time: f64 = results.iter().map(|r| r.total_time).sum();
        let min_time = results.iter().map(|r| r.total_time).fold(f64::INFINITY, f64::min);
        let max_time = results
            .iter()
            .map(|r| r.total_time)
            .fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            total_files: results.len(),
            min_time,
            max_time,
            avg_time: total_time / count,
            total_time,
            avg_rate: results.iter().map(|r| r.avg_rate).sum::<f64>() / count,
            total_bytes: results.iter().map(|r| r.total_bytes).sum(),
            total_events: results.iter().map(|r| r.total_events).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<_> = TransformStatus::ALL
            .into_iter()
            .filter(TransformStatus::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![
                TransformStatus::Complete,
                TransformStatus::Fatal,
                TransformStatus::Canceled
            ]
        );
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in TransformStatus::ALL.into_iter().filter(TransformStatus::is_terminal) {
            for to in TransformStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn complete_is_only_reachable_from_running() {
        for from in TransformStatus::ALL {
            assert_eq!(
                from.can_transition_to(TransformStatus::Complete),
                from == TransformStatus::Running
            );
        }
    }

    #[test]
    fn every_live_status_can_be_canceled() {
        for from in TransformStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(TransformStatus::Canceled));
            assert!(from.can_transition_to(TransformStatus::Fatal));
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TransformStatus::PendingLookup).unwrap();
        assert_eq!(json, "\"pending_lookup\"");
        assert_eq!(
            "pending_lookup".parse::<TransformStatus>().unwrap(),
            TransformStatus::PendingLookup
        );
    }

    #[test]
    fn format_defaults_follow_destination() {
        assert_eq!(
            ResultFormat::default_for(ResultDestination::ObjectStore),
            ResultFormat::Arrow
        );
        assert_eq!(
            ResultFormat::default_for(ResultDestination::Volume),
            ResultFormat::Parquet
        );
        assert!(!ResultFormat::Arrow.supports(ResultDestination::Volume));
        assert!(ResultFormat::RootFile.supports(ResultDestination::Volume));
    }

    #[test]
    fn destination_and_format_wire_names() {
        assert_eq!(
            serde_json::to_string(&ResultDestination::ObjectStore).unwrap(),
            "\"object-store\""
        );
        assert_eq!(
            serde_json::to_string(&ResultFormat::RootFile).unwrap(),
            "\"root-file\""
        );
        assert!("s3".parse::<ResultDestination>().is_err());
    }

    fn result(time: f64, rate: f64, bytes: i64, events: i64) -> TransformationResult {
        TransformationResult {
            request_id: RequestId::generate(),
            file_id: FileId::new(1),
            file_path: "root://f".into(),
            status: FileOutcome::Success,
            total_time: time,
            total_events: events,
            total_bytes: bytes,
            avg_rate: rate,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn statistics_aggregate_results() {
        let stats = TransformStatistics::from_results(&[
            result(2.0, 10.0, 100, 20),
            result(4.0, 30.0, 300, 40),
        ])
        .unwrap();
        assert_eq!(stats.total_files, 2);
        assert!((stats.min_time - 2.0).abs() < f64::EPSILON);
        assert!((stats.max_time - 4.0).abs() < f64::EPSILON);
        assert!((stats.avg_time - 3.0).abs() < f64::EPSILON);
        assert!((stats.total_time - 6.0).abs() < f64::EPSILON);
        assert!((stats.avg_rate - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.total_bytes, 400);
        assert_eq!(stats.total_events, 60);
    }

    #[test]
    fn statistics_of_nothing_is_none() {
        assert!(TransformStatistics::from_results(&[]).is_none());
    }
}
