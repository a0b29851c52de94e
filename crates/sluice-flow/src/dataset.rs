//! Dataset model.
//!
//! A dataset is the unit of resolution: one row per distinct name, shared by
//! every transform request that references it. Files are discovered by the
//! resolver, possibly in several batches, and are kept in discovery order.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sluice_core::{DatasetId, Did, FileId};

use crate::error::{Error, Result};

/// `did_finder` recorded for datasets built from an explicit file list.
pub const USER_FILE_LIST_FINDER: &str = "user";

/// Lookup status of a dataset.
///
/// ```text
/// created ──► looking ──► complete
/// ```
///
/// Datasets built from an explicit file list start out `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    /// Known by name, no lookup dispatched yet.
    Created,
    /// A lookup was dispatched and the resolver has not finished.
    Looking,
    /// The resolver finished; the file list is final.
    Complete,
}

impl DatasetStatus {
    /// Storage and wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Looking => "looking",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "looking" => Ok(Self::Looking),
            "complete" => Ok(Self::Complete),
            other => Err(Error::serialization(format!(
                "unknown dataset status '{other}'"
            ))),
        }
    }
}

/// A dataset row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Storage id.
    pub id: DatasetId,
    /// Unique name: a full DID, or the hash of an explicit file list.
    pub name: String,
    /// Resolver scheme that owns the lookup (`rucio`, `user`, ...).
    pub did_finder: String,
    /// Lookup status.
    pub lookup_status: DatasetStatus,
    /// File count reported by the resolver when the lookup completed.
    pub n_files: i64,
    /// Number of files discovered so far.
    pub known_files: i64,
    /// Total size in bytes reported by the resolver.
    pub size: i64,
    /// Total event count reported by the resolver.
    pub events: i64,
    /// Last time a submission referenced this dataset.
    pub last_used: DateTime<Utc>,
    /// Last time the row was updated.
    pub last_updated: DateTime<Utc>,
}

impl Dataset {
    /// True while no lookup has been dispatched.
    #[must_use]
    pub fn is_lookup_required(&self) -> bool {
        self.lookup_status == DatasetStatus::Created
    }

    /// True once the file list is final.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lookup_status == DatasetStatus::Complete
    }
}

/// A file discovered for a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFile {
    /// Storage id.
    pub id: FileId,
    /// Owning dataset.
    pub dataset_id: DatasetId,
    /// Zero-based position in discovery order.
    pub ordinal: i64,
    /// Replica paths, best candidate first.
    pub paths: Vec<String>,
    /// Adler-32 checksum reported by the resolver.
    pub adler32: Option<String>,
    /// Size in bytes.
    pub file_size: i64,
    /// Event count.
    pub file_events: i64,
}

/// A file reported by the resolver, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDatasetFile {
    /// Replica paths, best candidate first.
    pub paths: Vec<String>,
    /// Adler-32 checksum.
    #[serde(default)]
    pub adler32: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub file_size: i64,
    /// Event count.
    #[serde(default)]
    pub file_events: i64,
}

impl NewDatasetFile {
    /// A file known only by its path, as supplied in an explicit file list.
    #[must_use]
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            paths: vec![path.into()],
            adler32: None,
            file_size: 0,
            file_events: 0,
        }
    }
}

/// Insert payload for the atomic get-or-create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataset {
    /// Unique name.
    pub name: String,
    /// Resolver scheme.
    pub did_finder: String,
    /// Initial lookup status.
    pub lookup_status: DatasetStatus,
    /// Files inserted together with the row (explicit file lists only).
    pub files: Vec<NewDatasetFile>,
}

impl NewDataset {
    /// A dataset named by a DID, awaiting lookup.
    #[must_use]
    pub fn from_did(did: &Did) -> Self {
        Self {
            name: did.full_did(),
            did_finder: did.scheme().to_string(),
            lookup_status: DatasetStatus::Created,
            files: Vec::new(),
        }
    }

    /// A complete dataset built from an explicit file list.
    #[must_use]
    pub fn from_file_list(files: &[String]) -> Self {
        Self {
            name: file_list_hash(files),
            did_finder: USER_FILE_LIST_FINDER.to_string(),
            lookup_status: DatasetStatus::Complete,
            files: files.iter().map(NewDatasetFile::from_path).collect(),
        }
    }
}

/// Final totals reported when a lookup completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetTotals {
    /// File count.
    pub files: i64,
    /// Total bytes.
    pub size: i64,
    /// Total events.
    pub events: i64,
}

/// What a submission names as its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetIdentifier {
    /// A scheme-qualified dataset name.
    Did(Did),
    /// An explicit list of file paths.
    FileList(Vec<String>),
}

/// Deterministic name of an explicit file list: hex SHA-256 of the paths
/// joined by single spaces.
#[must_use]
pub fn file_list_hash(files: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(files.join(" ").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_hash_is_deterministic() {
        let files = vec!["root://a/1.root".to_string(), "root://a/2.root".to_string()];
        assert_eq!(file_list_hash(&files), file_list_hash(&files.clone()));
        assert_eq!(file_list_hash(&files).len(), 64);
    }

    #[test]
    fn file_list_hash_depends_on_order() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "x".to_string()];
        assert_ne!(file_list_hash(&a), file_list_hash(&b));
    }

    #[test]
    fn file_list_hash_matches_known_digest() {
        // sha256("a b")
        let files = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            file_list_hash(&files),
            "c8687a08aa5d6ed2044328fa6a697ab8e96dc34291e8c2034ae8c38e6fcc6d65"
        );
    }

    #[test]
    fn file_list_dataset_starts_complete() {
        let new = NewDataset::from_file_list(&["f1".to_string(), "f2".to_string()]);
        assert_eq!(new.lookup_status, DatasetStatus::Complete);
        assert_eq!(new.did_finder, USER_FILE_LIST_FINDER);
        assert_eq!(new.files.len(), 2);
        assert_eq!(new.files[0].paths, vec!["f1".to_string()]);
    }

    #[test]
    fn did_dataset_starts_created() {
        let did = Did::parse("rucio://scope:name", "rucio");
        let new = NewDataset::from_did(&did);
        assert_eq!(new.name, "rucio://scope:name");
        assert_eq!(new.did_finder, "rucio");
        assert_eq!(new.lookup_status, DatasetStatus::Created);
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            DatasetStatus::Created,
            DatasetStatus::Looking,
            DatasetStatus::Complete,
        ] {
            assert_eq!(status.as_str().parse::<DatasetStatus>().unwrap(), status);
        }
        assert!("gone".parse::<DatasetStatus>().is_err());
    }
}
