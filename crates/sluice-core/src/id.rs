//! Strongly-typed identifiers for sluice entities.
//!
//! - [`RequestId`] is generated by the gateway when a submission is accepted.
//!   It is a ULID, so identifiers sort by submission time and need no
//!   coordination to stay unique.
//! - [`DatasetId`] and [`FileId`] are assigned by the store when a row is
//!   inserted.
//!
//! Request ids end up in cluster object names and broker queue names, so
//! their string form is lowercase.
//!
//! # Example
//!
//! ```rust
//! use sluice_core::id::{DatasetId, RequestId};
//!
//! let request = RequestId::generate();
//! let parsed: RequestId = request.to_string().parse().unwrap();
//! assert_eq!(request, parsed);
//!
//! let dataset = DatasetId::new(7);
//! assert_eq!(dataset.get(), 7);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a transform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(Ulid);

impl RequestId {
    /// Generates a new unique request ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a request ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the submission timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_ascii_lowercase())
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(&s.to_ascii_uppercase())
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid request ID '{s}': {e}"),
            })
    }
}

impl TryFrom<String> for RequestId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RequestId> for String {
    fn from(value: RequestId) -> Self {
        value.to_string()
    }
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw storage row id.
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw storage row id.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.trim().parse::<i64>().map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                })
            }
        }
    };
}

row_id!(
    /// Storage identifier of a dataset row.
    DatasetId,
    "dataset"
);

row_id!(
    /// Storage identifier of a dataset file row.
    FileId,
    "file"
);
