//! Error types for the orchestration domain.

use sluice_core::{DatasetId, RequestId};

use crate::broker::BrokerError;
use crate::cluster::ClusterError;
use crate::request::TransformStatus;

/// The result type used throughout sluice-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The submission is malformed or contradictory. No state was created.
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong with the submission.
        message: String,
    },

    /// A transform request was not found.
    #[error("request not found: {request_id}")]
    RequestNotFound {
        /// The request ID that was not found.
        request_id: RequestId,
    },

    /// A dataset was not found.
    #[error("dataset not found: {dataset_id}")]
    DatasetNotFound {
        /// The dataset ID that was not found.
        dataset_id: DatasetId,
    },

    /// The request already reached a terminal status.
    #[error("request {request_id} is already {status}")]
    AlreadyTerminal {
        /// The request.
        request_id: RequestId,
        /// Its terminal status.
        status: TransformStatus,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A broker operation failed.
    #[error("broker error{}: {source}", fmt_request(.request_id))]
    Broker {
        /// Request the operation was performed for.
        request_id: Option<RequestId>,
        /// The broker failure.
        #[source]
        source: BrokerError,
    },

    /// A cluster API operation failed.
    #[error("cluster error{}: {source}", fmt_request(.request_id))]
    Cluster {
        /// Request the operation was performed for.
        request_id: Option<RequestId>,
        /// The cluster failure.
        #[source]
        source: ClusterError,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A configuration value was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from sluice-core.
    #[error("core error: {0}")]
    Core(#[from] sluice_core::Error),
}

#[allow(clippy::ref_option)]
fn fmt_request(request_id: &Option<RequestId>) -> String {
    request_id.map_or_else(String::new, |id| format!(" (request {id})"))
}

impl Error {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wraps a broker failure for `request_id`.
    #[must_use]
    pub fn broker(request_id: Option<RequestId>, source: BrokerError) -> Self {
        Self::Broker { request_id, source }
    }

    /// Wraps a cluster failure for `request_id`.
    #[must_use]
    pub fn cluster(request_id: Option<RequestId>, source: ClusterError) -> Self {
        Self::Cluster { request_id, source }
    }

    /// Attaches `request_id` to infrastructure errors that lack one.
    #[must_use]
    pub fn with_request_id(self, id: RequestId) -> Self {
        match self {
            Self::Broker {
                request_id: None,
                source,
            } => Self::Broker {
                request_id: Some(id),
                source,
            },
            Self::Cluster {
                request_id: None,
                source,
            } => Self::Cluster {
                request_id: Some(id),
                source,
            },
            other => other,
        }
    }

    /// Returns the correlating request id, if the error carries one.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::RequestNotFound { request_id } | Self::AlreadyTerminal { request_id, .. } => {
                Some(*request_id)
            }
            Self::Broker { request_id, .. } | Self::Cluster { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Returns true for transient infrastructure failures worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { source, .. } => source.is_connection_level(),
            Self::Cluster { source, .. } => source.is_transient(),
            Self::Storage { .. } => true,
            _ => false,
        }
    }

    /// Returns true if a broker or cluster target was already absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Broker { source, .. } => source.is_not_found(),
            Self::Cluster { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::serialization(value.to_string())
    }
}
