//! Cluster API abstraction.
//!
//! The fleet manager describes what it wants as plain specs
//! ([`DeploymentSpec`], [`AutoscalerSpec`], [`ConfigMapSpec`]); a
//! [`ClusterApi`] implementation turns them into cluster objects.
//!
//! - [`memory::InMemoryCluster`]: records objects in memory, for tests
//! - [`kubernetes::KubernetesApi`]: Kubernetes REST API over `reqwest`

pub mod kubernetes;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors raised by a cluster API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// An object with that name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// The API rejected the call.
    #[error("cluster API returned {status}: {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Server message.
        message: String,
    },

    /// The API could not be reached.
    #[error("cluster transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Returns true for failures worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound { .. } | Self::AlreadyExists { .. } => false,
        }
    }

    /// Returns true if the object is already absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// One environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Literal value.
    pub value: String,
}

impl EnvVar {
    /// Creates a variable.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One container of the worker pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint.
    pub command: Vec<String>,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment.
    pub env: Vec<EnvVar>,
    /// CPU limit, in cluster quantity notation.
    pub cpu_limit: String,
    /// Volume mounts as `(volume name, mount path)`.
    pub volume_mounts: Vec<(String, String)>,
}

/// A worker deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Deployment name.
    pub name: String,
    /// Pod labels, also used as the selector.
    pub labels: BTreeMap<String, String>,
    /// Initial replica count.
    pub replicas: u32,
    /// Containers, started in order.
    pub containers: Vec<ContainerSpec>,
    /// Config map mounted as the `generated-code` volume.
    pub generated_code_config_map: Option<String>,
}

/// A CPU-utilization autoscaler bound to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    /// Autoscaler name.
    pub name: String,
    /// Deployment it scales.
    pub target_deployment: String,
    /// Lower replica bound.
    pub min_replicas: u32,
    /// Upper replica bound.
    pub max_replicas: u32,
    /// Target average CPU utilization, in percent.
    pub target_cpu_utilization: u32,
}

/// A config map holding generated transformer code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapSpec {
    /// Config map name.
    pub name: String,
    /// File name to contents.
    pub data: BTreeMap<String, String>,
}

/// Observed status of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    /// Desired replicas.
    pub replicas: u32,
    /// Ready replicas.
    pub ready_replicas: u32,
    /// Available replicas.
    pub available_replicas: u32,
    /// Replicas that are not available.
    pub unavailable_replicas: u32,
}

/// Cluster operations used by the fleet manager. All calls are namespaced.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Creates a config map.
    async fn create_config_map(&self, namespace: &str, spec: &ConfigMapSpec)
        -> Result<(), ClusterError>;

    /// Deletes a config map.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Creates a deployment.
    async fn create_deployment(
        &self,
        namespace: &str,
        spec: &DeploymentSpec,
    ) -> Result<(), ClusterError>;

    /// Deletes a deployment.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Reads a deployment's status; `None` if it does not exist.
    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentStatus>, ClusterError>;

    /// Creates an autoscaler.
    async fn create_autoscaler(
        &self,
        namespace: &str,
        spec: &AutoscalerSpec,
    ) -> Result<(), ClusterError>;

    /// Deletes an autoscaler.
    async fn delete_autoscaler(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
