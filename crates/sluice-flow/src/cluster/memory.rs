//! In-memory cluster for testing.
//!
//! Objects are kept per namespace. Every call is counted, and errors can be
//! injected per operation with [`InMemoryCluster::inject`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    AutoscalerSpec, ClusterApi, ClusterError, ConfigMapSpec, DeploymentSpec, DeploymentStatus,
};

/// Cluster operations, used to target fault injection and read call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    /// [`ClusterApi::create_config_map`].
    CreateConfigMap,
    /// [`ClusterApi::delete_config_map`].
    DeleteConfigMap,
    /// [`ClusterApi::create_deployment`].
    CreateDeployment,
    /// [`ClusterApi::delete_deployment`].
    DeleteDeployment,
    /// [`ClusterApi::deployment_status`].
    DeploymentStatus,
    /// [`ClusterApi::create_autoscaler`].
    CreateAutoscaler,
    /// [`ClusterApi::delete_autoscaler`].
    DeleteAutoscaler,
}

type Key = (String, String);

#[derive(Debug, Default)]
struct ClusterState {
    config_maps: HashMap<Key, ConfigMapSpec>,
    deployments: HashMap<Key, (DeploymentSpec, DeploymentStatus)>,
    autoscalers: HashMap<Key, AutoscalerSpec>,
    faults: HashMap<ClusterOp, VecDeque<ClusterError>>,
    calls: HashMap<ClusterOp, usize>,
}

/// In-memory cluster for testing.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

fn poison_err<T>(_: PoisonError<T>) -> ClusterError {
    ClusterError::Transport("lock poisoned".into())
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn not_found(kind: &str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn already_exists(kind: &str, name: &str) -> ClusterError {
    ClusterError::AlreadyExists {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next calls of `op` fail with `errors`, in order.
    pub fn inject(&self, op: ClusterOp, errors: impl IntoIterator<Item = ClusterError>) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.entry(op).or_default().extend(errors);
        }
    }

    /// Number of times `op` was invoked, failed or not.
    #[must_use]
    pub fn calls(&self, op: ClusterOp) -> usize {
        self.state
            .lock()
            .map(|state| state.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// The stored deployment spec, if present.
    #[must_use]
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<DeploymentSpec> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.deployments.get(&key(namespace, name)).map(|(spec, _)| spec.clone()))
    }

    /// The stored autoscaler spec, if present.
    #[must_use]
    pub fn autoscaler(&self, namespace: &str, name: &str) -> Option<AutoscalerSpec> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.autoscalers.get(&key(namespace, name)).cloned())
    }

    /// The stored config map, if present.
    #[must_use]
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMapSpec> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.config_maps.get(&key(namespace, name)).cloned())
    }

    /// Total number of objects of every kind.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.config_maps.len() + state.deployments.len() + state.autoscalers.len())
            .unwrap_or(0)
    }

    /// Marks `ready` replicas of a deployment as ready and available.
    pub fn set_ready_replicas(&self, namespace: &str, name: &str, ready: u32) {
        if let Ok(mut state) = self.state.lock() {
            if let Some((_, status)) = state.deployments.get_mut(&key(namespace, name)) {
                status.ready_replicas = ready;
                status.available_replicas = ready;
                status.unavailable_replicas = status.replicas.saturating_sub(ready);
            }
        }
    }

    fn begin(&self, op: ClusterOp) -> Result<MutexGuard<'_, ClusterState>, ClusterError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create_config_map(
        &self,
        namespace: &str,
        spec: &ConfigMapSpec,
    ) -> Result<(), ClusterError> {
        let mut state = self.begin(ClusterOp::CreateConfigMap)?;
        let k = key(namespace, &spec.name);
        if state.config_maps.contains_key(&k) {
            return Err(already_exists("ConfigMap", &spec.name));
        }
        state.config_maps.insert(k, spec.clone());
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.begin(ClusterOp::DeleteConfigMap)?;
        state
            .config_maps
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("ConfigMap", name))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        spec: &DeploymentSpec,
    ) -> Result<(), ClusterError> {
        let mut state = self.begin(ClusterOp::CreateDeployment)?;
        let k = key(namespace, &spec.name);
        if state.deployments.contains_key(&k) {
            return Err(already_exists("Deployment", &spec.name));
        }
        let status = DeploymentStatus {
            replicas: spec.replicas,
            ready_replicas: 0,
            available_replicas: 0,
            unavailable_replicas: spec.replicas,
        };
        state.deployments.insert(k, (spec.clone(), status));
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.begin(ClusterOp::DeleteDeployment)?;
        state
            .deployments
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("Deployment", name))
    }

    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentStatus>, ClusterError> {
        let state = self.begin(ClusterOp::DeploymentStatus)?;
        Ok(state
            .deployments
            .get(&key(namespace, name))
            .map(|(_, status)| status.clone()))
    }

    async fn create_autoscaler(
        &self,
        namespace: &str,
        spec: &AutoscalerSpec,
    ) -> Result<(), ClusterError> {
        let mut state = self.begin(ClusterOp::CreateAutoscaler)?;
        let k = key(namespace, &spec.name);
        if state.autoscalers.contains_key(&k) {
            return Err(already_exists("HorizontalPodAutoscaler", &spec.name));
        }
        state.autoscalers.insert(k, spec.clone());
        Ok(())
    }

    async fn delete_autoscaler(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.begin(ClusterOp::DeleteAutoscaler)?;
        state
            .autoscalers
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("HorizontalPodAutoscaler", name))
    }
}
