//! Worker fleet lifecycle.
//!
//! The manager is stateless: every cluster object is named from the request
//! id, so teardown needs nothing but the id and the namespace.
//!
//! | Object | Name |
//! |--------|------|
//! | Deployment | `transformer-<id>` |
//! | Autoscaler | `transformer-<id>` |
//! | Generated code | `<id>-generated-source` |
//! | Work / error queue | `<id>` / `<id>_errors` |
//!
//! Creates are retried on transient cluster failures. Teardown makes one
//! attempt per object, never stops early, and treats "already absent" as
//! success, so it can be re-run safely after a partial failure.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use sluice_core::{retry_with_backoff, RequestId, RetryPolicy};

use crate::cluster::kubernetes::GENERATED_CODE_VOLUME;
use crate::cluster::{
    AutoscalerSpec, ClusterApi, ClusterError, ConfigMapSpec, ContainerSpec, DeploymentSpec,
    DeploymentStatus, EnvVar,
};
use crate::codegen::GeneratedCode;
use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::request::TransformRequest;
use crate::topology::{error_queue_name, work_queue_name, QueueTopologyManager};

/// Prefix of deployment and autoscaler names.
pub const FLEET_NAME_PREFIX: &str = "transformer-";

/// Name of a request's deployment and autoscaler.
#[must_use]
pub fn fleet_name(request_id: &RequestId) -> String {
    format!("{FLEET_NAME_PREFIX}{request_id}")
}

/// Name of a request's generated-code config map.
#[must_use]
pub fn generated_code_name(request_id: &RequestId) -> String {
    format!("{request_id}-generated-source")
}

/// Initial replica count: the requested workers, at least one, and no more
/// than there are files (but at least one while nothing is published).
#[must_use]
pub fn replica_count(workers: u32, files: i64) -> u32 {
    let ceiling = u32::try_from(files.max(1)).unwrap_or(u32::MAX);
    workers.clamp(1, ceiling)
}

/// What happened to one object during teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownOutcome {
    /// The object was deleted.
    Deleted,
    /// The object was already gone.
    AlreadyAbsent,
    /// The deletion failed; the message is the cause.
    Failed(String),
}

impl TeardownOutcome {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Deleted,
            Err(err) if err.is_not_found() => Self::AlreadyAbsent,
            Err(err) => Self::Failed(err.to_string()),
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::AlreadyAbsent => "absent",
            Self::Failed(_) => "failed",
        }
    }

    /// Returns true unless the deletion failed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Per-object outcome of a fleet shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Request the fleet belonged to.
    pub request_id: RequestId,
    /// Autoscaler deletion.
    pub autoscaler: TeardownOutcome,
    /// Deployment deletion.
    pub deployment: TeardownOutcome,
    /// Generated-code config map deletion.
    pub generated_code: TeardownOutcome,
    /// Work queue deletion.
    pub work_queue: TeardownOutcome,
    /// Error queue deletion.
    pub error_queue: TeardownOutcome,
}

impl ShutdownReport {
    fn outcomes(&self) -> [(&'static str, &TeardownOutcome); 5] {
        [
            ("autoscaler", &self.autoscaler),
            ("deployment", &self.deployment),
            ("generated_code", &self.generated_code),
            ("work_queue", &self.work_queue),
            ("error_queue", &self.error_queue),
        ]
    }

    /// Returns true if no deletion failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outcomes().iter().all(|(_, outcome)| outcome.is_ok())
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .outcomes()
            .iter()
            .map(|(name, outcome)| format!("{name}={}", outcome.label()))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Starts and tears down per-request worker fleets.
pub struct FleetLifecycleManager {
    cluster: Arc<dyn ClusterApi>,
    topology: Arc<QueueTopologyManager>,
    config: FleetConfig,
    retry: RetryPolicy,
    metrics: FlowMetrics,
}

impl fmt::Debug for FleetLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetLifecycleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FleetLifecycleManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        topology: Arc<QueueTopologyManager>,
        config: FleetConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cluster,
            topology,
            config,
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

    /// Runs a create call with retries; an object that already exists was
    /// created by an earlier attempt and counts as success.
    async fn create_with_retry<F, Fut>(
        &self,
        request_id: &RequestId,
        operation: &'static str,
        create: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), ClusterError>>,
    {
        let metrics = &self.metrics;
        let result = retry_with_backoff(&self.retry, operation, create, |err: &ClusterError| {
            let retry = err.is_transient();
            if retry {
                metrics.record_retry(operation);
            }
            retry
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(ClusterError::AlreadyExists { kind, name }) => {
                tracing::debug!(%kind, %name, "object already exists");
                Ok(())
            }
            Err(source) => Err(Error::cluster(Some(*request_id), source)),
        }
    }

    /// Stores generated code as the request's config map.
    ///
    /// Returns the config map name.
    ///
    /// # Errors
    ///
    /// Returns an error if the config map cannot be created.
    #[tracing::instrument(skip(self, code), fields(request_id = %request_id))]
    pub async fn stage_generated_code(
        &self,
        request_id: &RequestId,
        namespace: &str,
        code: &GeneratedCode,
    ) -> Result<String> {
        let spec = ConfigMapSpec {
            name: generated_code_name(request_id),
            data: code.files.clone(),
        };
        self.create_with_retry(request_id, "create_config_map", || {
            self.cluster.create_config_map(namespace, &spec)
        })
        .await?;
        Ok(spec.name)
    }

    /// Builds the deployment for `request`.
    #[must_use]
    pub fn deployment_spec(&self, request: &TransformRequest) -> DeploymentSpec {
        let id = request.request_id;
        let name = fleet_name(&id);
        let labels = BTreeMap::from([("app".to_string(), name.clone())]);

        let env = vec![
            EnvVar::new("REQUEST_ID", id.to_string()),
            EnvVar::new("BROKER_URI", self.config.worker_broker_uri.clone()),
            EnvVar::new("RESULT_DESTINATION", request.result_destination.as_str()),
            EnvVar::new("RESULT_FORMAT", request.result_format.as_str()),
        ];
        let mounts = if request.generated_code_cm.is_some() {
            vec![(
                GENERATED_CODE_VOLUME.to_string(),
                self.config.generated_code_mount.clone(),
            )]
        } else {
            Vec::new()
        };

        let shared = &self.config.shared_dir;
        let sidecar = ContainerSpec {
            name: "sidecar".to_string(),
            image: self.config.sidecar_image.clone(),
            command: vec!["bash".to_string(), "-c".to_string()],
            args: vec![format!(
                "python /sluice/sidecar/transformer.py --shared-dir {shared} --request-id {id}"
            )],
            env: env.clone(),
            cpu_limit: self.config.cpu_limit.clone(),
            volume_mounts: mounts.clone(),
        };
        let transformer = ContainerSpec {
            name: "transformer".to_string(),
            image: request.image.clone(),
            command: vec!["bash".to_string(), "-c".to_string()],
            args: vec![format!(
                "PYTHONPATH={mount}:$PYTHONPATH bash {shared}/scripts/watch.sh {language} {command} {shared}/{id}",
                mount = self.config.generated_code_mount,
                language = request.transformer_language.as_deref().unwrap_or("python"),
                command = request.transformer_command.as_deref().unwrap_or_default(),
            )],
            env,
            cpu_limit: self.config.cpu_limit.clone(),
            volume_mounts: mounts,
        };

        DeploymentSpec {
            name,
            labels,
            replicas: replica_count(request.workers, request.files),
            // Sidecar first: containers start in this order.
            containers: vec![sidecar, transformer],
            generated_code_config_map: request.generated_code_cm.clone(),
        }
    }

    /// Builds the autoscaler for `request`.
    #[must_use]
    pub fn autoscaler_spec(&self, request: &TransformRequest) -> AutoscalerSpec {
        let name = fleet_name(&request.request_id);
        AutoscalerSpec {
            target_deployment: name.clone(),
            name,
            min_replicas: self.config.min_replicas,
            max_replicas: self.config.max_replicas,
            target_cpu_utilization: self.config.cpu_scale_threshold,
        }
    }

    /// Launches the request's deployment and, if enabled, its autoscaler.
    ///
    /// # Errors
    ///
    /// Returns an error if a create call fails after retries. Objects created
    /// before the failure are left for [`shutdown`](Self::shutdown).
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn start(&self, request: &TransformRequest, namespace: &str) -> Result<()> {
        let deployment = self.deployment_spec(request);
        let id = request.request_id;

        let result = async {
            self.create_with_retry(&id, "create_deployment", || {
                self.cluster.create_deployment(namespace, &deployment)
            })
            .await?;
            if self.config.autoscale_enabled {
                let autoscaler = self.autoscaler_spec(request);
                self.create_with_retry(&id, "create_autoscaler", || {
                    self.cluster.create_autoscaler(namespace, &autoscaler)
                })
                .await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        match &result {
            Ok(()) => {
                self.metrics.record_fleet_start("started");
                tracing::info!(replicas = deployment.replicas, "worker fleet started");
            }
            Err(err) => {
                self.metrics.record_fleet_start("failed");
                tracing::error!(error = %err, "failed to start worker fleet");
            }
        }
        result
    }

    /// Tears down every object belonging to the request.
    ///
    /// Each deletion is attempted regardless of the others. Absent objects
    /// are fine; other failures are logged and reported.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn shutdown(&self, request_id: &RequestId, namespace: &str) -> ShutdownReport {
        let fleet = fleet_name(request_id);
        let cluster = |result: std::result::Result<(), ClusterError>| {
            TeardownOutcome::from_result(
                result.map_err(|source| Error::cluster(Some(*request_id), source)),
            )
        };

        let autoscaler = cluster(self.cluster.delete_autoscaler(namespace, &fleet).await);
        let deployment = cluster(self.cluster.delete_deployment(namespace, &fleet).await);
        let generated_code = cluster(
            self.cluster
                .delete_config_map(namespace, &generated_code_name(request_id))
                .await,
        );
        let work_queue = TeardownOutcome::from_result(
            self.topology.delete_queue(&work_queue_name(request_id)).await,
        );
        let error_queue = TeardownOutcome::from_result(
            self.topology
                .delete_queue(&error_queue_name(request_id))
                .await,
        );

        let report = ShutdownReport {
            request_id: *request_id,
            autoscaler,
            deployment,
            generated_code,
            work_queue,
            error_queue,
        };
        for (resource, outcome) in report.outcomes() {
            self.metrics.record_teardown(resource, outcome.label());
            if let TeardownOutcome::Failed(message) = outcome {
                tracing::error!(resource, error = %message, "teardown step failed");
            }
        }
        tracing::info!(%report, "worker fleet shut down");
        report
    }

    /// Reads the deployment status; `None` if there is no deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster API call fails.
    pub async fn status(
        &self,
        request_id: &RequestId,
        namespace: &str,
    ) -> Result<Option<DeploymentStatus>> {
        self.cluster
            .deployment_status(namespace, &fleet_name(request_id))
            .await
            .map_err(|source| Error::cluster(Some(*request_id), source))
    }
}
