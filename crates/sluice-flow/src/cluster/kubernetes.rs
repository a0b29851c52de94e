//! Kubernetes cluster API over REST.
//!
//! [`KubernetesApi`] speaks to the API server directly with `reqwest`, using
//! the service-account bearer token mounted into the pod. Manifests are built
//! from the [`super`] specs with `serde_json::json!`.
//!
//! | Object | Path |
//! |--------|------|
//! | Deployment | `/apis/apps/v1/namespaces/{ns}/deployments` |
//! | HorizontalPodAutoscaler | `/apis/autoscaling/v1/namespaces/{ns}/horizontalpodautoscalers` |
//! | ConfigMap | `/api/v1/namespaces/{ns}/configmaps` |

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    AutoscalerSpec, ClusterApi, ClusterError, ConfigMapSpec, DeploymentSpec, DeploymentStatus,
};

/// Default location of the mounted service-account token.
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Volume name the generated-code config map is mounted under.
pub const GENERATED_CODE_VOLUME: &str = "generated-code";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// API server base URL, e.g. `https://kubernetes.default.svc`.
    pub api_url: String,
    /// Path of the bearer token file. No token is sent if `None`.
    pub token_path: Option<PathBuf>,
}

impl KubernetesConfig {
    /// Creates a config using the in-cluster token path.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token_path: Some(PathBuf::from(DEFAULT_TOKEN_PATH)),
        }
    }

    /// Sets the token path.
    #[must_use]
    pub fn with_token_path(mut self, path: Option<PathBuf>) -> Self {
        self.token_path = path;
        self
    }
}

/// Cluster API backed by the Kubernetes REST API.
pub struct KubernetesApi {
    config: KubernetesConfig,
    client: reqwest::Client,
    token: Option<String>,
}

impl std::fmt::Debug for KubernetesApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesApi")
            .field("api_url", &self.config.api_url)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatusBody {
    #[serde(default)]
    replicas: u32,
    #[serde(default)]
    ready_replicas: u32,
    #[serde(default)]
    available_replicas: u32,
    #[serde(default)]
    unavailable_replicas: u32,
}

#[derive(Debug, Deserialize)]
struct DeploymentBody {
    #[serde(default)]
    status: DeploymentStatusBody,
}

fn transport_error(err: &reqwest::Error) -> ClusterError {
    ClusterError::Transport(err.to_string())
}

impl KubernetesApi {
    /// Creates a client, reading the bearer token if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be read or the HTTP client cannot
    /// be built.
    pub async fn new(config: KubernetesConfig) -> Result<Self, ClusterError> {
        let token = match &config.token_path {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| {
                        ClusterError::Transport(format!(
                            "failed to read token from {}: {e}",
                            path.display()
                        ))
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClusterError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            token,
        })
    }

    fn collection_url(&self, group_path: &str, namespace: &str, resource: &str) -> String {
        format!(
            "{}/{group_path}/namespaces/{namespace}/{resource}",
            self.config.api_url.trim_end_matches('/')
        )
    }

    fn deployments_url(&self, namespace: &str) -> String {
        self.collection_url("apis/apps/v1", namespace, "deployments")
    }

    fn autoscalers_url(&self, namespace: &str) -> String {
        self.collection_url("apis/autoscaling/v1", namespace, "horizontalpodautoscalers")
    }

    fn config_maps_url(&self, namespace: &str) -> String {
        self.collection_url("api/v1", namespace, "configmaps")
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        kind: &str,
        name: &str,
    ) -> Result<reqwest::Response, ClusterError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StatusBody>(&body)
            .map(|s| s.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(body);

        Err(match status.as_u16() {
            404 => ClusterError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 => ClusterError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            code => ClusterError::Api {
                status: code,
                message,
            },
        })
    }

    async fn create(
        &self,
        url: String,
        manifest: &Value,
        kind: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.send(self.client.post(url).json(manifest), kind, name)
            .await
            .map(|_| ())
    }

    async fn delete(&self, url: String, kind: &str, name: &str) -> Result<(), ClusterError> {
        let body = json!({ "propagationPolicy": "Background" });
        self.send(self.client.delete(url).json(&body), kind, name)
            .await
            .map(|_| ())
    }
}

/// Renders a deployment manifest.
#[must_use]
pub fn deployment_manifest(spec: &DeploymentSpec) -> Value {
    let containers: Vec<Value> = spec
        .containers
        .iter()
        .map(|c| {
            let env: Vec<Value> = c
                .env
                .iter()
                .map(|v| json!({ "name": v.name, "value": v.value }))
                .collect();
            let mounts: Vec<Value> = c
                .volume_mounts
                .iter()
                .map(|(volume, path)| json!({ "name": volume, "mountPath": path }))
                .collect();
            let mut container = json!({
                "name": c.name,
                "image": c.image,
                "imagePullPolicy": "IfNotPresent",
                "env": env,
                "volumeMounts": mounts,
                "resources": { "limits": { "cpu": c.cpu_limit } },
            });
            if !c.command.is_empty() {
                container["command"] = json!(c.command);
            }
            if !c.args.is_empty() {
                container["args"] = json!(c.args);
            }
            container
        })
        .collect();

    let volumes: Vec<Value> = spec
        .generated_code_config_map
        .iter()
        .map(|cm| json!({ "name": GENERATED_CODE_VOLUME, "configMap": { "name": cm } }))
        .collect();

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": spec.name, "labels": spec.labels },
        "spec": {
            "replicas": spec.replicas,
            "selector": { "matchLabels": spec.labels },
            "template": {
                "metadata": { "labels": spec.labels },
                "spec": {
                    "containers": containers,
                    "volumes": volumes,
                },
            },
        },
    })
}

/// Renders an autoscaler manifest.
#[must_use]
pub fn autoscaler_manifest(spec: &AutoscalerSpec) -> Value {
    json!({
        "apiVersion": "autoscaling/v1",
        "kind": "HorizontalPodAutoscaler",
        "metadata": { "name": spec.name },
        "spec": {
            "scaleTargetRef": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": spec.target_deployment,
            },
            "minReplicas": spec.min_replicas,
            "maxReplicas": spec.max_replicas,
            "targetCPUUtilizationPercentage": spec.target_cpu_utilization,
        },
    })
}

/// Renders a config map manifest.
#[must_use]
pub fn config_map_manifest(spec: &ConfigMapSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": spec.name },
        "data": spec.data,
    })
}

#[async_trait]
impl ClusterApi for KubernetesApi {
    async fn create_config_map(
        &self,
        namespace: &str,
        spec: &ConfigMapSpec,
    ) -> Result<(), ClusterError> {
        self.create(
            self.config_maps_url(namespace),
            &config_map_manifest(spec),
            "ConfigMap",
            &spec.name,
        )
        .await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let url = format!("{}/{name}", self.config_maps_url(namespace));
        self.delete(url, "ConfigMap", name).await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        spec: &DeploymentSpec,
    ) -> Result<(), ClusterError> {
        self.create(
            self.deployments_url(namespace),
            &deployment_manifest(spec),
            "Deployment",
            &spec.name,
        )
        .await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let url = format!("{}/{name}", self.deployments_url(namespace));
        self.delete(url, "Deployment", name).await
    }

    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentStatus>, ClusterError> {
        let url = format!("{}/{name}", self.deployments_url(namespace));
        let response = match self.send(self.client.get(url), "Deployment", name).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let body: DeploymentBody = response
            .json()
            .await
            .map_err(|e| ClusterError::Transport(format!("invalid deployment body: {e}")))?;
        Ok(Some(DeploymentStatus {
            replicas: body.status.replicas,
            ready_replicas: body.status.ready_replicas,
            available_replicas: body.status.available_replicas,
            unavailable_replicas: body.status.unavailable_replicas,
        }))
    }

    async fn create_autoscaler(
        &self,
        namespace: &str,
        spec: &AutoscalerSpec,
    ) -> Result<(), ClusterError> {
        self.create(
            self.autoscalers_url(namespace),
            &autoscaler_manifest(spec),
            "HorizontalPodAutoscaler",
            &spec.name,
        )
        .await
    }

    async fn delete_autoscaler(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let url = format!("{}/{name}", self.autoscalers_url(namespace));
        self.delete(url, "HorizontalPodAutoscaler", name).await
    }
}
