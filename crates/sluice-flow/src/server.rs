//! HTTP boundary for the gateway.
//!
//! ## Routes
//!
//! | Method | Path | Caller |
//! |--------|------|--------|
//! | `POST` | `/transformation` | client |
//! | `GET` | `/transformation/:id` | client |
//! | `GET` | `/transformation/:id/statistics` | client |
//! | `GET` | `/transformation/:id/deployment` | client |
//! | `POST` | `/transformation/:id/cancel` | client |
//! | `PUT` | `/internal/dataset/:id/files` | resolver |
//! | `PUT` | `/internal/dataset/:id/complete` | resolver |
//! | `PUT` | `/internal/transformation/:id/file-complete` | worker |
//! | `GET` | `/health`, `/metrics` | operators |

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use sluice_core::{DatasetId, RequestId};

use crate::cluster::DeploymentStatus;
use crate::error::Error;
use crate::gateway::{RequestGateway, RequestStatusView, Submission};
use crate::messages::{FileCompleteReport, FilesDiscovered, LookupSummary};
use crate::request::TransformStatistics;
use crate::tracker::FileCompletion;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Correlating request id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// An error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
                request_id: None,
            },
        }
    }

    /// HTTP status of the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let (status, code) = match &error {
            Error::Validation { .. } | Error::Core(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Error::RequestNotFound { .. } | Error::DatasetNotFound { .. } => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            Error::AlreadyTerminal { .. } => (StatusCode::CONFLICT, "CONFLICT"),
            Error::Broker { .. } | Error::Cluster { .. } | Error::Storage { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INFRASTRUCTURE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        if status.is_server_error() {
            tracing::error!(error = %error, "request failed");
        }
        let mut api = Self::new(status, code, error.to_string());
        api.body.request_id = error.request_id().map(|id| id.to_string());
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn parse_request_id(raw: &str) -> std::result::Result<RequestId, ApiError> {
    raw.parse()
        .map_err(|e: sluice_core::Error| ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string()))
}

/// Builds the router over `gateway`.
pub fn router(gateway: Arc<RequestGateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(crate::metrics::serve_metrics))
        .route("/transformation", post(submit))
        .route("/transformation/:id", get(status))
        .route("/transformation/:id/statistics", get(statistics))
        .route("/transformation/:id/deployment", get(deployment))
        .route("/transformation/:id/cancel", post(cancel))
        .route("/internal/dataset/:id/files", put(files_discovered))
        .route("/internal/dataset/:id/complete", put(lookup_complete))
        .route(
            "/internal/transformation/:id/file-complete",
            put(file_complete),
        )
        .with_state(gateway)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn submit(
    State(gateway): State<Arc<RequestGateway>>,
    Json(submission): Json<Submission>,
) -> ApiResult<serde_json::Value> {
    let request_id = gateway.submit(submission).await?;
    Ok(Json(json!({ "request_id": request_id })))
}

async fn status(
    State(gateway): State<Arc<RequestGateway>>,
    Path(id): Path<String>,
) -> ApiResult<RequestStatusView> {
    let id = parse_request_id(&id)?;
    Ok(Json(gateway.status(&id).await?))
}

async fn statistics(
    State(gateway): State<Arc<RequestGateway>>,
    Path(id): Path<String>,
) -> ApiResult<Option<TransformStatistics>> {
    let id = parse_request_id(&id)?;
    Ok(Json(gateway.statistics(&id).await?))
}

async fn deployment(
    State(gateway): State<Arc<RequestGateway>>,
    Path(id): Path<String>,
) -> ApiResult<Option<DeploymentStatus>> {
    let id = parse_request_id(&id)?;
    Ok(Json(gateway.fleet_status(&id).await?))
}

async fn cancel(
    State(gateway): State<Arc<RequestGateway>>,
    Path(id): Path<String>,
) -> ApiResult<RequestStatusView> {
    let id = parse_request_id(&id)?;
    Ok(Json(gateway.cancel(&id).await?.into()))
}

async fn files_discovered(
    State(gateway): State<Arc<RequestGateway>>,
    Path(id): Path<i64>,
    Json(files): Json<FilesDiscovered>,
) -> ApiResult<serde_json::Value> {
    let stored = gateway.files_discovered(DatasetId::new(id), files).await?;
    Ok(Json(json!({ "files": stored })))
}

async fn lookup_complete(
    State(gateway): State<Arc<RequestGateway>>,
    Path(id): Path<i64>,
    Json(summary): Json<LookupSummary>,
) -> ApiResult<serde_json::Value> {
    gateway.lookup_complete(DatasetId::new(id), summary).await?;
    Ok(Json(json!({})))
}

async fn file_complete(
    State(gateway): State<Arc<RequestGateway>>,
    Path(id): Path<String>,
    Json(report): Json<FileCompleteReport>,
) -> ApiResult<serde_json::Value> {
    let id = parse_request_id(&id)?;
    let body = match gateway.file_complete(&id, report).await? {
        FileCompletion::Counted { finalized } => json!({ "outcome": "counted", "finalized": finalized }),
        FileCompletion::IgnoredTerminal(status) => json!({ "outcome": "ignored", "status": status }),
        FileCompletion::IgnoredSurplus => json!({ "outcome": "ignored", "reason": "surplus" }),
    };
    Ok(Json(body))
}
