use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::provisioning_run::RunConfig;
use deployment::Deployment;
use engine_client::EngineHealthReport;
use serde::Deserialize;
use services::services::provisioning::{LaunchedRun, RunSnapshot, StepLogEntry};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError, middleware::RequestId};

#[derive(Debug, Default, Deserialize, TS)]
#[ts(export)]
pub struct StartProvisioningRequest {
    #[serde(default)]
    #[ts(optional)]
    pub config: Option<RunConfig>,
}

#[derive(Debug, Default, Deserialize, TS)]
#[ts(export)]
pub struct RetryProvisioningRequest {
    /// Only clear this step's failure
    #[serde(default)]
    #[ts(optional)]
    pub step: Option<String>,
}

#[derive(Debug, Deserialize, TS)]
#[ts(export)]
pub struct SkipStepRequest {
    pub step: String,
}

type SnapshotResponse = (StatusCode, ResponseJson<ApiResponse<RunSnapshot>>);

/// 202 when a background run was launched, 200 when there was nothing to do.
fn launched(run: LaunchedRun) -> SnapshotResponse {
    let status = if run.task.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, ResponseJson(ApiResponse::success(run.snapshot)))
}

pub async fn start_provisioning(
    State(deployment): State<DeploymentImpl>,
    Path(tenant_id): Path<String>,
    Extension(request_id): Extension<RequestId>,
    payload: Option<Json<StartProvisioningRequest>>,
) -> Result<SnapshotResponse, ApiError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let run = deployment
        .provisioning()
        .start(&tenant_id, payload.config, Some(request_id.as_str().to_string()))
        .await?;
    Ok(launched(run))
}

pub async fn get_status(
    State(deployment): State<DeploymentImpl>,
    Path(tenant_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<RunSnapshot>>, ApiError> {
    let snapshot = deployment.provisioning().status(&tenant_id).await?;
    Ok(ResponseJson(ApiResponse::success(snapshot)))
}

pub async fn retry_provisioning(
    State(deployment): State<DeploymentImpl>,
    Path(tenant_id): Path<String>,
    Extension(request_id): Extension<RequestId>,
    payload: Option<Json<RetryProvisioningRequest>>,
) -> Result<SnapshotResponse, ApiError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let step = payload.step.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let run = deployment
        .provisioning()
        .retry(&tenant_id, step, Some(request_id.as_str().to_string()))
        .await?;
    Ok(launched(run))
}

pub async fn continue_provisioning(
    State(deployment): State<DeploymentImpl>,
    Path(tenant_id): Path<String>,
    Extension(request_id): Extension<RequestId>,
) -> Result<SnapshotResponse, ApiError> {
    let run = deployment
        .provisioning()
        .continue_run(&tenant_id, Some(request_id.as_str().to_string()))
        .await?;
    Ok(launched(run))
}

pub async fn skip_step(
    State(deployment): State<DeploymentImpl>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<SkipStepRequest>,
) -> Result<ResponseJson<ApiResponse<RunSnapshot>>, ApiError> {
    let step = payload.step.trim();
    if step.is_empty() {
        return Err(ApiError::BadRequest("step must not be empty".into()));
    }
    let snapshot = deployment.provisioning().skip_step(&tenant_id, step).await?;
    Ok(ResponseJson(ApiResponse::success(snapshot)))
}

pub async fn get_logs(
    State(deployment): State<DeploymentImpl>,
    Path(tenant_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<Vec<StepLogEntry>>>, ApiError> {
    let logs = deployment.provisioning().logs(&tenant_id).await?;
    Ok(ResponseJson(ApiResponse::success(logs)))
}

pub async fn get_engine_health(
    State(deployment): State<DeploymentImpl>,
    Path(tenant_id): Path<String>,
) -> ResponseJson<ApiResponse<EngineHealthReport>> {
    let report = deployment.provisioning().engine_health(&tenant_id).await;
    ResponseJson(ApiResponse::success(report))
}

pub fn router() -> Router<DeploymentImpl> {
    let tenant_routes = Router::new()
        .route("/start", post(start_provisioning))
        .route("/status", get(get_status))
        .route("/retry", post(retry_provisioning))
        .route("/continue", post(continue_provisioning))
        .route("/skip", post(skip_step))
        .route("/logs", get(get_logs))
        .route("/engine-health", get(get_engine_health));

    Router::new().nest("/provisioning/{tenant_id}", tenant_routes)
}
