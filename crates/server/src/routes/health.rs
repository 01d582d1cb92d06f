use axum::response::Json;
use serde::Serialize;
use ts_rs::TS;
use utils::response::ApiResponse;

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct HealthStatus {
    pub status: String,
}

/// Liveness only; engine reachability has its own per-tenant endpoint.
pub async fn health_check() -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus {
        status: "ok".to_string(),
    }))
}
