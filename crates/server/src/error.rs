use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::provisioning_run::ProvisioningRunError;
use deployment::DeploymentError;
use services::services::provisioning::ProvisioningError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl From<ProvisioningRunError> for ApiError {
    fn from(err: ProvisioningRunError) -> Self {
        match err {
            ProvisioningRunError::Database(e) => ApiError::Database(e),
            ProvisioningRunError::NotFound => ApiError::NotFound("Provisioning run not found".into()),
            other => ApiError::Provisioning(ProvisioningError::Run(other)),
        }
    }
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Provisioning(err) => match err {
                ProvisioningError::AlreadyRunning(_) => (StatusCode::CONFLICT, "AlreadyRunning"),
                ProvisioningError::Conflict(_) => (StatusCode::CONFLICT, "ConcurrentModification"),
                ProvisioningError::NotInProgress(_) => (StatusCode::CONFLICT, "NotInProgress"),
                ProvisioningError::EngineUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "EngineUnavailable")
                }
                ProvisioningError::RunNotFound(_) => (StatusCode::NOT_FOUND, "RunNotFound"),
                ProvisioningError::UnknownStep(_) => (StatusCode::BAD_REQUEST, "UnknownStep"),
                ProvisioningError::StepNotOptional(_) => {
                    (StatusCode::BAD_REQUEST, "StepNotOptional")
                }
                ProvisioningError::StepNotFailed(_) => (StatusCode::BAD_REQUEST, "StepNotFailed"),
                ProvisioningError::StepAlreadySucceeded(_) => {
                    (StatusCode::BAD_REQUEST, "StepAlreadySucceeded")
                }
                ProvisioningError::Run(ProvisioningRunError::NotFound) => {
                    (StatusCode::NOT_FOUND, "RunNotFound")
                }
                ProvisioningError::Run(ProvisioningRunError::NotInProgress) => {
                    (StatusCode::CONFLICT, "NotInProgress")
                }
                ProvisioningError::Run(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "ProvisioningRunError")
                }
            },
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = self.status_and_type();

        let error_message = match &self {
            // Domain errors already read well on their own.
            ApiError::Provisioning(ProvisioningError::Run(_)) => {
                format!("{}: {}", error_type, self)
            }
            ApiError::Provisioning(err) => err.to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::InternalError(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };

        if status_code.is_server_error() {
            tracing::error!("{}", error_message);
        }

        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
