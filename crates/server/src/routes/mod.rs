use axum::{
    Router, middleware,
    routing::{IntoMakeService, get},
};
use tower_http::cors::{Any, CorsLayer};

use crate::{DeploymentImpl, middleware as app_middleware};

pub mod health;
pub mod provisioning;

/// The `/api` router without the make-service wrapper.
pub fn api_router(deployment: DeploymentImpl) -> Router {
    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(provisioning::router())
        .with_state(deployment);

    Router::new()
        .nest("/api", base_routes)
        .layer(middleware::from_fn(app_middleware::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    api_router(deployment).into_make_service()
}
