use axum::routing::{get, post};
use axum::{Router, http::StatusCode, response::IntoResponse};

use crate::state::AppState;
use crate::webhook::{github, harbor, latest_tag};

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route(
            "/webhook-v1alpha1-harbor-image",
            post(harbor::harbor_image_webhook),
        )
        .route(
            "/webhook-v1alpha1-github-image",
            post(github::github_image_webhook),
        )
        .route(
            "/webhook-v1alpha1-pod-latest-tag",
            post(latest_tag::latest_tag_webhook),
        )
        .with_state(state)
}
