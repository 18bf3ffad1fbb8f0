//! Rollout intake endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use log::{error, info};
use tokio::sync::mpsc;

use crate::types::RolloutRequest;

/// `POST /api/<prefix>` with a [`RolloutRequest`] body.  The request is
/// handed to the scheduler loop and always answered `200 accepted`;
/// outcomes, including requests that cannot be rolled out, are reported
/// through the rollout notification.
pub fn router(api_prefix: &str, submissions: mpsc::Sender<RolloutRequest>) -> Router {
    let path = format!("/api/{}", api_prefix.trim_matches('/'));
    Router::new()
        .route(&path, post(submit))
        .with_state(submissions)
}

async fn submit(
    State(submissions): State<mpsc::Sender<RolloutRequest>>,
    Json(request): Json<RolloutRequest>,
) -> (StatusCode, &'static str) {
    info!(
        "Received rollout request for {} at {}",
        request.service_name, request.commit_hash
    );
    if let Err(mpsc::error::SendError(request)) = submissions.send(request).await {
        error!(
            "Scheduler loop is gone, dropping rollout of {} at {}",
            request.service_name, request.commit_hash
        );
    }
    (StatusCode::OK, "accepted")
}
