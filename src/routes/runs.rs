//! Whole-pipeline runs.
//!
//! - `POST /pipeline/runs` starts fetch → predict → optimize in the background
//!   and answers `202` with the run id, or `409` with the active run's id.
//! - `GET /pipeline/runs/{id}` reports a run's status and stage outcomes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::AppState;
use crate::stages::run_pipeline;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/pipeline/runs", post(start_run))
        .route("/pipeline/runs/{id}", get(get_run))
}

async fn start_run(State(state): State<AppState>) -> Response {
    // ---
    let id = match state.runs.try_begin() {
        Ok(id) => id,
        Err(active) => {
            warn!(%active, "Pipeline run already in progress");
            return (
                StatusCode::CONFLICT,
                Json(json!({ "id": active, "status": "running" })),
            )
                .into_response();
        }
    };

    info!(%id, "Pipeline run started");

    let AppState { ctx, runs } = state;
    runs.spawn(id, async move { run_pipeline(&ctx).await });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "id": id, "status": "running" })),
    )
        .into_response()
}

async fn get_run(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    // ---
    match state.runs.get(id) {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => (StatusCode::NOT_FOUND, format!("no pipeline run with id {id}")).into_response(),
    }
}
