//! `POST /stages/{name}`: run one stage by name.
//!
//! The request body, if any, is handed to the stage as its input. An empty
//! body means "no input"; a body that is not JSON is rejected before the
//! stage runs.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use tracing::warn;

use super::AppState;
use crate::stages::{run_stage, Stage, StageError};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/stages/{name}", post(handler))
}

async fn handler(
    Path(name): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    // ---
    let stage = match name.parse::<Stage>() {
        Ok(stage) => stage,
        Err(e) => {
            warn!(%name, "Unknown stage requested");
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
    };

    let input = match parse_input(&body) {
        Ok(input) => input,
        Err(e) => return e.into_response(),
    };

    match run_stage(&state.ctx, stage, input).await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e) => e.into_response(),
    }
}

fn parse_input(body: &[u8]) -> Result<Option<Value>, StageError> {
    // ---
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| StageError::InvalidInput(format!("request body is not JSON: {e}")))
}
