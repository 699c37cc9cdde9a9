use std::sync::Arc;

use axum::Router;

use crate::runs::RunTracker;
use crate::stages::StageContext;

mod health;
mod runs;
mod stages;

// ---

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<StageContext>,
    pub runs: RunTracker,
}

pub fn router(ctx: StageContext) -> Router {
    // ---
    let state = AppState {
        ctx: Arc::new(ctx),
        runs: RunTracker::new(),
    };

    Router::new()
        .merge(stages::router())
        .merge(runs::router())
        .merge(health::router())
        .with_state(state)
}
