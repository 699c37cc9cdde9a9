//! The three pipeline stages and the linear chain that runs them.
//!
//! fetch-snapshot → trigger-prediction → optimize-energy. Each stage takes the
//! previous stage's JSON payload as input, runs to completion (one
//! transaction, committed at the end) and returns a status payload. A failing
//! stage ends the run; nothing is retried.

use std::{collections::BTreeMap, fmt, str::FromStr};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::forecast::{self, InferenceClient, ReconcileError};
use crate::upstream::UpstreamError;
use crate::{recommend, snapshot, store};

// ---

/// Everything a stage needs to talk to the outside world.
#[derive(Clone)]
pub struct StageContext {
    pub pool: PgPool,
    pub config: Config,
    pub http: reqwest::Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    FetchSnapshot,
    TriggerPrediction,
    OptimizeEnergy,
}

impl Stage {
    // ---
    /// Stages in run order.
    pub const PIPELINE: [Stage; 3] = [
        Stage::FetchSnapshot,
        Stage::TriggerPrediction,
        Stage::OptimizeEnergy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::FetchSnapshot => "fetch-snapshot",
            Stage::TriggerPrediction => "trigger-prediction",
            Stage::OptimizeEnergy => "optimize-energy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage `{0}`")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::PIPELINE
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("prediction processing error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StageError {
    // ---
    pub fn status_code(&self) -> StatusCode {
        match self {
            StageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StageError::Upstream(e) => e.status_code(),
            StageError::Config(_) | StageError::Reconcile(_) | StageError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for StageError {
    fn into_response(self) -> Response {
        (self.status_code(), format!("Error: {self}")).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// What one stage handed back to the run.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: OutcomeStatus,
    pub status_code: u16,
    pub payload: Value,
}

impl StageOutcome {
    // ---
    fn success(stage: Stage, payload: Value) -> Self {
        StageOutcome {
            stage,
            status: OutcomeStatus::Success,
            status_code: StatusCode::OK.as_u16(),
            payload,
        }
    }

    fn failure(stage: Stage, err: &StageError) -> Self {
        StageOutcome {
            stage,
            status: OutcomeStatus::Error,
            status_code: err.status_code().as_u16(),
            payload: json!({ "error": err.to_string() }),
        }
    }
}

/// Run a single stage by name.
#[tracing::instrument(name = "stage", skip_all, fields(stage = %stage))]
pub async fn run_stage(
    ctx: &StageContext,
    stage: Stage,
    input: Option<Value>,
) -> Result<Value, StageError> {
    // ---
    info!("Stage started");
    let result = match stage {
        Stage::FetchSnapshot => fetch_snapshot(ctx).await,
        Stage::TriggerPrediction => trigger_prediction(ctx, input).await,
        Stage::OptimizeEnergy => optimize_energy(ctx).await,
    };

    match &result {
        Ok(_) => info!("Stage finished"),
        Err(e) => error!(error = %e, "Stage failed"),
    }
    result
}

/// Run fetch → predict → optimize, stopping at the first failure.
pub async fn run_pipeline(ctx: &StageContext) -> Vec<StageOutcome> {
    // ---
    let mut outcomes = Vec::with_capacity(Stage::PIPELINE.len());
    let mut input = None;

    for stage in Stage::PIPELINE {
        match run_stage(ctx, stage, input.take()).await {
            Ok(payload) => {
                input = Some(payload.clone());
                outcomes.push(StageOutcome::success(stage, payload));
            }
            Err(e) => {
                outcomes.push(StageOutcome::failure(stage, &e));
                break;
            }
        }
    }

    outcomes
}

async fn fetch_snapshot(ctx: &StageContext) -> Result<Value, StageError> {
    // ---
    let settings = ctx.config.snapshot_settings()?;
    let raw = snapshot::fetch(&ctx.http, &settings).await?;

    let normalized = snapshot::normalize(&raw);
    let columns = normalized.columns();

    let mut tx = ctx.pool.begin().await?;
    let written = store::upsert_sensor_readings(&mut tx, &columns).await?;
    tx.commit().await?;

    info!(
        rows = columns.len(),
        skipped = normalized.skipped.len(),
        buildings = normalized.buildings,
        "Snapshot stored"
    );

    Ok(json!({
        "status": "success",
        "message": "Snapshot data stored",
        "rows_written": written,
        "rows_skipped": normalized.skipped.len(),
        "buildings": normalized.buildings,
    }))
}

async fn trigger_prediction(ctx: &StageContext, input: Option<Value>) -> Result<Value, StageError> {
    // ---
    // Configuration is checked before anything touches the network.
    let settings = ctx.config.prediction_settings()?;

    let request = forecast::build_request(input.as_ref(), settings.default_building_id, Utc::now());
    let anchor = request.anchor;
    let client = InferenceClient::new(ctx.http.clone(), settings);

    let response = client.predict(&request).await?;
    let forecast = forecast::reconcile(response, &anchor)?;

    let mut tx = ctx.pool.begin().await?;
    let predictions = store::upsert_predictions(&mut tx, &forecast.predictions).await?;
    let passed_through = store::upsert_recommendations(&mut tx, &forecast.recommendations).await?;
    tx.commit().await?;

    info!(
        series = forecast.series,
        predictions,
        passed_through,
        "Predictions stored"
    );

    Ok(json!({
        "status": "success",
        "message": "Predictions stored successfully",
        "number_of_series_predicted": forecast.series,
        "predictions_written": predictions,
        "recommendations_passed_through": passed_through,
        "forecast_start": anchor.start,
        "building_id": anchor.building_id,
        "synthetic_input": request.synthetic,
    }))
}

async fn optimize_energy(ctx: &StageContext) -> Result<Value, StageError> {
    // ---
    let window = ctx.config.recommendation_window_hours;
    let inputs = store::recent_recommendation_inputs(&ctx.pool, window).await?;

    let mut by_tag: BTreeMap<&'static str, usize> = BTreeMap::new();
    let recommendations: Vec<_> = inputs
        .iter()
        .map(|row| {
            let (rec, tag) = recommend::recommendation_for(row);
            *by_tag.entry(tag.as_str()).or_default() += 1;
            rec
        })
        .collect();

    let mut tx = ctx.pool.begin().await?;
    let written = store::upsert_recommendations(&mut tx, &recommendations).await?;
    tx.commit().await?;

    info!(window_hours = window, written, "Energy recommendations generated");

    Ok(json!({
        "status": "success",
        "message": "Energy recommendations generated successfully.",
        "recommendations_written": written,
        "by_tag": by_tag,
    }))
}
