//! Inference request construction: caller passthrough, single-series wrap,
//! or a synthetic hourly series, plus the anchor the answer is read against.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::models::parse_timestamp;

/// Context length the model expects when we have to make up a series.
pub const SYNTHETIC_TIMESTEPS: usize = 745;

/// Where a forecast array is pinned: its first hour and its building.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastAnchor {
    pub start: DateTime<Utc>,
    pub building_id: i32,
}

/// A ready-to-send inference payload plus the anchor to read the answer with.
#[derive(Debug, Clone)]
pub struct ForecastRequest {
    /// Always `{"data": ...}`.
    pub payload: Value,
    pub anchor: ForecastAnchor,
    pub synthetic: bool,
}

/// Build the inference request from an optional caller body.
///
/// `data` is passed through untouched; a bare `start` + `target` series is
/// wrapped into a one-element list; anything else gets the synthetic series.
/// The caller may pin the forecast with `forecast_start` and `building_id`.
pub fn build_request(
    body: Option<&Value>,
    default_building_id: i32,
    now: DateTime<Utc>,
) -> ForecastRequest {
    // ---
    let body = body.filter(|b| b.is_object());
    let has = |key: &str| body.is_some_and(|b| b.get(key).is_some());

    let (payload, synthetic) = match body {
        Some(b) if has("data") => (json!({ "data": b["data"].clone() }), false),
        Some(b) if has("start") && has("target") => (json!({ "data": [b.clone()] }), false),
        _ => {
            info!("No valid input in request, generating default series");
            (json!({ "data": [synthetic_series(now)] }), true)
        }
    };

    let start = match body.and_then(|b| b.get("forecast_start")) {
        Some(raw) => raw.as_str().and_then(parse_timestamp).or_else(|| {
            warn!("Ignoring unparseable forecast_start: {}", raw);
            None
        }),
        None => None,
    }
    .unwrap_or_else(|| next_hour(now));

    let building_id = body
        .and_then(|b| b.get("building_id"))
        .and_then(Value::as_i64)
        .and_then(|id| i32::try_from(id).ok())
        .unwrap_or(default_building_id);

    ForecastRequest {
        payload,
        anchor: ForecastAnchor { start, building_id },
        synthetic,
    }
}

/// A plausible hourly series ending at `now`.
fn synthetic_series(now: DateTime<Utc>) -> Value {
    // ---
    let n = SYNTHETIC_TIMESTEPS;
    let base = now - Duration::hours(n as i64);

    let target: Vec<f64> = (0..n)
        .map(|i| 50.5 + (i % 20) as f64 + i as f64 / 100.0)
        .collect();

    // BTreeMap keeps the feature rows in sorted key order.
    let mut features: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    features.insert("temperature", (0..n).map(|i| 20.0 + (i % 5) as f64).collect());
    features.insert("humidity", (0..n).map(|i| 60.0 + (i % 10) as f64).collect());
    features.insert(
        "occupancy",
        (0..n).map(|i| if i % 24 < 12 { 1.0 } else { 0.0 }).collect(),
    );
    features.insert(
        "solar_irradiance",
        (0..n).map(|i| 100.0 + (i % 100) as f64).collect(),
    );
    features.insert("wind_speed", (0..n).map(|i| 5.0 + (i % 5) as f64).collect());
    features.insert("voltage", (0..n).map(|i| 230.0 + (i % 2) as f64).collect());
    features.insert("current", vec![0.5; n]);

    json!({
        "start": base.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "target": target,
        "feat_dynamic_real": features.into_values().collect::<Vec<_>>(),
        "feat_static_cat": [0],
        "feat_static_real": [1000.0],
    })
}

fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now) + Duration::hours(1)
}

impl ForecastRequest {
    // ---
    /// Number of series in the payload, for logging.
    pub fn series_count(&self) -> usize {
        match &self.payload["data"] {
            Value::Array(series) => series.len(),
            Value::Null => 0,
            _ => 1,
        }
    }
}
