//! Data models shared by the pipeline stages.
//!
//! All three persisted entities share the `(timestamp, building_id)` key and
//! are only ever upserted.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

// ---

/// One normalized sensor reading, a row of `sensor_data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    // ---
    pub timestamp: DateTime<Utc>,
    pub building_id: i32,
    pub temperature: f64,
    pub humidity: f64,
    pub occupancy: i32,
    pub energy: f64,
    pub current: f64,
    pub voltage: f64,
    pub power_factor: f64,
    pub power: f64,
}

/// One forecast point, a row of `predictions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    // ---
    pub timestamp: DateTime<Utc>,
    pub building_id: i32,
    pub predicted_energy: f64,
    pub anomaly: Option<String>,
}

/// One recommendation, a row of `recommendations`.
///
/// `recommendation` is free-form JSON: either a serialized
/// [`RecommendationBody`] or whatever the inference service sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    // ---
    pub timestamp: DateTime<Utc>,
    pub building_id: i32,
    pub predicted_energy: f64,
    pub recommendation: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationTag {
    PowerFactor,
    EnergySpike,
    OccupancyMismatch,
    TemperatureControl,
    Normal,
}

impl RecommendationTag {
    // ---
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendationTag::PowerFactor => "power_factor",
            RecommendationTag::EnergySpike => "energy_spike",
            RecommendationTag::OccupancyMismatch => "occupancy_mismatch",
            RecommendationTag::TemperatureControl => "temperature_control",
            RecommendationTag::Normal => "normal",
        }
    }
}

/// Rule-generated recommendation payload stored as JSONB.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationBody {
    // ---
    pub description: &'static str,
    pub priority: Priority,
    pub tag: RecommendationTag,
}

/// A sensor row joined with its prediction, input to the rule evaluation.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RecommendationInput {
    // ---
    pub timestamp: DateTime<Utc>,
    pub building_id: i32,
    pub energy: f64,
    pub occupancy: i32,
    pub power_factor: f64,
    pub temperature: f64,
    pub predicted_energy: Option<f64>,
    pub anomaly: Option<String>,
}

/// Naive layouts accepted after RFC 3339; interpreted as UTC.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Unix values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a snapshot or forecast timestamp.
///
/// Accepts RFC 3339 (`Z` or offset), naive ISO-8601 with `T` or a space
/// (assumed UTC), and integer Unix seconds or milliseconds. Returns `None`
/// for anything else.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // ---
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
        let value = raw.parse::<i64>().ok()?;
        return if value > EPOCH_MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(value)
        } else {
            DateTime::from_timestamp(value, 0)
        };
    }

    None
}
