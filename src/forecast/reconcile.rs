//! Forecast response reconciliation.
//!
//! The inference service has answered with several shapes over time:
//!
//! - `{"predictions": [...], ...metadata}` or `{"forecast": [...]}`
//! - a bare array
//! - either of the above serialized once more into a JSON string
//!
//! The array holds plain numbers (one series for the anchor building) or
//! series objects `{"mean": [...], "start": ..., "building_id": ..}`.
//! Values line up with `start + i hours`; a `null` value leaves a gap.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::request::ForecastAnchor;
use crate::models::{parse_timestamp, Prediction, Recommendation};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("double-encoded response is not valid JSON: {0}")]
    DoubleEncoded(String),

    #[error("unsupported response shape: {0}")]
    UnsupportedShape(String),
}

/// Rows derived from one inference response.
#[derive(Debug, Default, PartialEq)]
pub struct ReconciledForecast {
    /// Unique per `(timestamp, building_id)`, in key order.
    pub predictions: Vec<Prediction>,
    /// Recommendations the service sent along, aligned to the first series.
    pub recommendations: Vec<Recommendation>,
    /// Number of series found in the response.
    pub series: usize,
}

struct Series {
    building_id: i32,
    start: DateTime<Utc>,
    values: Vec<Option<f64>>,
    anomalies: Vec<Option<String>>,
}

impl Series {
    // ---
    /// `None` once the hour offset runs past the representable range.
    fn timestamp(&self, i: usize) -> Option<DateTime<Utc>> {
        let offset = Duration::try_hours(i64::try_from(i).ok()?)?;
        self.start.checked_add_signed(offset)
    }
}

/// Normalize an inference response into prediction and recommendation rows.
pub fn reconcile(
    response: Value,
    anchor: &ForecastAnchor,
) -> Result<ReconciledForecast, ReconcileError> {
    // ---
    let response = unwrap_encoding(response)?;

    let (forecast, meta) = match response {
        Value::Object(mut obj) => {
            let forecast = obj
                .remove("predictions")
                .or_else(|| obj.remove("forecast"))
                .ok_or_else(|| {
                    let keys: Vec<_> = obj.keys().map(String::as_str).collect();
                    ReconcileError::UnsupportedShape(format!(
                        "object without `predictions` or `forecast` (keys: {})",
                        keys.join(", ")
                    ))
                })?;
            (forecast, obj)
        }
        array @ Value::Array(_) => (array, Map::new()),
        other => {
            return Err(ReconcileError::UnsupportedShape(format!(
                "top-level {}",
                kind(&other)
            )))
        }
    };

    let mut series = match forecast {
        Value::Array(items) => parse_items(&items, anchor)?,
        obj @ Value::Object(_) => vec![series_from_object(&obj, anchor)?],
        other => {
            return Err(ReconcileError::UnsupportedShape(format!(
                "forecast is a {}",
                kind(&other)
            )))
        }
    };

    if let Some(first) = series.first_mut() {
        if first.anomalies.iter().all(Option::is_none) {
            first.anomalies = anomaly_tags(meta.get("anomalies"), first.values.len());
        }
    }

    let mut predictions = BTreeMap::new();
    for s in &series {
        for (i, value) in s.values.iter().enumerate() {
            let Some(predicted_energy) = *value else {
                continue;
            };
            let Some(timestamp) = s.timestamp(i) else {
                warn!(
                    start = %s.start,
                    dropped = s.values.len() - i,
                    "Forecast runs past the last representable time, truncating"
                );
                break;
            };
            let prediction = Prediction {
                timestamp,
                building_id: s.building_id,
                predicted_energy,
                anomaly: s.anomalies.get(i).cloned().flatten(),
            };
            predictions.insert((prediction.timestamp, prediction.building_id), prediction);
        }
    }

    let recommendations = match (series.first(), meta.get("recommendations")) {
        (Some(first), Some(recs)) => passthrough_recommendations(first, recs),
        _ => Vec::new(),
    };

    debug!(
        series = series.len(),
        predictions = predictions.len(),
        recommendations = recommendations.len(),
        "Reconciled forecast response"
    );

    Ok(ReconciledForecast {
        predictions: predictions.into_values().collect(),
        recommendations,
        series: series.len(),
    })
}

/// Peel exactly one extra JSON layer off a string response.
fn unwrap_encoding(response: Value) -> Result<Value, ReconcileError> {
    // ---
    let Value::String(text) = response else {
        return Ok(response);
    };

    let inner: Value = serde_json::from_str(&text)
        .map_err(|e| ReconcileError::DoubleEncoded(e.to_string()))?;

    if inner.is_string() {
        return Err(ReconcileError::UnsupportedShape(
            "string encoded more than twice".to_string(),
        ));
    }
    Ok(inner)
}

fn parse_items(items: &[Value], anchor: &ForecastAnchor) -> Result<Vec<Series>, ReconcileError> {
    // ---
    match items.iter().find(|v| !v.is_null()) {
        None => Ok(Vec::new()),
        Some(Value::Number(_)) => Ok(vec![Series {
            building_id: anchor.building_id,
            start: anchor.start,
            values: numbers(items)?,
            anomalies: Vec::new(),
        }]),
        Some(Value::Object(_)) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| series_from_object(v, anchor))
            .collect(),
        Some(other) => Err(ReconcileError::UnsupportedShape(format!(
            "forecast element is a {}",
            kind(other)
        ))),
    }
}

fn series_from_object(obj: &Value, anchor: &ForecastAnchor) -> Result<Series, ReconcileError> {
    // ---
    let values = match obj.get("mean").or_else(|| obj.get("values")) {
        Some(Value::Array(items)) => numbers(items)?,
        Some(other) => {
            return Err(ReconcileError::UnsupportedShape(format!(
                "series values are a {}",
                kind(other)
            )))
        }
        None => {
            return Err(ReconcileError::UnsupportedShape(
                "series object without `mean` or `values`".to_string(),
            ))
        }
    };

    let start = match obj.get("start") {
        Some(raw) => raw.as_str().and_then(parse_timestamp).unwrap_or_else(|| {
            warn!("Series start {} unparseable, using anchor {}", raw, anchor.start);
            anchor.start
        }),
        None => anchor.start,
    };

    let building_id = obj
        .get("building_id")
        .and_then(Value::as_i64)
        .and_then(|id| i32::try_from(id).ok())
        .unwrap_or(anchor.building_id);

    let anomalies = anomaly_tags(obj.get("anomalies"), values.len());

    Ok(Series {
        building_id,
        start,
        values,
        anomalies,
    })
}

fn numbers(items: &[Value]) -> Result<Vec<Option<f64>>, ReconcileError> {
    // ---
    items
        .iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(n.as_f64().filter(|f| f.is_finite())),
            other => Err(ReconcileError::UnsupportedShape(format!(
                "forecast value {} is a {}",
                i,
                kind(other)
            ))),
        })
        .collect()
}

/// Anomaly tags aligned to a series; lists of tags are joined with commas.
fn anomaly_tags(raw: Option<&Value>, len: usize) -> Vec<Option<String>> {
    // ---
    let Some(Value::Array(items)) = raw else {
        if let Some(other) = raw {
            warn!("Ignoring anomalies metadata of type {}", kind(other));
        }
        return vec![None; len];
    };

    (0..len)
        .map(|i| match items.get(i) {
            Some(Value::String(tag)) if !tag.is_empty() => Some(tag.clone()),
            Some(Value::Array(tags)) => {
                let tags: Vec<&str> = tags.iter().filter_map(Value::as_str).collect();
                (!tags.is_empty()).then(|| tags.join(","))
            }
            Some(Value::Bool(true)) => Some("anomaly".to_string()),
            _ => None,
        })
        .collect()
}

fn passthrough_recommendations(first: &Series, recs: &Value) -> Vec<Recommendation> {
    // ---
    let Value::Array(items) = recs else {
        warn!("Ignoring recommendations metadata of type {}", kind(recs));
        return Vec::new();
    };

    if items.len() > first.values.len() {
        debug!(
            "Dropping {} recommendations past the end of the forecast",
            items.len() - first.values.len()
        );
    }

    items
        .iter()
        .zip(&first.values)
        .enumerate()
        .filter(|(_, (rec, _))| !rec.is_null())
        .filter_map(|(i, (rec, value))| {
            Some(Recommendation {
                timestamp: first.timestamp(i)?,
                building_id: first.building_id,
                predicted_energy: value.unwrap_or(0.0),
                recommendation: rec.clone(),
            })
        })
        .collect()
}

fn kind(v: &Value) -> &'static str {
    // ---
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn anchor() -> ForecastAnchor {
        ForecastAnchor {
            start: Utc.with_ymd_and_hms(2025, 3, 26, 19, 0, 0).unwrap(),
            building_id: 3,
        }
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, h, 0, 0).unwrap()
    }

    fn values(f: &ReconciledForecast) -> Vec<f64> {
        f.predictions.iter().map(|p| p.predicted_energy).collect()
    }

    #[test]
    fn test_predictions_key_aligns_hourly() {
        // ---
        let out = reconcile(json!({ "predictions": [10.0, 11.5, 12.0] }), &anchor()).unwrap();

        assert_eq!(out.series, 1);
        assert_eq!(values(&out), vec![10.0, 11.5, 12.0]);
        let stamps: Vec<_> = out.predictions.iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![hour(19), hour(20), hour(21)]);
        assert!(out.predictions.iter().all(|p| p.building_id == 3));
    }

    #[test]
    fn test_forecast_key_and_bare_array() {
        // ---
        let keyed = reconcile(json!({ "forecast": [1, 2] }), &anchor()).unwrap();
        let bare = reconcile(json!([1, 2]), &anchor()).unwrap();
        assert_eq!(keyed, bare);
        assert_eq!(values(&bare), vec![1.0, 2.0]);
    }

    #[test]
    fn test_predictions_key_wins_over_forecast() {
        // ---
        let out = reconcile(json!({ "predictions": [5], "forecast": [9] }), &anchor()).unwrap();
        assert_eq!(values(&out), vec![5.0]);
    }

    #[test]
    fn test_double_encoded_matches_single() {
        // ---
        let single = json!({
            "predictions": [10.0, 20.0],
            "anomalies": [null, "power_factor_abnormal"],
            "recommendations": [{ "tag": "shift_load" }]
        });
        let double = Value::String(single.to_string());

        let a = reconcile(single, &anchor()).unwrap();
        let b = reconcile(double, &anchor()).unwrap();
        assert_eq!(a, b);
        assert_eq!(values(&b), vec![10.0, 20.0]);

        let bare_double = Value::String("[1.5, 2.5]".to_string());
        assert_eq!(values(&reconcile(bare_double, &anchor()).unwrap()), vec![1.5, 2.5]);
    }

    #[test]
    fn test_only_one_extra_layer_unwrapped() {
        // ---
        let once = json!({ "predictions": [1] }).to_string();
        let twice = Value::String(Value::String(once).to_string());

        let err = reconcile(twice, &anchor()).unwrap_err();
        assert!(matches!(err, ReconcileError::UnsupportedShape(_)));

        let garbage = Value::String("{not json".to_string());
        assert!(matches!(
            reconcile(garbage, &anchor()),
            Err(ReconcileError::DoubleEncoded(_))
        ));
    }

    #[test]
    fn test_unknown_shapes_are_errors() {
        // ---
        for response in [
            json!({ "result": [1, 2] }),
            json!(42),
            json!(null),
            json!({ "predictions": "soon" }),
            json!(["a", "b"]),
            json!([1, "b"]),
            json!({ "predictions": [{ "median": [1] }] }),
        ] {
            let res = reconcile(response.clone(), &anchor());
            assert!(
                matches!(res, Err(ReconcileError::UnsupportedShape(_))),
                "expected shape error for {response}"
            );
        }
    }

    #[test]
    fn test_series_objects() {
        // ---
        let response = json!({
            "predictions": [
                { "mean": [1.0, 2.0], "start": "2025-03-26 10:00:00" },
                { "mean": [3.0], "building_id": 8, "anomalies": ["energy_spike"] },
                null
            ]
        });

        let out = reconcile(response, &anchor()).unwrap();
        assert_eq!(out.series, 2);

        let keys: Vec<_> = out
            .predictions
            .iter()
            .map(|p| (p.timestamp, p.building_id, p.anomaly.as_deref()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (hour(10), 3, None),
                (hour(11), 3, None),
                (hour(19), 8, Some("energy_spike")),
            ]
        );
    }

    #[test]
    fn test_null_values_leave_gaps() {
        // ---
        let out = reconcile(json!([1.0, null, 3.0]), &anchor()).unwrap();
        let stamps: Vec<_> = out.predictions.iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![hour(19), hour(21)]);
    }

    #[test]
    fn test_empty_forecast_is_not_an_error() {
        // ---
        let out = reconcile(json!({ "predictions": [] }), &anchor()).unwrap();
        assert_eq!(out, ReconciledForecast::default());
    }

    #[test]
    fn test_anomaly_metadata() {
        // ---
        let out = reconcile(
            json!({
                "predictions": [1, 2, 3, 4],
                "anomalies": ["power_factor_abnormal", ["a", "b"], true]
            }),
            &anchor(),
        )
        .unwrap();

        let tags: Vec<_> = out.predictions.iter().map(|p| p.anomaly.clone()).collect();
        assert_eq!(
            tags,
            vec![
                Some("power_factor_abnormal".to_string()),
                Some("a,b".to_string()),
                Some("anomaly".to_string()),
                None,
            ]
        );
    }

    #[test]
    fn test_recommendations_pass_through() {
        // ---
        let out = reconcile(
            json!({
                "predictions": [40.0, 41.0],
                "recommendations": [
                    { "description": "Pre-cool before peak", "priority": "medium" },
                    null,
                    { "description": "beyond the forecast" }
                ]
            }),
            &anchor(),
        )
        .unwrap();

        assert_eq!(out.recommendations.len(), 1);
        let rec = &out.recommendations[0];
        assert_eq!(rec.timestamp, hour(19));
        assert_eq!(rec.building_id, 3);
        assert_eq!(rec.predicted_energy, 40.0);
        assert_eq!(rec.recommendation["description"], "Pre-cool before peak");
    }

    #[test]
    fn test_overlapping_series_later_wins() {
        // ---
        let out = reconcile(
            json!([{ "mean": [1.0] }, { "mean": [2.0] }]),
            &anchor(),
        )
        .unwrap();
        assert_eq!(out.series, 2);
        assert_eq!(values(&out), vec![2.0]);
    }

    #[test]
    fn test_start_near_max_time_truncates_instead_of_overflowing() {
        // ---
        let last = DateTime::<Utc>::MAX_UTC.timestamp_millis() - 1000;
        let response = json!({
            "predictions": [{ "mean": [1.0, 2.0, 3.0], "start": last.to_string() }],
            "recommendations": [{ "tag": "a" }, { "tag": "b" }],
        });

        let out = reconcile(response, &anchor()).unwrap();
        assert_eq!(out.series, 1);
        assert_eq!(values(&out), vec![1.0]);
        assert_eq!(out.predictions[0].timestamp.timestamp_millis(), last);
        assert_eq!(out.recommendations.len(), 1);
        assert_eq!(out.recommendations[0].recommendation, json!({ "tag": "a" }));
    }
}
