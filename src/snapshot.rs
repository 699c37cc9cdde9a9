//! Snapshot normalizer.
//!
//! Flattens a realtime database dump into `sensor_data` rows. The dump is
//! keyed building → timestamp → reading, either as nested objects or with the
//! outer level list-indexed (the index is the building id, `null` holes are
//! gaps). A building may also hold a list of readings that carry their own
//! `timestamp` field.
//!
//! Each leaf becomes a `Result<SensorReading, SkipReason>`; bad leaves are
//! logged and collected, never fatal to the batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::SnapshotSettings;
use crate::models::{parse_timestamp, SensorReading};
use crate::upstream::{read_json, UpstreamError};

const SERVICE: &str = "snapshot source";

// ---

/// Download the current snapshot from the realtime database REST API.
pub async fn fetch(
    http: &reqwest::Client,
    settings: &SnapshotSettings,
) -> Result<Value, UpstreamError> {
    // ---
    let mut request = http.get(&settings.url).timeout(settings.timeout);
    if let Some(token) = &settings.auth_token {
        request = request.query(&[("auth", token)]);
    }

    debug!("Fetching snapshot from {}", settings.url);
    let response = request
        .send()
        .await
        .map_err(|e| UpstreamError::from_reqwest(SERVICE, e))?;

    read_json(SERVICE, response).await
}

/// Why a snapshot leaf did not become a row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SkipReason {
    #[error("building id {0:?} is not an integer")]
    InvalidBuildingId(String),

    #[error("malformed timestamp {0:?}")]
    MalformedTimestamp(String),

    #[error("reading has no timestamp")]
    MissingTimestamp,

    #[error("reading is not an object")]
    NotAnObject,

    #[error("field `{field}` is not numeric: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// A leaf that was dropped, with enough context to find it in the dump.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    pub building: String,
    pub key: String,
    pub reason: SkipReason,
}

/// Outcome of normalizing one snapshot: (accepted, skipped).
#[derive(Debug, Default)]
pub struct NormalizedSnapshot {
    /// Accepted rows, unique per `(timestamp, building_id)`, in key order.
    pub accepted: Vec<SensorReading>,
    pub skipped: Vec<SkippedRow>,
    /// Number of building entries present in the dump.
    pub buildings: usize,
}

/// Column-major form of the accepted rows, bound as arrays in one statement.
#[derive(Debug, Default, PartialEq)]
pub struct SensorColumns {
    pub timestamp: Vec<DateTime<Utc>>,
    pub building_id: Vec<i32>,
    pub temperature: Vec<f64>,
    pub humidity: Vec<f64>,
    pub occupancy: Vec<i32>,
    pub energy: Vec<f64>,
    pub current: Vec<f64>,
    pub voltage: Vec<f64>,
    pub power_factor: Vec<f64>,
    pub power: Vec<f64>,
}

impl SensorColumns {
    // ---
    pub fn from_rows(rows: &[SensorReading]) -> Self {
        // ---
        let mut cols = SensorColumns::default();
        for r in rows {
            cols.timestamp.push(r.timestamp);
            cols.building_id.push(r.building_id);
            cols.temperature.push(r.temperature);
            cols.humidity.push(r.humidity);
            cols.occupancy.push(r.occupancy);
            cols.energy.push(r.energy);
            cols.current.push(r.current);
            cols.voltage.push(r.voltage);
            cols.power_factor.push(r.power_factor);
            cols.power.push(r.power);
        }
        cols
    }

    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }
}

impl NormalizedSnapshot {
    // ---
    pub fn columns(&self) -> SensorColumns {
        SensorColumns::from_rows(&self.accepted)
    }
}

/// Normalize a whole snapshot.
///
/// A `null` snapshot (empty database) or a scalar yields no rows.
pub fn normalize(snapshot: &Value) -> NormalizedSnapshot {
    // ---
    let mut builder = Builder::default();

    match snapshot {
        Value::Object(buildings) => {
            for (building, readings) in buildings {
                builder.building(building, readings);
            }
        }
        Value::Array(buildings) => {
            for (index, readings) in buildings.iter().enumerate() {
                if !readings.is_null() {
                    builder.building(&index.to_string(), readings);
                }
            }
        }
        Value::Null => debug!("Snapshot is empty"),
        other => warn!("Snapshot root is not a container, ignoring: {}", other),
    }

    builder.finish()
}

#[derive(Default)]
struct Builder {
    rows: BTreeMap<(DateTime<Utc>, i32), SensorReading>,
    skipped: Vec<SkippedRow>,
    buildings: usize,
}

impl Builder {
    // ---
    fn building(&mut self, building: &str, readings: &Value) {
        // ---
        self.buildings += 1;
        let building_id = building
            .trim()
            .parse::<i32>()
            .map_err(|_| SkipReason::InvalidBuildingId(building.to_string()));

        match readings {
            Value::Object(by_ts) => {
                for (ts_key, leaf) in by_ts {
                    let row = building_id
                        .clone()
                        .and_then(|id| parse_leaf(id, Some(ts_key), leaf));
                    self.push(building, ts_key, row);
                }
            }
            Value::Array(list) => {
                for (index, leaf) in list.iter().enumerate() {
                    if leaf.is_null() {
                        continue;
                    }
                    let row = building_id.clone().and_then(|id| match leaf.get("timestamp") {
                        None | Some(Value::Null) => parse_leaf(id, None, leaf),
                        Some(Value::String(ts)) => parse_leaf(id, Some(ts), leaf),
                        Some(Value::Number(n)) => parse_leaf(id, Some(&n.to_string()), leaf),
                        Some(other) => Err(SkipReason::MalformedTimestamp(other.to_string())),
                    });
                    self.push(building, &index.to_string(), row);
                }
            }
            _ => self.push(building, "", Err(SkipReason::NotAnObject)),
        }
    }

    fn push(&mut self, building: &str, key: &str, row: Result<SensorReading, SkipReason>) {
        // ---
        match row {
            Ok(reading) => {
                // Same instant spelled two ways: the later leaf wins.
                self.rows.insert((reading.timestamp, reading.building_id), reading);
            }
            Err(reason) => {
                warn!(building, key, "Invalid data row: {}", reason);
                self.skipped.push(SkippedRow {
                    building: building.to_string(),
                    key: key.to_string(),
                    reason,
                });
            }
        }
    }

    fn finish(self) -> NormalizedSnapshot {
        NormalizedSnapshot {
            accepted: self.rows.into_values().collect(),
            skipped: self.skipped,
            buildings: self.buildings,
        }
    }
}

/// Turn one leaf into a row, applying per-field defaults.
fn parse_leaf(
    building_id: i32,
    ts_raw: Option<&str>,
    leaf: &Value,
) -> Result<SensorReading, SkipReason> {
    // ---
    let fields = leaf.as_object().ok_or(SkipReason::NotAnObject)?;
    let ts_raw = ts_raw.ok_or(SkipReason::MissingTimestamp)?;
    let timestamp = parse_timestamp(ts_raw)
        .ok_or_else(|| SkipReason::MalformedTimestamp(ts_raw.to_string()))?;

    let temperature = number(fields, "temperature", 0.0)?;
    let humidity = number(fields, "humidity", 0.0)?;
    let occupancy = integer(fields, "occupancy", 0)?;
    let energy = number(fields, "energy", 0.0)?;
    let current = number(fields, "current", 0.0)?;
    let voltage = number(fields, "voltage", 0.0)?;
    let power_factor = number(fields, "power_factor", 1.0)?;
    let power = number(fields, "power", voltage * current * power_factor)?;

    Ok(SensorReading {
        timestamp,
        building_id,
        temperature,
        humidity,
        occupancy,
        energy,
        current,
        voltage,
        power_factor,
        power,
    })
}

/// Coerce a numeric field; `null` or absent takes the default.
fn number(
    fields: &Map<String, Value>,
    field: &'static str,
    default: f64,
) -> Result<f64, SkipReason> {
    // ---
    let invalid = |v: &Value| SkipReason::InvalidField {
        field,
        value: v.to_string(),
    };

    let value = match fields.get(field) {
        None | Some(Value::Null) => return Ok(default),
        Some(v @ Value::Number(n)) => n.as_f64().ok_or_else(|| invalid(v))?,
        Some(v @ Value::String(s)) => s.trim().parse::<f64>().map_err(|_| invalid(v))?,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(v) => return Err(invalid(v)),
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(invalid(&fields[field]))
    }
}

/// Integer fields truncate fractional input.
fn integer(
    fields: &Map<String, Value>,
    field: &'static str,
    default: i32,
) -> Result<i32, SkipReason> {
    // ---
    let value = number(fields, field, f64::from(default))?.trunc();
    if value < f64::from(i32::MIN) || value > f64::from(i32::MAX) {
        return Err(SkipReason::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(value as i32)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, h, 0, 0).unwrap()
    }

    fn full_reading() -> Value {
        json!({
            "temperature": 22.5,
            "humidity": 40,
            "occupancy": 12,
            "energy": 35.2,
            "current": 10.0,
            "voltage": 230.0,
            "power_factor": 0.9,
            "power": 2000.0
        })
    }

    #[test]
    fn test_nested_snapshot_one_row_per_leaf() {
        // ---
        let snapshot = json!({
            "1": {
                "2025-03-26T10:00:00Z": full_reading(),
                "2025-03-26T11:00:00Z": full_reading(),
            },
            "2": {
                "2025-03-26T10:00:00Z": full_reading(),
            }
        });

        let out = normalize(&snapshot);
        assert_eq!(out.accepted.len(), 3);
        assert!(out.skipped.is_empty());
        assert_eq!(out.buildings, 2);

        let first = &out.accepted[0];
        assert_eq!(first.timestamp, at(10));
        assert_eq!(first.building_id, 1);
        assert_eq!(first.temperature, 22.5);
        assert_eq!(first.humidity, 40.0);
        assert_eq!(first.occupancy, 12);
        assert_eq!(first.power, 2000.0);
    }

    #[test]
    fn test_list_indexed_snapshot() {
        // ---
        let snapshot = json!([
            null,
            { "2025-03-26T10:00:00Z": full_reading() },
            null,
            { "2025-03-26T12:00:00Z": full_reading() }
        ]);

        let out = normalize(&snapshot);
        let keys: Vec<_> = out.accepted.iter().map(|r| (r.timestamp, r.building_id)).collect();
        assert_eq!(keys, vec![(at(10), 1), (at(12), 3)]);
        assert_eq!(out.buildings, 2);
    }

    #[test]
    fn test_reading_list_with_inline_timestamps() {
        // ---
        let snapshot = json!({
            "7": [
                { "timestamp": "2025-03-26T10:00:00Z", "energy": 5 },
                null,
                { "energy": 6 }
            ]
        });

        let out = normalize(&snapshot);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].energy, 5.0);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].reason, SkipReason::MissingTimestamp);
        assert_eq!(out.skipped[0].key, "2");
    }

    #[test]
    fn test_numeric_inline_timestamps() {
        // ---
        let snapshot = json!({
            "7": [
                { "timestamp": 1742983200, "energy": 5 },
                { "timestamp": 1742986800000_i64, "energy": 6 },
                { "timestamp": true, "energy": 7 },
                { "timestamp": 1742983200.5, "energy": 8 }
            ]
        });

        let out = normalize(&snapshot);
        let stamps: Vec<_> = out.accepted.iter().map(|r| r.timestamp.to_rfc3339()).collect();
        assert_eq!(
            stamps,
            vec!["2025-03-26T10:00:00+00:00", "2025-03-26T11:00:00+00:00"]
        );

        let reasons: Vec<_> = out.skipped.iter().map(|s| (s.key.as_str(), &s.reason)).collect();
        assert_eq!(
            reasons,
            vec![
                ("2", &SkipReason::MalformedTimestamp("true".into())),
                ("3", &SkipReason::MalformedTimestamp("1742983200.5".into())),
            ]
        );
    }

    #[test]
    fn test_malformed_leaves_dropped_not_fatal() {
        // ---
        let snapshot = json!({
            "1": {
                "not-a-time": full_reading(),
                "2025-03-26T10:00:00Z": full_reading(),
                "2025-03-26T11:00:00Z": "offline",
                "2025-03-26T12:00:00Z": { "energy": "lots" },
            },
            "north-wing": {
                "2025-03-26T10:00:00Z": full_reading(),
            },
            "3": 42
        });

        let out = normalize(&snapshot);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].timestamp, at(10));

        let reasons: Vec<_> = out.skipped.iter().map(|s| s.reason.clone()).collect();
        assert!(reasons.contains(&SkipReason::MalformedTimestamp("not-a-time".into())));
        assert!(reasons.contains(&SkipReason::NotAnObject));
        assert!(reasons.contains(&SkipReason::InvalidBuildingId("north-wing".into())));
        assert!(reasons.contains(&SkipReason::InvalidField {
            field: "energy",
            value: "\"lots\"".into()
        }));
        assert_eq!(out.skipped.len(), 5);
    }

    #[test]
    fn test_defaults_and_coercion() {
        // ---
        let snapshot = json!({
            "4": {
                "2025-03-26T10:00:00Z": {
                    "voltage": "230",
                    "current": "2.5",
                    "occupancy": 3.9,
                    "humidity": null
                }
            }
        });

        let out = normalize(&snapshot);
        let r = &out.accepted[0];
        assert_eq!(r.temperature, 0.0);
        assert_eq!(r.humidity, 0.0);
        assert_eq!(r.occupancy, 3);
        assert_eq!(r.energy, 0.0);
        assert_eq!(r.voltage, 230.0);
        assert_eq!(r.current, 2.5);
        assert_eq!(r.power_factor, 1.0);
        assert_eq!(r.power, 575.0);
    }

    #[test]
    fn test_non_finite_rejected() {
        // ---
        let snapshot = json!({ "1": { "2025-03-26T10:00:00Z": { "energy": "NaN" } } });
        let out = normalize(&snapshot);
        assert!(out.accepted.is_empty());
        assert!(matches!(
            out.skipped[0].reason,
            SkipReason::InvalidField { field: "energy", .. }
        ));
    }

    #[test]
    fn test_same_instant_later_leaf_wins() {
        // ---
        let snapshot = json!({
            "1": {
                "2025-03-26 10:00:00": { "energy": 1.0 },
                "2025-03-26T10:00:00Z": { "energy": 2.0 },
            }
        });

        let out = normalize(&snapshot);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].energy, 2.0);
    }

    #[test]
    fn test_empty_and_scalar_snapshots() {
        // ---
        assert!(normalize(&Value::Null).accepted.is_empty());
        assert!(normalize(&json!("oops")).accepted.is_empty());
        assert_eq!(normalize(&json!({})).buildings, 0);
    }

    #[tokio::test]
    async fn test_fetch_passes_auth_token() {
        // ---
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/sensors.json")
                    .query_param("auth", "db-token");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "1": { "2025-03-26T10:00:00Z": full_reading() } }));
            })
            .await;

        let settings = SnapshotSettings {
            url: server.url("/sensors.json"),
            auth_token: Some("db-token".into()),
            timeout: std::time::Duration::from_secs(5),
        };

        let raw = fetch(&reqwest::Client::new(), &settings).await.unwrap();
        mock.assert_async().await;
        assert_eq!(normalize(&raw).accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_classifies_http_status() {
        // ---
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sensors.json");
                then.status(401).body("Permission denied");
            })
            .await;

        let settings = SnapshotSettings {
            url: server.url("/sensors.json"),
            auth_token: None,
            timeout: std::time::Duration::from_secs(5),
        };

        let err = fetch(&reqwest::Client::new(), &settings).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Status { status: 401, .. }));
    }

    #[test]
    fn test_columns_follow_rows() {
        // ---
        let snapshot = json!({
            "2": { "2025-03-26T10:00:00Z": full_reading() },
            "1": { "2025-03-26T11:00:00Z": full_reading() },
        });

        let out = normalize(&snapshot);
        let cols = out.columns();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols.building_id, vec![2, 1]);
        assert_eq!(cols.timestamp, vec![at(10), at(11)]);
        assert_eq!(cols.power_factor, vec![0.9, 0.9]);
    }
}
