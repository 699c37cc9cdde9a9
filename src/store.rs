//! Upserts and reads against the three pipeline tables.
//!
//! Every write is `INSERT .. ON CONFLICT (timestamp, building_id) DO UPDATE`,
//! so rerunning a stage over the same data converges to the same rows.
//! Callers hand in a connection from an open transaction and commit once.

use sqlx::{types::Json, PgConnection, PgPool, Postgres, QueryBuilder};

use crate::models::{Prediction, Recommendation, RecommendationInput};
use crate::snapshot::SensorColumns;

/// Rows per multi-row `VALUES` statement (4 binds each, well under 65535).
const RECOMMENDATION_BATCH: usize = 1000;

// ---

/// Upsert the columnar snapshot in one `UNNEST` statement.
pub async fn upsert_sensor_readings(
    conn: &mut PgConnection,
    cols: &SensorColumns,
) -> Result<u64, sqlx::Error> {
    // ---
    if cols.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO sensor_data (
            timestamp, building_id, temperature, humidity, occupancy,
            energy, current, voltage, power_factor, power
        )
        SELECT * FROM UNNEST(
            $1::timestamptz[], $2::int4[], $3::float8[], $4::float8[], $5::int4[],
            $6::float8[], $7::float8[], $8::float8[], $9::float8[], $10::float8[]
        )
        ON CONFLICT (timestamp, building_id) DO UPDATE
        SET temperature  = EXCLUDED.temperature,
            humidity     = EXCLUDED.humidity,
            occupancy    = EXCLUDED.occupancy,
            energy       = EXCLUDED.energy,
            current      = EXCLUDED.current,
            voltage      = EXCLUDED.voltage,
            power_factor = EXCLUDED.power_factor,
            power        = EXCLUDED.power
        "#,
    )
    .bind(cols.timestamp.as_slice())
    .bind(cols.building_id.as_slice())
    .bind(cols.temperature.as_slice())
    .bind(cols.humidity.as_slice())
    .bind(cols.occupancy.as_slice())
    .bind(cols.energy.as_slice())
    .bind(cols.current.as_slice())
    .bind(cols.voltage.as_slice())
    .bind(cols.power_factor.as_slice())
    .bind(cols.power.as_slice())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Upsert forecast points. Keys must be unique within `rows`.
pub async fn upsert_predictions(
    conn: &mut PgConnection,
    rows: &[Prediction],
) -> Result<u64, sqlx::Error> {
    // ---
    if rows.is_empty() {
        return Ok(0);
    }

    let timestamps: Vec<_> = rows.iter().map(|p| p.timestamp).collect();
    let buildings: Vec<i32> = rows.iter().map(|p| p.building_id).collect();
    let values: Vec<f64> = rows.iter().map(|p| p.predicted_energy).collect();
    let anomalies: Vec<Option<String>> = rows.iter().map(|p| p.anomaly.clone()).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO predictions (timestamp, building_id, predicted_energy, anomaly)
        SELECT * FROM UNNEST($1::timestamptz[], $2::int4[], $3::float8[], $4::text[])
        ON CONFLICT (timestamp, building_id) DO UPDATE
        SET predicted_energy = EXCLUDED.predicted_energy,
            anomaly          = EXCLUDED.anomaly
        "#,
    )
    .bind(timestamps)
    .bind(buildings)
    .bind(values)
    .bind(anomalies)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Upsert recommendations in multi-row batches. Keys must be unique within `rows`.
pub async fn upsert_recommendations(
    conn: &mut PgConnection,
    rows: &[Recommendation],
) -> Result<u64, sqlx::Error> {
    // ---
    let mut written = 0;

    for batch in rows.chunks(RECOMMENDATION_BATCH) {
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO recommendations (timestamp, building_id, predicted_energy, recommendation) ",
        );

        builder.push_values(batch, |mut b, r| {
            b.push_bind(r.timestamp)
                .push_bind(r.building_id)
                .push_bind(r.predicted_energy)
                .push_bind(Json(r.recommendation.clone()));
        });

        builder.push(
            " ON CONFLICT (timestamp, building_id) DO UPDATE \
              SET predicted_energy = EXCLUDED.predicted_energy, \
                  recommendation = EXCLUDED.recommendation",
        );

        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(written)
}

/// Sensor rows of the last `window_hours`, each with its prediction if any.
pub async fn recent_recommendation_inputs(
    pool: &PgPool,
    window_hours: i32,
) -> Result<Vec<RecommendationInput>, sqlx::Error> {
    // ---
    sqlx::query_as::<_, RecommendationInput>(
        r#"
        SELECT
            s.timestamp,
            s.building_id,
            s.energy,
            s.occupancy,
            s.power_factor,
            s.temperature,
            p.predicted_energy,
            p.anomaly
        FROM sensor_data s
        LEFT JOIN predictions p
            ON s.timestamp = p.timestamp
           AND s.building_id = p.building_id
        WHERE s.timestamp >= NOW() - make_interval(hours => $1)
        ORDER BY s.timestamp, s.building_id
        "#,
    )
    .bind(window_hours)
    .fetch_all(pool)
    .await
}
