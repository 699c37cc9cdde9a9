//! Database schema management for `energyflow-pipeline`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates `sensor_data`, `predictions` and `recommendations`, all keyed by
/// `(timestamp, building_id)` so every write can be an upsert. Safe to call on
/// every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Normalized snapshot readings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_data (
            timestamp     TIMESTAMPTZ      NOT NULL,
            building_id   INTEGER          NOT NULL,
            temperature   DOUBLE PRECISION NOT NULL,
            humidity      DOUBLE PRECISION NOT NULL,
            occupancy     INTEGER          NOT NULL,
            energy        DOUBLE PRECISION NOT NULL,
            current       DOUBLE PRECISION NOT NULL,
            voltage       DOUBLE PRECISION NOT NULL,
            power_factor  DOUBLE PRECISION NOT NULL,
            power         DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (timestamp, building_id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Hourly forecast points
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            timestamp         TIMESTAMPTZ      NOT NULL,
            building_id       INTEGER          NOT NULL,
            predicted_energy  DOUBLE PRECISION NOT NULL,
            anomaly           TEXT,
            PRIMARY KEY (timestamp, building_id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recommendations (
            timestamp         TIMESTAMPTZ      NOT NULL,
            building_id       INTEGER          NOT NULL,
            predicted_energy  DOUBLE PRECISION NOT NULL,
            recommendation    JSONB            NOT NULL,
            PRIMARY KEY (timestamp, building_id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // The optimize stage scans a recent window across all buildings
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_data_timestamp
            ON sensor_data (timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
