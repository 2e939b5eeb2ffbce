//! MySQL backend on the `sensors` / `sensor_data` schema.
//!
//! The actuator has no table of its own: its state is stored as readings of
//! the configured actuator sensor and read back as the newest one.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use super::{NewReading, PersistenceGateway, ReadingRow, SensorRow, StorageError};
use crate::telemetry::ActuatorState;

const CREATE_SENSORS: &str = r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id BIGINT NOT NULL PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        type VARCHAR(64) NOT NULL
    )
"#;

const CREATE_SENSOR_DATA: &str = r#"
    CREATE TABLE IF NOT EXISTS sensor_data (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        sensor_id BIGINT NOT NULL,
        value DOUBLE NOT NULL,
        timestamp DATETIME(6) NOT NULL,
        INDEX idx_sensor_time (sensor_id, timestamp),
        FOREIGN KEY (sensor_id) REFERENCES sensors(id)
    )
"#;

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
    actuator_sensor_id: i64,
}

impl MySqlStore {
    pub async fn connect(database_url: &str, actuator_sensor_id: i64) -> Result<Self, StorageError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Unavailable(format!("cannot open MySQL pool: {e}")))?;
        info!("MySQL pool ready");
        Ok(Self {
            pool,
            actuator_sensor_id,
        })
    }

    /// Creates missing tables and registers the seed sensors.
    pub async fn ensure_schema(&self, sensors: &[SensorRow]) -> Result<(), StorageError> {
        sqlx::query(CREATE_SENSORS).execute(&self.pool).await?;
        sqlx::query(CREATE_SENSOR_DATA).execute(&self.pool).await?;

        for sensor in sensors {
            sqlx::query("INSERT IGNORE INTO sensors (id, name, type) VALUES (?, ?, ?)")
                .bind(sensor.id)
                .bind(&sensor.name)
                .bind(&sensor.sensor_type)
                .execute(&self.pool)
                .await?;
        }
        debug!("Schema verified, {} seed sensors registered", sensors.len());
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MySqlStore {
    async fn resolve_sensor_ids(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, i64>, StorageError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let mut builder = QueryBuilder::<MySql>::new("SELECT id, name FROM sensors WHERE name IN (");
        let mut separated = builder.separated(", ");
        for name in names {
            separated.push_bind(name);
        }
        separated.push_unseparated(")");

        let rows: Vec<(i64, String)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
    }

    async fn append_readings(&self, readings: &[NewReading]) -> Result<u64, StorageError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut builder =
            QueryBuilder::<MySql>::new("INSERT INTO sensor_data (sensor_id, value, timestamp) ");
        builder.push_values(readings, |mut row, reading| {
            row.push_bind(reading.sensor_id)
                .push_bind(reading.value)
                .push_bind(reading.timestamp.naive_local());
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn append_actuator_reading(
        &self,
        state: ActuatorState,
        timestamp: DateTime<Local>,
    ) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO sensor_data (sensor_id, value, timestamp) VALUES (?, ?, ?)")
            .bind(self.actuator_sensor_id)
            .bind(state.value())
            .bind(timestamp.naive_local())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_actuator_state(&self) -> Result<Option<ActuatorState>, StorageError> {
        let value: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT value
            FROM sensor_data
            WHERE sensor_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(self.actuator_sensor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.map(ActuatorState::from_value))
    }

    async fn sensor_by_id(&self, id: i64) -> Result<Option<SensorRow>, StorageError> {
        let row = sqlx::query_as::<_, SensorRow>("SELECT id, name, type FROM sensors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn sensor_readings(&self, sensor_id: i64) -> Result<Vec<ReadingRow>, StorageError> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, sensor_id, value, timestamp
            FROM sensor_data
            WHERE sensor_id = ?
            ORDER BY timestamp DESC, id DESC
            "#,
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_sensors(&self) -> Result<Vec<SensorRow>, StorageError> {
        let rows = sqlx::query_as::<_, SensorRow>("SELECT id, name, type FROM sensors ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn recent_readings(
        &self,
        limit: u32,
    ) -> Result<BTreeMap<i64, Vec<ReadingRow>>, StorageError> {
        let sensor_ids: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT sensor_id FROM sensor_data")
            .fetch_all(&self.pool)
            .await?;

        let mut result = BTreeMap::new();
        for sensor_id in sensor_ids {
            let rows = sqlx::query_as::<_, ReadingRow>(
                r#"
                SELECT id, sensor_id, value, timestamp
                FROM sensor_data
                WHERE sensor_id = ?
                ORDER BY timestamp DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(sensor_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            result.insert(sensor_id, rows);
        }

        info!("Retrieved recent readings for {} sensors", result.len());
        Ok(result)
    }
}
