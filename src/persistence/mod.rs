//! # Persistence Gateway
//!
//! The bridge never talks to a database directly. Everything it needs from
//! storage goes through [`PersistenceGateway`]: resolving sensor names to ids,
//! appending readings, and projecting the actuator state out of the reading
//! history.
//!
//! ## Backends
//!
//! ```text
//! persistence/
//! ├── memory.rs  - seeded in-process store, used when no database is configured
//! └── mysql.rs   - sqlx MySQL pool on the `sensors` / `sensor_data` schema
//! ```
//!
//! ## Error Handling Strategy
//!
//! Every operation can fail with a [`StorageError`]. Callers on the live path
//! log the failure and keep going: a lost write must never stop a broadcast.

pub mod memory;
pub mod mysql;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use crate::telemetry::ActuatorState;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

/// A registered sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorRow {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub sensor_type: String,
}

/// One stored reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReadingRow {
    pub id: i64,
    pub sensor_id: i64,
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

/// A reading waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub sensor_id: i64,
    pub value: f64,
    pub timestamp: DateTime<Local>,
}

/// Readings of a single sensor, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct SensorHistory {
    pub sensor_id: i64,
    pub sensor_name: String,
    pub sensor_type: String,
    pub readings: Vec<HistoryReading>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReading {
    pub id: i64,
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

impl From<ReadingRow> for HistoryReading {
    fn from(row: ReadingRow) -> Self {
        Self {
            id: row.id,
            value: row.value,
            timestamp: row.timestamp,
        }
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Maps known names to ids; unknown names are simply absent.
    async fn resolve_sensor_ids(&self, names: &[String])
        -> Result<HashMap<String, i64>, StorageError>;

    /// Appends readings and returns how many rows were written.
    async fn append_readings(&self, readings: &[NewReading]) -> Result<u64, StorageError>;

    async fn append_actuator_reading(
        &self,
        state: ActuatorState,
        timestamp: DateTime<Local>,
    ) -> Result<(), StorageError>;

    /// `None` when no actuator reading was ever stored.
    async fn latest_actuator_state(&self) -> Result<Option<ActuatorState>, StorageError>;

    async fn sensor_by_id(&self, id: i64) -> Result<Option<SensorRow>, StorageError>;

    /// All readings of one sensor, newest first.
    async fn sensor_readings(&self, sensor_id: i64) -> Result<Vec<ReadingRow>, StorageError>;

    async fn list_sensors(&self) -> Result<Vec<SensorRow>, StorageError>;

    /// The `limit` newest readings of every sensor that has any.
    async fn recent_readings(
        &self,
        limit: u32,
    ) -> Result<BTreeMap<i64, Vec<ReadingRow>>, StorageError>;
}

/// Loads a sensor together with its full reading history.
pub async fn sensor_history(
    gateway: &dyn PersistenceGateway,
    sensor_id: i64,
) -> Result<Option<SensorHistory>, StorageError> {
    let Some(sensor) = gateway.sensor_by_id(sensor_id).await? else {
        return Ok(None);
    };
    let readings = gateway.sensor_readings(sensor_id).await?;

    Ok(Some(SensorHistory {
        sensor_id: sensor.id,
        sensor_name: sensor.name,
        sensor_type: sensor.sensor_type,
        readings: readings.into_iter().map(HistoryReading::from).collect(),
    }))
}

/// Picks the backend described by the storage section of the config.
pub async fn connect(
    config: &StorageConfig,
    actuator_sensor_id: i64,
) -> Result<Arc<dyn PersistenceGateway>, StorageError> {
    match &config.database_url {
        Some(url) if url.trim().is_empty() => Err(StorageError::Unavailable(
            "storage.database_url is set but empty".to_string(),
        )),
        Some(url) => {
            info!("Connecting to MySQL storage");
            let store = mysql::MySqlStore::connect(url, actuator_sensor_id).await?;
            store.ensure_schema(&config.sensors).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!(
                "No database configured, using in-memory storage with {} sensors",
                config.sensors.len()
            );
            Ok(Arc::new(
                memory::MemoryStore::new(config.sensors.clone(), actuator_sensor_id)
                    .with_retention(config.memory_retention),
            ))
        }
    }
}
