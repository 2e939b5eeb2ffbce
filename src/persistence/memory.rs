//! In-process storage used when no database URL is configured.
//!
//! Data lives only as long as the process. Sensor registrations come from the
//! configured seed list; readings are appended with increasing ids. Each
//! sensor keeps at most `retention` rows, the oldest are dropped on append.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use super::{NewReading, PersistenceGateway, ReadingRow, SensorRow, StorageError};
use crate::telemetry::ActuatorState;

#[derive(Default)]
struct Tables {
    sensors: Vec<SensorRow>,
    readings: Vec<ReadingRow>,
    next_reading_id: i64,
}

pub const DEFAULT_RETENTION: usize = 500;

pub struct MemoryStore {
    tables: RwLock<Tables>,
    actuator_sensor_id: i64,
    retention: usize,
}

impl MemoryStore {
    pub fn new(sensors: Vec<SensorRow>, actuator_sensor_id: i64) -> Self {
        Self {
            tables: RwLock::new(Tables {
                sensors,
                readings: Vec::new(),
                next_reading_id: 1,
            }),
            actuator_sensor_id,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Rows kept per sensor. At least one, so the actuator state survives.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Number of stored readings across all sensors.
    pub async fn reading_count(&self) -> usize {
        self.tables.read().await.readings.len()
    }

    /// Stored readings of one sensor in insertion order.
    pub async fn readings_of(&self, sensor_id: i64) -> Vec<ReadingRow> {
        self.tables
            .read()
            .await
            .readings
            .iter()
            .filter(|row| row.sensor_id == sensor_id)
            .cloned()
            .collect()
    }

    fn push(tables: &mut Tables, sensor_id: i64, value: f64, timestamp: DateTime<Local>) {
        let id = tables.next_reading_id;
        tables.next_reading_id += 1;
        tables.readings.push(ReadingRow {
            id,
            sensor_id,
            value,
            timestamp: timestamp.naive_local(),
        });
    }

    /// Drops the oldest rows of `sensor_id` beyond the retention limit, in
    /// the same (timestamp, id) order the newest row is picked by.
    fn trim(&self, tables: &mut Tables, sensor_id: i64) {
        let mut keys: Vec<(NaiveDateTime, i64)> = tables
            .readings
            .iter()
            .filter(|row| row.sensor_id == sensor_id)
            .map(|row| (row.timestamp, row.id))
            .collect();
        if keys.len() <= self.retention {
            return;
        }
        keys.sort_unstable();
        let oldest_kept = keys[keys.len() - self.retention];
        tables
            .readings
            .retain(|row| row.sensor_id != sensor_id || (row.timestamp, row.id) >= oldest_kept);
        debug!(
            "Trimmed {} old readings of sensor {}",
            keys.len() - self.retention,
            sensor_id
        );
    }
}

/// Newest first; ties on the timestamp fall back to insertion order.
fn newest_first(rows: &mut [ReadingRow]) {
    rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn resolve_sensor_ids(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, i64>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .sensors
            .iter()
            .filter(|sensor| names.contains(&sensor.name))
            .map(|sensor| (sensor.name.clone(), sensor.id))
            .collect())
    }

    async fn append_readings(&self, readings: &[NewReading]) -> Result<u64, StorageError> {
        let mut tables = self.tables.write().await;
        if let Some(unknown) = readings
            .iter()
            .find(|reading| !tables.sensors.iter().any(|s| s.id == reading.sensor_id))
        {
            return Err(StorageError::InvalidRow(format!(
                "unknown sensor id {}",
                unknown.sensor_id
            )));
        }

        for reading in readings {
            Self::push(&mut tables, reading.sensor_id, reading.value, reading.timestamp);
        }
        let mut touched: Vec<i64> = readings.iter().map(|reading| reading.sensor_id).collect();
        touched.sort_unstable();
        touched.dedup();
        for sensor_id in touched {
            self.trim(&mut tables, sensor_id);
        }
        debug!("Stored {} readings in memory", readings.len());
        Ok(readings.len() as u64)
    }

    async fn append_actuator_reading(
        &self,
        state: ActuatorState,
        timestamp: DateTime<Local>,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        Self::push(&mut tables, self.actuator_sensor_id, state.value(), timestamp);
        self.trim(&mut tables, self.actuator_sensor_id);
        Ok(())
    }

    async fn latest_actuator_state(&self) -> Result<Option<ActuatorState>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .readings
            .iter()
            .filter(|row| row.sensor_id == self.actuator_sensor_id)
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)))
            .map(|row| ActuatorState::from_value(row.value)))
    }

    async fn sensor_by_id(&self, id: i64) -> Result<Option<SensorRow>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.sensors.iter().find(|sensor| sensor.id == id).cloned())
    }

    async fn sensor_readings(&self, sensor_id: i64) -> Result<Vec<ReadingRow>, StorageError> {
        let mut rows = self.readings_of(sensor_id).await;
        newest_first(&mut rows);
        Ok(rows)
    }

    async fn list_sensors(&self) -> Result<Vec<SensorRow>, StorageError> {
        let mut sensors = self.tables.read().await.sensors.clone();
        sensors.sort_by_key(|sensor| sensor.id);
        Ok(sensors)
    }

    async fn recent_readings(
        &self,
        limit: u32,
    ) -> Result<BTreeMap<i64, Vec<ReadingRow>>, StorageError> {
        let tables = self.tables.read().await;
        let mut grouped: BTreeMap<i64, Vec<ReadingRow>> = BTreeMap::new();
        for row in &tables.readings {
            grouped.entry(row.sensor_id).or_default().push(row.clone());
        }
        for rows in grouped.values_mut() {
            newest_first(rows);
            rows.truncate(limit as usize);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sensors() -> Vec<SensorRow> {
        vec![
            SensorRow {
                id: 2,
                name: "Temperature Sensor 1".to_string(),
                sensor_type: "temperature".to_string(),
            },
            SensorRow {
                id: 4,
                name: "Relay Status".to_string(),
                sensor_type: "relay".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn unknown_names_are_absent_from_resolution() {
        let store = MemoryStore::new(sensors(), 4);
        let ids = store
            .resolve_sensor_ids(&["Temperature Sensor 1".to_string(), "Ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids["Temperature Sensor 1"], 2);
    }

    #[tokio::test]
    async fn actuator_state_is_the_most_recent_reading() {
        let store = MemoryStore::new(sensors(), 4);
        assert_eq!(store.latest_actuator_state().await.unwrap(), None);

        let now = Local::now();
        store
            .append_actuator_reading(ActuatorState::On, now)
            .await
            .unwrap();
        store
            .append_actuator_reading(ActuatorState::Off, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(
            store.latest_actuator_state().await.unwrap(),
            Some(ActuatorState::Off)
        );
    }

    #[tokio::test]
    async fn append_rejects_unknown_sensor() {
        let store = MemoryStore::new(sensors(), 4);
        let result = store
            .append_readings(&[NewReading {
                sensor_id: 99,
                value: 1.0,
                timestamp: Local::now(),
            }])
            .await;
        assert!(matches!(result, Err(StorageError::InvalidRow(_))));
        assert_eq!(store.reading_count().await, 0);
    }

    #[tokio::test]
    async fn recent_readings_are_limited_per_sensor() {
        let store = MemoryStore::new(sensors(), 4);
        let start = Local::now();
        let batch: Vec<NewReading> = (0..5)
            .map(|i| NewReading {
                sensor_id: 2,
                value: f64::from(i),
                timestamp: start + Duration::seconds(i64::from(i)),
            })
            .collect();
        store.append_readings(&batch).await.unwrap();
        store
            .append_actuator_reading(ActuatorState::On, start)
            .await
            .unwrap();

        let recent = store.recent_readings(3).await.unwrap();
        let values: Vec<f64> = recent[&2].iter().map(|row| row.value).collect();
        assert_eq!(values, vec![4.0, 3.0, 2.0]);
        assert_eq!(recent[&4].len(), 1);
    }

    #[tokio::test]
    async fn retention_caps_rows_per_sensor() {
        let store = MemoryStore::new(sensors(), 4).with_retention(3);
        let start = Local::now();
        for i in 0..10 {
            store
                .append_readings(&[NewReading {
                    sensor_id: 2,
                    value: f64::from(i),
                    timestamp: start + Duration::seconds(i64::from(i)),
                }])
                .await
                .unwrap();
        }
        store
            .append_actuator_reading(ActuatorState::On, start)
            .await
            .unwrap();
        for i in 1..6 {
            store
                .append_actuator_reading(ActuatorState::Off, start + Duration::seconds(i))
                .await
                .unwrap();
        }
        store
            .append_actuator_reading(ActuatorState::On, start + Duration::seconds(30))
            .await
            .unwrap();

        let values: Vec<f64> = store.readings_of(2).await.iter().map(|row| row.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
        assert_eq!(store.readings_of(4).await.len(), 3);
        assert_eq!(store.reading_count().await, 6);
        assert_eq!(
            store.latest_actuator_state().await.unwrap(),
            Some(ActuatorState::On)
        );
    }

    #[tokio::test]
    async fn late_row_with_old_timestamp_is_trimmed_first() {
        let store = MemoryStore::new(sensors(), 4).with_retention(1);
        let now = Local::now();
        store
            .append_actuator_reading(ActuatorState::On, now)
            .await
            .unwrap();
        store
            .append_actuator_reading(ActuatorState::Off, now - Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(
            store.latest_actuator_state().await.unwrap(),
            Some(ActuatorState::On)
        );
        assert_eq!(store.readings_of(4).await.len(), 1);
    }
}
