use chrono::Local;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connections::ConnectionManager;
use super::control::{Decision, MotorController};
use crate::mqtt::message_manager::MqttMessage;
use crate::persistence::{NewReading, PersistenceGateway};
use crate::telemetry::{parser, SnapshotReading, TelemetrySnapshot};

/// Result of one telemetry message.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub snapshot: Arc<TelemetrySnapshot>,
    pub stored: u64,
    pub decision: Decision,
}

/// Turns telemetry lines into stored readings, a broadcast snapshot and a
/// control cycle.
pub struct IngestionHandler {
    gateway: Arc<dyn PersistenceGateway>,
    connections: Arc<ConnectionManager>,
    controller: Arc<MotorController>,
    telemetry_topic: String,
}

impl IngestionHandler {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        connections: Arc<ConnectionManager>,
        controller: Arc<MotorController>,
        telemetry_topic: String,
    ) -> Self {
        Self {
            gateway,
            connections,
            controller,
            telemetry_topic,
        }
    }

    /// Runs the topic callback, then the telemetry pipeline if the message
    /// arrived on the telemetry topic.
    pub async fn handle(&self, message: MqttMessage) -> Option<IngestReport> {
        if let Some(callback) = &message.callback {
            callback(&message);
        }
        if message.topic != self.telemetry_topic {
            debug!("No pipeline for topic {}", message.topic);
            return None;
        }
        Some(self.ingest(&message.payload).await)
    }

    /// Storage failures only cost persistence; the snapshot is broadcast
    /// regardless, even when nothing could be parsed.
    pub async fn ingest(&self, payload: &str) -> IngestReport {
        let parsed = parser::parse(payload);
        if parsed.is_empty() {
            debug!("No readings in payload: {}", payload);
        }

        let names: Vec<String> = parsed.iter().map(|(name, _)| name.clone()).collect();
        let ids = if names.is_empty() {
            Default::default()
        } else {
            match self.gateway.resolve_sensor_ids(&names).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Failed to resolve sensor ids: {}", e);
                    Default::default()
                }
            }
        };

        let timestamp = Local::now();
        let readings: Vec<SnapshotReading> = parsed
            .into_iter()
            .filter_map(|(name, value)| match ids.get(&name) {
                Some(&id) => Some(SnapshotReading::new(id, name, value)),
                None => {
                    warn!("Unknown sensor '{}', reading dropped", name);
                    None
                }
            })
            .collect();

        let stored = self.store(&readings, timestamp).await;

        let snapshot = TelemetrySnapshot::new(timestamp, readings);
        self.connections.publish(snapshot.clone());
        let decision = self.controller.on_snapshot(&snapshot).await;

        IngestReport {
            snapshot: Arc::new(snapshot),
            stored,
            decision,
        }
    }

    async fn store(&self, readings: &[SnapshotReading], timestamp: chrono::DateTime<Local>) -> u64 {
        if readings.is_empty() {
            return 0;
        }
        let rows: Vec<NewReading> = readings
            .iter()
            .map(|reading| NewReading {
                sensor_id: reading.sensor_id,
                value: reading.value,
                timestamp,
            })
            .collect();
        match self.gateway.append_readings(&rows).await {
            Ok(count) => {
                debug!("Stored {} readings", count);
                count
            }
            Err(e) => {
                error!("Failed to store readings: {}", e);
                0
            }
        }
    }
}

/// Drains messages handed over by the MQTT thread, one at a time.
pub struct IngestionWorker {
    handle: JoinHandle<()>,
}

impl IngestionWorker {
    pub fn spawn(
        mut rx: mpsc::UnboundedReceiver<MqttMessage>,
        handler: Arc<IngestionHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            info!("Ingestion worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => {
                            debug!("Processing {}", message);
                            handler.handle(message).await;
                        }
                        None => break,
                    },
                }
            }
            info!("Ingestion worker stopped");
        });
        Self { handle }
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("Ingestion worker failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::state::SharedState;
    use crate::config::{ControlConfig, StorageConfig};
    use crate::mqtt::message_manager::dispatch_channel;
    use crate::mqtt::mqtt_handler::CommandPublisher;
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::{ReadingRow, SensorRow, StorageError};
    use crate::telemetry::ActuatorState;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Offline;

    impl CommandPublisher for Offline {
        fn publish(&self, _topic: &str, _payload: &str) -> bool {
            false
        }
    }

    /// Storage that is down: every write fails, resolution only when asked.
    struct FailingStore {
        sensors: MemoryStore,
        resolve_fails: bool,
    }

    impl FailingStore {
        fn new(resolve_fails: bool) -> Self {
            Self {
                sensors: MemoryStore::new(StorageConfig::default().sensors, 4),
                resolve_fails,
            }
        }

        fn down() -> StorageError {
            StorageError::Unavailable("connection refused".to_string())
        }
    }

    #[async_trait]
    impl PersistenceGateway for FailingStore {
        async fn resolve_sensor_ids(
            &self,
            names: &[String],
        ) -> Result<HashMap<String, i64>, StorageError> {
            if self.resolve_fails {
                return Err(Self::down());
            }
            self.sensors.resolve_sensor_ids(names).await
        }

        async fn append_readings(&self, _readings: &[NewReading]) -> Result<u64, StorageError> {
            Err(Self::down())
        }

        async fn append_actuator_reading(
            &self,
            _state: ActuatorState,
            _timestamp: DateTime<Local>,
        ) -> Result<(), StorageError> {
            Err(Self::down())
        }

        async fn latest_actuator_state(&self) -> Result<Option<ActuatorState>, StorageError> {
            Ok(None)
        }

        async fn sensor_by_id(&self, _id: i64) -> Result<Option<SensorRow>, StorageError> {
            Err(Self::down())
        }

        async fn sensor_readings(&self, _sensor_id: i64) -> Result<Vec<ReadingRow>, StorageError> {
            Err(Self::down())
        }

        async fn list_sensors(&self) -> Result<Vec<SensorRow>, StorageError> {
            Err(Self::down())
        }

        async fn recent_readings(
            &self,
            _limit: u32,
        ) -> Result<BTreeMap<i64, Vec<ReadingRow>>, StorageError> {
            Err(Self::down())
        }
    }

    struct Pipeline {
        handler: Arc<IngestionHandler>,
        state: Arc<SharedState>,
        connections: Arc<ConnectionManager>,
    }

    fn pipeline(gateway: Arc<dyn PersistenceGateway>) -> Pipeline {
        let state = Arc::new(SharedState::new());
        let connections = Arc::new(ConnectionManager::new(state.latest.clone(), 8));
        let controller = Arc::new(MotorController::new(
            state.clone(),
            gateway.clone(),
            Arc::new(Offline),
            connections.clone(),
            ControlConfig::default(),
            "motor/control".to_string(),
        ));
        let handler = Arc::new(IngestionHandler::new(
            gateway,
            connections.clone(),
            controller,
            "sensors/data".to_string(),
        ));
        Pipeline {
            handler,
            state,
            connections,
        }
    }

    struct Fixture {
        handler: Arc<IngestionHandler>,
        store: Arc<MemoryStore>,
        state: Arc<SharedState>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new(StorageConfig::default().sensors, 4));
        let Pipeline { handler, state, .. } = pipeline(store.clone());
        Fixture {
            handler,
            store,
            state,
        }
    }

    #[tokio::test]
    async fn known_readings_are_stored_in_order() {
        let f = fixture();
        let report = f
            .handler
            .ingest("Humidity Sensor 1: 61, Ghost Sensor: 3, Temperature Sensor 1: 22.5")
            .await;

        assert_eq!(report.stored, 2);
        let ids: Vec<i64> = report.snapshot.readings.iter().map(|r| r.sensor_id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(report.decision, Decision::Hold);
        assert_eq!(f.store.reading_count().await, 2);
        assert_eq!(*f.state.latest.get().unwrap(), *report.snapshot);
    }

    #[tokio::test]
    async fn garbage_still_produces_an_empty_snapshot() {
        let f = fixture();
        let report = f.handler.ingest("garbage").await;
        assert!(report.snapshot.is_empty());
        assert_eq!(report.stored, 0);
        assert!(f.state.latest.get().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_storage_still_broadcasts() {
        let p = pipeline(Arc::new(FailingStore::new(true)));
        let mut client = p.connections.connect();

        let report = p.handler.ingest("Temperature Sensor 1: 41").await;
        assert_eq!(report.stored, 0);
        assert!(report.snapshot.is_empty());
        assert_eq!(report.decision, Decision::Hold);

        let delivered = client.try_next_outbound().expect("snapshot delivered");
        assert!(delivered.is_empty());
        assert!(client.try_next_outbound().is_none());
    }

    #[tokio::test]
    async fn failed_actuator_write_holds_the_motor() {
        let p = pipeline(Arc::new(FailingStore::new(false)));
        let mut client = p.connections.connect();

        let report = p.handler.ingest("Temperature Sensor 1: 41").await;
        assert_eq!(report.stored, 0);
        assert_eq!(report.snapshot.value_of(2), Some(41.0));
        assert_eq!(report.decision, Decision::Hold);
        assert!(!p.state.motor_started_by_temperature().await);

        // Only the telemetry snapshot; no alert or actuator state follows.
        let delivered = client.try_next_outbound().expect("snapshot delivered");
        assert_eq!(delivered.value_of(2), Some(41.0));
        assert!(delivered.alert.is_none());
        assert!(client.try_next_outbound().is_none());
        assert!(p.state.latest.get().unwrap().alert.is_none());
    }

    #[tokio::test]
    async fn other_topics_only_run_their_callback() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let message = MqttMessage::from_topic("sensor/data", "Temperature Sensor 1: 50").with_callback(
            Some(Arc::new(move |_: &MqttMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(f.handler.handle(message).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.reading_count().await, 0);
        assert!(f.state.latest.get().is_none());
    }

    #[tokio::test]
    async fn worker_processes_until_cancelled() {
        let f = fixture();
        let (tx, rx) = dispatch_channel();
        let shutdown = CancellationToken::new();
        let worker = IngestionWorker::spawn(rx, f.handler.clone(), shutdown.clone());

        tx.send(MqttMessage::from_topic("sensors/data", "Current Sensor 1: 1.5"))
            .unwrap();
        while f.store.reading_count().await == 0 {
            tokio::task::yield_now().await;
        }

        shutdown.cancel();
        worker.join().await;
        assert_eq!(f.store.readings_of(1).await[0].value, 1.5);
    }
}
