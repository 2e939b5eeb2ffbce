//! # Live Pipeline
//!
//! Everything between the broker thread and the connected clients.
//!
//! ```text
//! bridge/
//! ├── state.rs        - latest snapshot + control flag
//! ├── connections.rs  - live set, fan-out, per-connection dedupe
//! ├── session.rs      - per-client loop (Connecting → Open → Closed)
//! ├── control.rs      - hysteresis controller, manual commands
//! └── ingest.rs       - telemetry handling and its worker task
//! ```
//!
//! [`Bridge`] wires the pieces together once at startup; all of them are
//! shared through `Arc` and injected, never reached through globals.

pub mod connections;
pub mod control;
pub mod ingest;
pub mod session;
pub mod state;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BridgeConfig;
use crate::mqtt::message_manager::dispatch_channel;
use crate::mqtt::mqtt_handler::{CommandPublisher, MqttHandler, TransportError};
use crate::persistence::PersistenceGateway;
use connections::ConnectionManager;
use control::MotorController;
use ingest::{IngestionHandler, IngestionWorker};
use state::SharedState;

pub struct Bridge {
    pub config: BridgeConfig,
    pub state: Arc<SharedState>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub connections: Arc<ConnectionManager>,
    pub controller: Arc<MotorController>,
    pub ingestion: Arc<IngestionHandler>,
    pub mqtt: Arc<MqttHandler>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        gateway: Arc<dyn PersistenceGateway>,
        mqtt: Arc<MqttHandler>,
    ) -> Self {
        let publisher: Arc<dyn CommandPublisher> = mqtt.clone();
        Self::with_publisher(config, gateway, mqtt, publisher)
    }

    /// Same as [`Bridge::new`] but actuator commands go to `publisher`.
    pub fn with_publisher(
        config: BridgeConfig,
        gateway: Arc<dyn PersistenceGateway>,
        mqtt: Arc<MqttHandler>,
        publisher: Arc<dyn CommandPublisher>,
    ) -> Self {
        let state = Arc::new(SharedState::new());
        let connections = Arc::new(ConnectionManager::new(
            state.latest.clone(),
            config.websocket.outbound_buffer,
        ));
        let controller = Arc::new(MotorController::new(
            state.clone(),
            gateway.clone(),
            publisher,
            connections.clone(),
            config.control.clone(),
            config.mqtt.control_topic.clone(),
        ));
        let ingestion = Arc::new(IngestionHandler::new(
            gateway.clone(),
            connections.clone(),
            controller.clone(),
            config.mqtt.telemetry_topic.clone(),
        ));

        Self {
            config,
            state,
            gateway,
            connections,
            controller,
            ingestion,
            mqtt,
        }
    }

    /// Spawns the ingestion worker, registers it with the MQTT handler and
    /// connects. The dispatcher is in place before the first message can
    /// arrive.
    pub fn start(&self, shutdown: CancellationToken) -> Result<IngestionWorker, TransportError> {
        let (tx, rx) = dispatch_channel();
        let worker = IngestionWorker::spawn(rx, self.ingestion.clone(), shutdown);
        self.mqtt.set_dispatcher(tx);
        self.mqtt.start()?;
        for topic in &self.config.mqtt.topics {
            self.mqtt.subscribe(topic, None);
        }
        info!(
            "Bridge started, {} topics registered",
            self.config.mqtt.topics.len()
        );
        Ok(worker)
    }

    pub fn stop(&self) {
        self.mqtt.stop();
    }
}
