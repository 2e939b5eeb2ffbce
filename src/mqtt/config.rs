use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection and topic layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Subscribed at startup, in this order.
    pub topics: Vec<String>,
    /// Topic whose payloads are parsed as telemetry lines.
    pub telemetry_topic: String,
    /// Topic receiving `start` / `stop` commands for the actuator.
    pub control_topic: String,
    /// Pause before the network loop polls again after a connection error.
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "sensorbridge".to_string(),
            keep_alive_secs: 60,
            username: None,
            password: None,
            topics: vec!["sensor/data".to_string(), "sensors/data".to_string()],
            telemetry_topic: "sensors/data".to_string(),
            control_topic: "motor/control".to_string(),
            reconnect_delay_ms: 1000,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
