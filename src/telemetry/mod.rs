//! # Telemetry Model
//!
//! Types shared by every stage of the live pipeline: what a sensor reported,
//! how readings are bundled for broadcast and what the controller attaches
//! when it acts on its own.
//!
//! ```text
//! "Temperature Sensor 1: 41.2" ──parse──► [(name, value)]
//!                                              │ resolve ids
//!                                              ▼
//!                                      TelemetrySnapshot ──► live clients
//! ```
//!
//! A snapshot is the unit of broadcast. All readings inside it share one
//! observation timestamp and keep the order in which they arrived, because
//! dashboards interpret readings by position and sensor id.

pub mod parser;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry of a [`TelemetrySnapshot`]; the timestamp lives on the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReading {
    pub sensor_id: i64,
    pub sensor_name: String,
    pub value: f64,
}

impl SnapshotReading {
    pub fn new(sensor_id: i64, sensor_name: impl Into<String>, value: f64) -> Self {
        Self {
            sensor_id,
            sensor_name: sensor_name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TemperatureHigh,
    TemperatureNormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    MotorStarted,
    MotorStopped,
}

/// Attached to snapshots produced by the automatic controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub temperature: f64,
    pub action: AlertAction,
}

impl Alert {
    pub fn temperature_high(temperature: f64, threshold: f64) -> Self {
        Self {
            kind: AlertKind::TemperatureHigh,
            message: format!(
                "Temperature ({temperature}°C) exceeded threshold of {threshold}°C. Motor started automatically."
            ),
            temperature,
            action: AlertAction::MotorStarted,
        }
    }

    pub fn temperature_normal(temperature: f64, threshold: f64) -> Self {
        Self {
            kind: AlertKind::TemperatureNormal,
            message: format!(
                "Temperature ({temperature}°C) fell below threshold of {threshold}°C. Motor stopped automatically."
            ),
            temperature,
            action: AlertAction::MotorStopped,
        }
    }
}

/// The broadcast unit sent to every live client as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Local>,
    pub readings: Vec<SnapshotReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}

impl TelemetrySnapshot {
    pub fn new(timestamp: DateTime<Local>, readings: Vec<SnapshotReading>) -> Self {
        Self {
            timestamp,
            readings,
            alert: None,
        }
    }

    pub fn with_alert(mut self, alert: Alert) -> Self {
        self.alert = Some(alert);
        self
    }

    /// Value of the first reading carrying `sensor_id`.
    pub fn value_of(&self, sensor_id: i64) -> Option<f64> {
        self.readings
            .iter()
            .find(|reading| reading.sensor_id == sensor_id)
            .map(|reading| reading.value)
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Logical state of the actuator (motor / relay).
///
/// There is no dedicated table for it: the state is whatever the most recent
/// actuator reading says, `1` meaning on and `0` meaning off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorState {
    Off,
    On,
}

impl ActuatorState {
    pub const ON_VALUE: f64 = 1.0;
    pub const OFF_VALUE: f64 = 0.0;

    pub fn from_value(value: f64) -> Self {
        if value == Self::ON_VALUE {
            ActuatorState::On
        } else {
            ActuatorState::Off
        }
    }

    pub fn value(self) -> f64 {
        match self {
            ActuatorState::On => Self::ON_VALUE,
            ActuatorState::Off => Self::OFF_VALUE,
        }
    }

    pub fn is_on(self) -> bool {
        self == ActuatorState::On
    }

    /// Payload published on the control topic.
    pub fn command(self) -> &'static str {
        match self {
            ActuatorState::On => "start",
            ActuatorState::Off => "stop",
        }
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ActuatorState::On => write!(f, "on"),
            ActuatorState::Off => write!(f, "off"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_alert_type_field() {
        let snapshot = TelemetrySnapshot::new(Local::now(), vec![SnapshotReading::new(4, "Relay Status", 1.0)])
            .with_alert(Alert::temperature_high(41.2, 40.0));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["alert"]["type"], "temperature_high");
        assert_eq!(json["alert"]["action"], "motor_started");
        assert_eq!(json["readings"][0]["sensor_id"], 4);
    }

    #[test]
    fn snapshot_without_alert_omits_the_field() {
        let snapshot = TelemetrySnapshot::new(Local::now(), Vec::new());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("alert").is_none());
        assert_eq!(json["readings"], serde_json::json!([]));
    }

    #[test]
    fn value_of_returns_first_match_in_order() {
        let snapshot = TelemetrySnapshot::new(
            Local::now(),
            vec![
                SnapshotReading::new(2, "Temperature Sensor 1", 35.0),
                SnapshotReading::new(2, "Temperature Sensor 1", 36.0),
            ],
        );
        assert_eq!(snapshot.value_of(2), Some(35.0));
        assert_eq!(snapshot.value_of(4), None);
    }

    #[test]
    fn actuator_state_maps_values() {
        assert_eq!(ActuatorState::from_value(1.0), ActuatorState::On);
        assert_eq!(ActuatorState::from_value(0.0), ActuatorState::Off);
        assert_eq!(ActuatorState::from_value(0.5), ActuatorState::Off);
        assert_eq!(ActuatorState::On.command(), "start");
        assert_eq!(ActuatorState::Off.command(), "stop");
    }
}
