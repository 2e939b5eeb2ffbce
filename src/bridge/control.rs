//! Temperature controller for the actuator.
//!
//! The controller starts the motor when the temperature rises above the
//! start threshold and only stops it again once the temperature has fallen
//! below the lower stop threshold, and only if it was the one that started
//! it. A manual command always takes the motor out of automatic hands.

use chrono::Local;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::connections::ConnectionManager;
use super::state::{ControlFlag, SharedState};
use crate::config::ControlConfig;
use crate::mqtt::mqtt_handler::CommandPublisher;
use crate::persistence::{PersistenceGateway, StorageError};
use crate::telemetry::{ActuatorState, Alert, SnapshotReading, TelemetrySnapshot};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Invalid command: {0}. Must be 'start' or 'stop'")]
    InvalidCommand(String),

    #[error("Failed to store actuator state: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to publish '{command}' to {topic}")]
    PublishFailed { command: MotorCommand, topic: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Start,
    Stop,
    Hold,
}

/// One step of the hysteresis rules. At most one action per call.
pub fn decide(
    temperature: f64,
    actuator: ActuatorState,
    flag: ControlFlag,
    config: &ControlConfig,
) -> Decision {
    if temperature > config.start_above && !actuator.is_on() {
        Decision::Start
    } else if temperature < config.stop_below
        && actuator.is_on()
        && flag.motor_started_by_temperature
    {
        Decision::Stop
    } else {
        Decision::Hold
    }
}

/// Command accepted from the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    Start,
    Stop,
}

impl MotorCommand {
    pub fn target(self) -> ActuatorState {
        match self {
            MotorCommand::Start => ActuatorState::On,
            MotorCommand::Stop => ActuatorState::Off,
        }
    }
}

impl FromStr for MotorCommand {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(MotorCommand::Start),
            "stop" => Ok(MotorCommand::Stop),
            other => Err(ControlError::InvalidCommand(other.to_string())),
        }
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.target().command())
    }
}

/// What a manual command reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualOutcome {
    pub command: MotorCommand,
    pub persisted: bool,
    pub published: bool,
}

pub struct MotorController {
    state: Arc<SharedState>,
    gateway: Arc<dyn PersistenceGateway>,
    publisher: Arc<dyn CommandPublisher>,
    connections: Arc<ConnectionManager>,
    config: ControlConfig,
    control_topic: String,
}

impl MotorController {
    pub fn new(
        state: Arc<SharedState>,
        gateway: Arc<dyn PersistenceGateway>,
        publisher: Arc<dyn CommandPublisher>,
        connections: Arc<ConnectionManager>,
        config: ControlConfig,
        control_topic: String,
    ) -> Self {
        Self {
            state,
            gateway,
            publisher,
            connections,
            config,
            control_topic,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Runs the rules for a snapshot carrying the temperature sensor.
    /// Snapshots without it are left alone.
    pub async fn on_snapshot(&self, snapshot: &TelemetrySnapshot) -> Decision {
        let Some(temperature) = snapshot.value_of(self.config.temperature_sensor_id) else {
            return Decision::Hold;
        };
        let reported = snapshot
            .value_of(self.config.actuator_sensor_id)
            .map(ActuatorState::from_value);
        self.on_temperature(temperature, reported).await
    }

    /// `reported` is the actuator state seen alongside the temperature; when
    /// absent, the last stored state is used.
    pub async fn on_temperature(&self, temperature: f64, reported: Option<ActuatorState>) -> Decision {
        let mut flag = self.state.lock_control().await;

        let actuator = match reported {
            Some(state) => state,
            None => match self.gateway.latest_actuator_state().await {
                Ok(state) => state.unwrap_or(ActuatorState::Off),
                Err(e) => {
                    warn!("Skipping control cycle, actuator state unknown: {}", e);
                    return Decision::Hold;
                }
            },
        };

        // The flag only ever describes a motor that is running.
        if !actuator.is_on() && flag.motor_started_by_temperature {
            debug!("Actuator confirmed off, clearing automatic start flag");
            flag.motor_started_by_temperature = false;
        }

        let decision = decide(temperature, actuator, *flag, &self.config);
        let (target, alert) = match decision {
            Decision::Hold => return Decision::Hold,
            Decision::Start => {
                warn!(
                    "Temperature {} above {}, starting motor",
                    temperature, self.config.start_above
                );
                (
                    ActuatorState::On,
                    Alert::temperature_high(temperature, self.config.start_above),
                )
            }
            Decision::Stop => {
                info!(
                    "Temperature {} below {}, stopping motor",
                    temperature, self.config.stop_below
                );
                (
                    ActuatorState::Off,
                    Alert::temperature_normal(temperature, self.config.stop_below),
                )
            }
        };

        if let Err(e) = self.persist(target).await {
            error!("Automatic {} not applied: {}", target.command(), e);
            return Decision::Hold;
        }
        self.publish_command(target);
        flag.motor_started_by_temperature = decision == Decision::Start;
        self.connections.publish(self.actuator_snapshot(target).with_alert(alert));
        decision
    }

    /// Applies a command from the control API.
    ///
    /// Clears the automatic flag for either command. The new state is
    /// broadcast when it was stored or sent; an unsent command is still an
    /// error for the caller.
    pub async fn manual(&self, command: MotorCommand) -> Result<ManualOutcome, ControlError> {
        let mut flag = self.state.lock_control().await;
        flag.motor_started_by_temperature = false;

        let target = command.target();
        let persisted = match self.persist(target).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to store manual {}: {}", command, e);
                false
            }
        };
        let published = self.publish_command(target);

        if persisted || published {
            self.connections.publish(self.actuator_snapshot(target));
        }
        info!(
            "Manual {} handled (persisted: {}, published: {})",
            command, persisted, published
        );

        if !published {
            return Err(ControlError::PublishFailed {
                command,
                topic: self.control_topic.clone(),
            });
        }
        Ok(ManualOutcome {
            command,
            persisted,
            published,
        })
    }

    async fn persist(&self, target: ActuatorState) -> Result<(), StorageError> {
        self.gateway
            .append_actuator_reading(target, Local::now())
            .await
    }

    fn publish_command(&self, target: ActuatorState) -> bool {
        let sent = self.publisher.publish(&self.control_topic, target.command());
        if !sent {
            warn!(
                "Command '{}' did not reach {}, actuator may not have switched",
                target.command(),
                self.control_topic
            );
        }
        sent
    }

    fn actuator_snapshot(&self, target: ActuatorState) -> TelemetrySnapshot {
        TelemetrySnapshot::new(
            Local::now(),
            vec![SnapshotReading::new(
                self.config.actuator_sensor_id,
                self.config.actuator_name.clone(),
                target.value(),
            )],
        )
    }
}
