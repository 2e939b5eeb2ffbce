use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::telemetry::TelemetrySnapshot;

/// Last broadcast snapshot, last writer wins.
///
/// Backed by a watch channel so connection loops wake up on every write
/// instead of polling.
pub struct LatestState {
    tx: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
}

impl Default for LatestState {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn get(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.tx.subscribe()
    }

    /// Only the connection manager writes, so the write and its fan-out
    /// happen under one lock.
    pub(crate) fn replace(&self, snapshot: Arc<TelemetrySnapshot>) {
        self.tx.send_replace(Some(snapshot));
    }
}

/// Set while the actuator is on because the controller switched it on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlFlag {
    pub motor_started_by_temperature: bool,
}

/// Process state injected into ingestion, control and the connection loops.
pub struct SharedState {
    pub latest: Arc<LatestState>,
    control_flag: Mutex<ControlFlag>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(LatestState::new()),
            control_flag: Mutex::new(ControlFlag::default()),
        }
    }

    /// Held for the whole decide-and-actuate step so that automatic and
    /// manual commands never interleave.
    pub async fn lock_control(&self) -> MutexGuard<'_, ControlFlag> {
        self.control_flag.lock().await
    }

    pub async fn motor_started_by_temperature(&self) -> bool {
        self.control_flag.lock().await.motor_started_by_temperature
    }
}
