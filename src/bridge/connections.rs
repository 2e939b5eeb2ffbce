//! Live set of client connections and snapshot fan-out.
//!
//! Every connection owns a bounded outbound queue. All delivery paths go
//! through this manager and compare against the connection's last sent
//! snapshot under one lock, so a snapshot reaching a connection both through
//! a broadcast and through its own wakeup is only queued once.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::state::LatestState;
use crate::telemetry::TelemetrySnapshot;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Connection already received an equal snapshot.
    Unchanged,
    Failed,
    /// Connection is not (or no longer) in the live set.
    Gone,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub queued: usize,
    pub unchanged: usize,
    pub failed: usize,
}

struct LiveConnection {
    outbound: mpsc::Sender<Arc<TelemetrySnapshot>>,
    last_sent: Option<Arc<TelemetrySnapshot>>,
}

impl LiveConnection {
    fn offer(&mut self, id: ConnectionId, snapshot: &Arc<TelemetrySnapshot>) -> Delivery {
        if let Some(last) = &self.last_sent {
            if Arc::ptr_eq(last, snapshot) || **last == **snapshot {
                return Delivery::Unchanged;
            }
        }
        match self.outbound.try_send(snapshot.clone()) {
            Ok(()) => {
                self.last_sent = Some(snapshot.clone());
                Delivery::Queued
            }
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue of connection {} is full, skipping snapshot", id);
                Delivery::Failed
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Connection {} stopped reading, skipping snapshot", id);
                Delivery::Failed
            }
        }
    }
}

#[derive(Default)]
struct Live {
    next_id: ConnectionId,
    connections: BTreeMap<ConnectionId, LiveConnection>,
}

pub struct ConnectionManager {
    live: Mutex<Live>,
    latest: Arc<LatestState>,
    buffer: usize,
}

impl ConnectionManager {
    pub fn new(latest: Arc<LatestState>, buffer: usize) -> Self {
        Self {
            live: Mutex::new(Live::default()),
            latest,
            buffer: buffer.max(1),
        }
    }

    pub fn latest(&self) -> &Arc<LatestState> {
        &self.latest
    }

    /// Adds a connection to the live set. Dropping the returned
    /// registration removes it again.
    pub fn connect(self: &Arc<Self>) -> Registration {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = {
            let mut live = self.live.lock();
            live.next_id += 1;
            let id = live.next_id;
            live.connections.insert(
                id,
                LiveConnection {
                    outbound: tx,
                    last_sent: None,
                },
            );
            id
        };
        info!("Client connection {} opened", id);
        Registration {
            id,
            outbound: rx,
            manager: self.clone(),
        }
    }

    /// Removes a connection. Returns false if it was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.live.lock().connections.remove(&id).is_some();
        if removed {
            info!("Client connection {} closed", id);
        } else {
            debug!("Client connection {} already closed", id);
        }
        removed
    }

    /// Makes `snapshot` the latest state and queues it for every connection.
    pub fn publish(&self, snapshot: TelemetrySnapshot) -> BroadcastReport {
        let snapshot = Arc::new(snapshot);
        let mut live = self.live.lock();
        self.latest.replace(snapshot.clone());
        Self::fan_out(&mut live, &snapshot)
    }

    /// Queues `snapshot` for every live connection. A failing connection is
    /// logged and stays in the live set.
    pub fn broadcast(&self, snapshot: &Arc<TelemetrySnapshot>) -> BroadcastReport {
        let mut live = self.live.lock();
        Self::fan_out(&mut live, snapshot)
    }

    /// Queues the current latest state for one connection if it has not
    /// seen it yet.
    pub fn deliver_latest(&self, id: ConnectionId) -> Delivery {
        let mut live = self.live.lock();
        let Some(snapshot) = self.latest.get() else {
            return Delivery::Unchanged;
        };
        match live.connections.get_mut(&id) {
            Some(connection) => connection.offer(id, &snapshot),
            None => Delivery::Gone,
        }
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.live.lock().connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fan_out(live: &mut Live, snapshot: &Arc<TelemetrySnapshot>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, connection) in live.connections.iter_mut() {
            match connection.offer(*id, snapshot) {
                Delivery::Queued => report.queued += 1,
                Delivery::Unchanged => report.unchanged += 1,
                Delivery::Failed | Delivery::Gone => report.failed += 1,
            }
        }
        debug!(
            "Broadcast snapshot: {} queued, {} unchanged, {} failed",
            report.queued, report.unchanged, report.failed
        );
        report
    }
}

/// Membership of one connection in the live set.
pub struct Registration {
    id: ConnectionId,
    outbound: mpsc::Receiver<Arc<TelemetrySnapshot>>,
    manager: Arc<ConnectionManager>,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub async fn next_outbound(&mut self) -> Option<Arc<TelemetrySnapshot>> {
        self.outbound.recv().await
    }

    pub fn try_next_outbound(&mut self) -> Option<Arc<TelemetrySnapshot>> {
        self.outbound.try_recv().ok()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.manager.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::SnapshotReading;
    use chrono::Local;

    fn manager(buffer: usize) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(Arc::new(LatestState::new()), buffer))
    }

    fn snapshot(value: f64) -> TelemetrySnapshot {
        TelemetrySnapshot::new(
            Local::now(),
            vec![SnapshotReading::new(2, "Temperature Sensor 1", value)],
        )
    }

    #[test]
    fn identical_snapshot_is_sent_once() {
        let manager = manager(4);
        let mut client = manager.connect();
        let snapshot = Arc::new(snapshot(21.0));

        assert_eq!(manager.broadcast(&snapshot).queued, 1);
        let same_value = Arc::new((*snapshot).clone());
        assert_eq!(manager.broadcast(&same_value).unchanged, 1);

        assert!(client.try_next_outbound().is_some());
        assert!(client.try_next_outbound().is_none());
    }

    #[test]
    fn failing_connection_does_not_block_others() {
        let manager = manager(1);
        let mut healthy = manager.connect();
        let stuck = manager.connect();

        manager.broadcast(&Arc::new(snapshot(21.0)));
        healthy.try_next_outbound().unwrap();

        // `stuck` never drains its queue, so the second send overflows it.
        let report = manager.broadcast(&Arc::new(snapshot(22.0)));
        assert_eq!(report.queued, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(healthy.try_next_outbound().unwrap().value_of(2), Some(22.0));

        assert!(manager.is_live(stuck.id()));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn publish_updates_latest_and_deliver_dedupes() {
        let manager = manager(4);
        let mut client = manager.connect();

        manager.publish(snapshot(30.0));
        assert_eq!(manager.latest().get().unwrap().value_of(2), Some(30.0));
        assert_eq!(manager.deliver_latest(client.id()), Delivery::Unchanged);
        assert!(client.try_next_outbound().is_some());

        let late = manager.connect();
        assert_eq!(manager.deliver_latest(late.id()), Delivery::Queued);
    }

    #[test]
    fn disconnect_is_idempotent_and_drop_unregisters() {
        let manager = manager(4);
        let first = manager.connect();
        let second = manager.connect();
        let id = first.id();

        assert!(manager.disconnect(id));
        assert!(!manager.disconnect(id));
        assert_eq!(manager.deliver_latest(id), Delivery::Unchanged);
        drop(first);
        assert_eq!(manager.len(), 1);

        drop(second);
        assert!(manager.is_empty());
    }

    #[test]
    fn deliver_to_closed_connection_reports_gone() {
        let manager = manager(4);
        let client = manager.connect();
        let id = client.id();
        drop(client);

        manager.publish(snapshot(25.0));
        assert_eq!(manager.deliver_latest(id), Delivery::Gone);
    }
}
