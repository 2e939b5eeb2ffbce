//! Per-connection loop of a live client.
//!
//! A session moves `Connecting → Open → Closed` and never reopens. While
//! open it pushes every new snapshot to the client, answers heartbeats and
//! closes itself when the client has been silent for too long. Leaving the
//! open state always unregisters the connection, whatever ended the loop.

use async_trait::async_trait;
use serde::Serialize;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::connections::{ConnectionId, ConnectionManager, Registration};
use crate::config::WebSocketConfig;
use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Client closed the connection")]
    Closed,

    #[error("No heartbeat for more than {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Text channel to one client, e.g. a WebSocket.
#[async_trait]
pub trait ClientTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Next text message; `Ok(None)` once the client has closed.
    async fn recv_text(&mut self) -> Result<Option<String>, ConnectionError>;

    async fn close(&mut self);
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    HeartbeatAck,
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

#[machine]
pub struct ClientSession<S: SessionState> {
    transport: Box<dyn ClientTransport>,
    settings: WebSocketConfig,
    manager: Arc<ConnectionManager>,
    registration: Option<Registration>,
    connection_id: Option<ConnectionId>,
    last_heartbeat: Instant,
    close_reason: Option<ConnectionError>,
}

impl<S: SessionState> ClientSession<S> {
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }
}

impl ClientSession<Connecting> {
    pub fn accept(
        transport: Box<dyn ClientTransport>,
        manager: Arc<ConnectionManager>,
        settings: WebSocketConfig,
    ) -> Self {
        Self::new(
            transport,
            settings,
            manager,
            None,           // registration
            None,           // connection_id
            Instant::now(), // last_heartbeat
            None,           // close_reason
        )
    }

    /// Joins the live set.
    pub fn open(mut self) -> ClientSession<Open> {
        let registration = self.manager.connect();
        self.connection_id = Some(registration.id());
        self.registration = Some(registration);
        self.last_heartbeat = Instant::now();
        self.transition()
    }
}

impl ClientSession<Open> {
    /// Serves the client until it disconnects, times out or fails.
    pub async fn run(mut self) -> ClientSession<Closed> {
        let reason = match self.serve().await {
            Ok(()) => ConnectionError::Closed,
            Err(e) => e,
        };
        self.close(reason).await
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let Some(registration) = self.registration.as_mut() else {
            return Ok(());
        };
        let id = registration.id();
        let heartbeat_timeout = self.settings.heartbeat_timeout();
        let receive_timeout = self.settings.receive_timeout();
        let transport = &mut self.transport;
        let mut latest_rx = self.manager.latest().subscribe();

        loop {
            self.manager.deliver_latest(id);
            while let Some(snapshot) = registration.try_next_outbound() {
                send_snapshot(&mut **transport, &snapshot).await?;
            }

            if self.last_heartbeat.elapsed() > heartbeat_timeout {
                return Err(ConnectionError::HeartbeatTimeout(heartbeat_timeout));
            }

            tokio::select! {
                changed = latest_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                outbound = registration.next_outbound() => match outbound {
                    Some(snapshot) => send_snapshot(&mut **transport, &snapshot).await?,
                    None => return Ok(()),
                },
                received = timeout(receive_timeout, transport.recv_text()) => match received {
                    Err(_) => continue,
                    Ok(Ok(Some(text))) => {
                        if is_heartbeat(id, &text) {
                            self.last_heartbeat = Instant::now();
                            let ack = serde_json::to_string(&ServerMessage::HeartbeatAck)?;
                            transport.send_text(ack).await?;
                        }
                    }
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Err(e)) => return Err(e),
                },
            }
        }
    }

    async fn close(mut self, reason: ConnectionError) -> ClientSession<Closed> {
        let id = self.connection_id.unwrap_or_default();
        match &reason {
            ConnectionError::Closed => info!("Client {} disconnected", id),
            other => warn!("Closing client {}: {}", id, other),
        }
        self.transport.close().await;
        // Dropping the registration removes the connection from the live set.
        self.registration = None;
        self.close_reason = Some(reason);
        self.transition()
    }
}

impl ClientSession<Closed> {
    pub fn close_reason(&self) -> Option<&ConnectionError> {
        self.close_reason.as_ref()
    }
}

/// Runs one client from accept to cleanup.
pub async fn serve_client(
    transport: Box<dyn ClientTransport>,
    manager: Arc<ConnectionManager>,
    settings: WebSocketConfig,
) -> ClientSession<Closed> {
    ClientSession::accept(transport, manager, settings)
        .open()
        .run()
        .await
}

async fn send_snapshot(
    transport: &mut dyn ClientTransport,
    snapshot: &TelemetrySnapshot,
) -> Result<(), ConnectionError> {
    let text = serde_json::to_string(snapshot)?;
    transport.send_text(text).await
}

/// Any other JSON is ignored; text that is not JSON is logged and ignored.
fn is_heartbeat(id: ConnectionId, text: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            let heartbeat = value.get("type").and_then(|kind| kind.as_str()) == Some("heartbeat");
            if !heartbeat {
                debug!("Ignoring message from client {}: {}", id, text);
            }
            heartbeat
        }
        Err(e) => {
            warn!("Malformed message from client {}: {}", id, e);
            false
        }
    }
}
