use chrono::{DateTime, Local};
use parking_lot::Mutex;
use rumqttc::{Client, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::{Dispatcher, MqttMessage, TopicCallback};

const REQUEST_CAPACITY: usize = 100;
const MAX_ERROR_MESSAGES: usize = 10;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Read-only projection served on the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct BrokerStatus {
    pub status: LinkStatus,
    pub broker: String,
    pub port: u16,
    pub topics: Vec<String>,
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected to MQTT broker")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Failed to spawn network thread: {0}")]
    Thread(String),
}

/// Outbound side used by the controller; lets tests swap the broker out.
pub trait CommandPublisher: Send + Sync {
    /// `false` when the message could not be handed to the broker.
    fn publish(&self, topic: &str, payload: &str) -> bool;
}

struct Subscription {
    topic: String,
    callback: Option<TopicCallback>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    _handle: thread::JoinHandle<()>,
}

/// Client of one network loop run, tagged with that run's stop flag.
struct ClientSlot {
    run: Arc<AtomicBool>,
    client: Client,
}

/// State shared between the handler and its network thread.
struct Shared {
    config: MqttConfig,
    status: Mutex<MqttStatus>,
    connected: AtomicBool,
    client: Mutex<Option<ClientSlot>>,
    subscriptions: Mutex<Vec<Subscription>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Shared {
    /// Stores the client of run `run` unless that run was already stopped.
    /// Checked under the slot lock, so a stale thread never replaces the
    /// client of a newer run.
    fn install_client(&self, run: &Arc<AtomicBool>, client: Client) -> bool {
        let mut slot = self.client.lock();
        if run.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(ClientSlot {
            run: run.clone(),
            client,
        });
        true
    }

    /// Clears the slot only if it still holds the client of `run`.
    fn release_client(&self, run: &Arc<AtomicBool>) -> Option<Client> {
        let mut slot = self.client.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(&current.run, run)) {
            return slot.take().map(|current| current.client);
        }
        None
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.lock().connection_state = state;
    }

    fn record_error(&self, message: String) {
        let mut status = self.status.lock();
        status.error_messages.push(message);
        let overflow = status.error_messages.len().saturating_sub(MAX_ERROR_MESSAGES);
        status.error_messages.drain(..overflow);
    }

    fn on_connack(&self, client: &Client, code: ConnectReturnCode) {
        if code != ConnectReturnCode::Success {
            error!("Failed to connect to MQTT broker with code: {:?}", code);
            self.connected.store(false, Ordering::SeqCst);
            self.set_state(ConnectionState::Failed);
            self.record_error(format!("connection refused: {code:?}"));
            return;
        }

        info!(
            "Connected to MQTT Broker at {}:{}",
            self.config.broker, self.config.port
        );
        self.connected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        // The broker may have dropped our session; subscribe again in order.
        for subscription in self.subscriptions.lock().iter() {
            match client.try_subscribe(subscription.topic.clone(), QoS::AtMostOnce) {
                Ok(()) => info!("Subscribed to topic: {}", subscription.topic),
                Err(e) => warn!("Re-subscribe to {} failed: {}", subscription.topic, e),
            }
        }
    }

    fn on_connection_lost(&self, reason: String) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Disconnected from MQTT broker: {}", reason);
        } else {
            debug!("MQTT connection attempt failed: {}", reason);
        }
        self.set_state(ConnectionState::Reconnecting);
        self.record_error(reason);
    }

    /// Wraps an inbound publish and hands it to the runtime. Never calls
    /// application code on this thread.
    fn on_publish(&self, topic: &str, payload: &[u8]) {
        let payload = String::from_utf8_lossy(payload).into_owned();
        debug!("Received message on {}: {}", topic, payload);
        {
            let mut status = self.status.lock();
            status.messages_received += 1;
            status.last_activity = Some(Local::now());
        }

        let callback = self
            .subscriptions
            .lock()
            .iter()
            .find(|subscription| subscription.topic == topic)
            .and_then(|subscription| subscription.callback.clone());
        let message = MqttMessage::from_topic(topic, payload).with_callback(callback);

        let dispatcher = self.dispatcher.lock().clone();
        match dispatcher {
            Some(dispatcher) => {
                if dispatcher.send(message).is_err() {
                    warn!("Ingestion worker has shut down, dropping message on {}", topic);
                }
            }
            None => warn!("No dispatcher registered yet, dropping message on {}", topic),
        }
    }
}

/// Broker client whose network loop runs on its own thread.
pub struct MqttHandler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl MqttHandler {
    pub fn new(config: MqttConfig) -> Self {
        MqttHandler {
            shared: Arc::new(Shared {
                config,
                status: Mutex::new(MqttStatus::default()),
                connected: AtomicBool::new(false),
                client: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
                dispatcher: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.shared.config
    }

    /// Registers where inbound messages are delivered. Messages arriving
    /// before this call are logged and dropped.
    pub fn set_dispatcher(&self, dispatcher: Dispatcher) {
        *self.shared.dispatcher.lock() = Some(dispatcher);
        info!("Dispatcher registered for MQTT handler");
    }

    /// Starts connecting on a dedicated thread. A no-op while already started.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("MQTT client already started");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let thread_stop = stop.clone();
        shared.set_state(ConnectionState::Connecting);
        let handle = thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || run_network_loop(shared, thread_stop))
            .map_err(|e| TransportError::Thread(e.to_string()))?;

        *worker = Some(Worker {
            stop,
            _handle: handle,
        });
        Ok(())
    }

    /// Halts the network loop and disconnects. A no-op when not started.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        info!("Stopping MQTT client...");
        worker.stop.store(true, Ordering::SeqCst);
        if let Some(client) = self.shared.release_client(&worker.stop) {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not delivered: {}", e);
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    pub fn is_started(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.is_started() && self.shared.connected.load(Ordering::SeqCst)
    }

    /// Records the subscription and sends it right away when connected.
    /// Returns whether it was sent now; recorded topics are (re)subscribed
    /// on every connect in registration order.
    pub fn subscribe(&self, topic: &str, callback: Option<TopicCallback>) -> bool {
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            match subscriptions.iter_mut().find(|s| s.topic == topic) {
                Some(existing) => existing.callback = callback,
                None => subscriptions.push(Subscription {
                    topic: topic.to_string(),
                    callback,
                }),
            }
        }

        if !self.is_connected() {
            debug!("Not connected, {} will be subscribed on connect", topic);
            return false;
        }

        let slot = self.shared.client.lock();
        let Some(client) = slot.as_ref().map(|slot| &slot.client) else {
            return false;
        };
        match client.try_subscribe(topic, QoS::AtMostOnce) {
            Ok(()) => {
                info!("Subscribed to topic: {}", topic);
                true
            }
            Err(e) => {
                warn!("Subscribe to {} failed: {}", topic, e);
                false
            }
        }
    }

    /// Hands a message to the broker without queueing or retrying.
    pub fn try_publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        {
            let slot = self.shared.client.lock();
            let client = slot
                .as_ref()
                .map(|slot| &slot.client)
                .ok_or(TransportError::NotConnected)?;
            client.try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())?;
        }

        let mut status = self.shared.status.lock();
        status.messages_sent += 1;
        status.last_activity = Some(Local::now());
        Ok(())
    }

    pub fn publish(&self, topic: &str, payload: &str) -> bool {
        match self.try_publish(topic, payload) {
            Ok(()) => {
                info!("Published message to {}: {}", topic, payload);
                true
            }
            Err(e) => {
                warn!("Cannot publish to {}: {}", topic, e);
                false
            }
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .lock()
            .iter()
            .map(|subscription| subscription.topic.clone())
            .collect()
    }

    pub fn status(&self) -> MqttStatus {
        self.shared.status.lock().clone()
    }

    pub fn broker_status(&self) -> BrokerStatus {
        let status = self.status();
        BrokerStatus {
            status: if self.is_connected() {
                LinkStatus::Connected
            } else {
                LinkStatus::Disconnected
            },
            broker: self.shared.config.broker.clone(),
            port: self.shared.config.port,
            topics: self.topics(),
            connection_state: status.connection_state,
            messages_received: status.messages_received,
            messages_sent: status.messages_sent,
            last_activity: status.last_activity,
        }
    }
}

impl CommandPublisher for MqttHandler {
    fn publish(&self, topic: &str, payload: &str) -> bool {
        MqttHandler::publish(self, topic, payload)
    }
}

impl Drop for MqttHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_network_loop(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    let config = shared.config.clone();
    let mut options = MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
    options.set_keep_alive(config.keep_alive());
    if let (Some(user), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), password.clone());
    }

    info!(
        "Connecting to MQTT broker at {}:{}...",
        config.broker, config.port
    );
    let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
    if !shared.install_client(&stop, client.clone()) {
        info!("MQTT client stopped before connecting");
        return;
    }

    for notification in connection.iter() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => shared.on_connack(&client, ack.code),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.on_publish(&publish.topic, &publish.payload)
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.on_connection_lost("broker sent disconnect".to_string())
            }
            Ok(_) => {}
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                shared.on_connection_lost(e.to_string());
                thread::sleep(config.reconnect_delay());
            }
        }
    }
    shared.release_client(&stop);
    info!("MQTT network loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::dispatch_channel;
    use std::sync::atomic::AtomicUsize;

    fn offline_config() -> MqttConfig {
        MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 1,
            reconnect_delay_ms: 50,
            ..MqttConfig::default()
        }
    }

    #[test]
    fn publish_fails_when_not_connected() {
        let handler = MqttHandler::new(offline_config());
        assert!(!handler.is_connected());
        assert!(!handler.publish("motor/control", "start"));
        assert!(matches!(
            handler.try_publish("motor/control", "start"),
            Err(TransportError::NotConnected)
        ));
        assert_eq!(handler.status().messages_sent, 0);
    }

    #[test]
    fn offline_subscriptions_are_recorded_in_order() {
        let handler = MqttHandler::new(offline_config());
        assert!(!handler.subscribe("sensor/data", None));
        assert!(!handler.subscribe("sensors/data", None));
        assert!(!handler.subscribe("sensor/data", Some(Arc::new(|_: &MqttMessage| {}))));

        assert_eq!(handler.topics(), vec!["sensor/data", "sensors/data"]);
        let status = handler.broker_status();
        assert_eq!(status.status, LinkStatus::Disconnected);
        assert_eq!(status.port, 1);
    }

    #[test]
    fn message_without_dispatcher_is_dropped() {
        let handler = MqttHandler::new(offline_config());
        handler.shared.on_publish("sensors/data", b"Temperature Sensor 1: 41.2");
        assert_eq!(handler.status().messages_received, 1);
    }

    #[test]
    fn message_is_handed_off_with_its_callback() {
        let handler = MqttHandler::new(offline_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        handler.subscribe(
            "lab/door",
            Some(Arc::new(move |_: &MqttMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let (tx, mut rx) = dispatch_channel();
        handler.set_dispatcher(tx);

        handler.shared.on_publish("lab/door", b"open");
        handler.shared.on_publish("sensors/data", b"A: 1");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.topic, "lab/door");
        assert_eq!(first.payload, "open");
        let callback = first.callback.clone().expect("callback attached");
        callback(&first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = rx.try_recv().unwrap();
        assert!(second.callback.is_none());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let handler = MqttHandler::new(offline_config());
        handler.stop();
        assert!(!handler.is_started());

        handler.start().unwrap();
        handler.start().unwrap();
        assert!(handler.is_started());
        assert!(!handler.is_connected());

        handler.stop();
        handler.stop();
        assert!(!handler.is_started());
        assert_eq!(handler.status().connection_state, ConnectionState::Disconnected);
    }

    fn test_client() -> Client {
        let (client, _connection) =
            Client::new(MqttOptions::new("sensorbridge-test", "127.0.0.1", 1), 10);
        client
    }

    #[test]
    fn stopped_run_cannot_take_the_client_slot() {
        let handler = MqttHandler::new(offline_config());
        let stale = Arc::new(AtomicBool::new(true));
        let current = Arc::new(AtomicBool::new(false));

        assert!(handler.shared.install_client(&current, test_client()));
        // A thread of an earlier, stopped run reaches its install late.
        assert!(!handler.shared.install_client(&stale, test_client()));
        assert!(handler
            .shared
            .client
            .lock()
            .as_ref()
            .is_some_and(|slot| Arc::ptr_eq(&slot.run, &current)));

        // Its exit must not clear the newer client either.
        assert!(handler.shared.release_client(&stale).is_none());
        assert!(handler.shared.client.lock().is_some());
        assert!(handler.shared.release_client(&current).is_some());
        assert!(handler.shared.client.lock().is_none());
    }
}
