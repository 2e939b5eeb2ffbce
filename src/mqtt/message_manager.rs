use chrono::{DateTime, Local};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Invoked on the runtime side for every message on the topic it was
/// registered for.
pub type TopicCallback = Arc<dyn Fn(&MqttMessage) + Send + Sync>;

/// Work item handed from the network thread to the runtime.
#[derive(Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
    /// Callback registered for `topic` when the message arrived.
    pub callback: Option<TopicCallback>,
}

impl fmt::Debug for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MqttMessage")
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("received_at", &self.received_at)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(40).collect();
        write!(f, "{} - {}: {}", self.received_at.format("%H:%M:%S%.3f"), self.topic, preview)
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: Option<TopicCallback>) -> Self {
        self.callback = callback;
        self
    }
}

/// Sending half registered on the adapter; the receiver is drained by the
/// ingestion worker.
pub type Dispatcher = mpsc::UnboundedSender<MqttMessage>;

pub fn dispatch_channel() -> (Dispatcher, mpsc::UnboundedReceiver<MqttMessage>) {
    mpsc::unbounded_channel()
}
