//! # MQTT Integration Module
//!
//! Owns the broker connection. The rumqttc network loop runs on a dedicated
//! OS thread, separate from the tokio runtime that drives everything else.
//! Received messages never touch application state from that thread: they
//! are wrapped in an [`message_manager::MqttMessage`] and pushed into a
//! channel that the runtime drains.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker address, topics, timings
//! ├── message_manager.rs  - work item crossing the thread boundary
//! └── mqtt_handler.rs     - lifecycle, subscriptions, publish, status
//! ```
//!
//! ```text
//!  broker ──► [network thread] ──mpsc──► [tokio] ingestion worker
//!                    ▲
//!  publish / subscribe (any thread, non-blocking)
//! ```

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
