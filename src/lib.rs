pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod server;
pub mod telemetry;
