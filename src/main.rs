use color_eyre::{eyre::eyre, Result};
use sensorbridge::bridge::Bridge;
use sensorbridge::config::{BridgeConfig, ConfigSource};
use sensorbridge::mqtt::mqtt_handler::MqttHandler;
use sensorbridge::{persistence, server};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let (config, source) = BridgeConfig::load_or_init().await?;
    setup_logging(config.logging.max_level());
    match &source {
        ConfigSource::Loaded(_) => info!("Configuration {}", source),
        ConfigSource::Created(_) => warn!("Configuration: {}", source),
    }
    info!(
        "Starting sensorbridge, broker {}:{}",
        config.mqtt.broker, config.mqtt.port
    );

    let gateway = persistence::connect(&config.storage, config.control.actuator_sensor_id)
        .await
        .map_err(|e| eyre!("Failed to initialise storage: {}", e))?;
    let mqtt = Arc::new(MqttHandler::new(config.mqtt.clone()));
    let bridge = Arc::new(Bridge::new(config, gateway, mqtt));

    let shutdown = CancellationToken::new();
    let worker = bridge
        .start(shutdown.clone())
        .map_err(|e| eyre!("Failed to start MQTT client: {}", e))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    let served = server::serve(bridge.clone(), shutdown.clone()).await;

    shutdown.cancel();
    worker.join().await;
    bridge.stop();
    info!("sensorbridge stopped");
    served
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
