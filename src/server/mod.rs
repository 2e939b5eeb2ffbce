//! # HTTP and WebSocket Surface
//!
//! Thin axum layer over the [`Bridge`]. Handlers translate requests into
//! bridge calls and map failures onto status codes; no pipeline logic lives
//! here.
//!
//! | Route                            | Purpose                              |
//! |----------------------------------|--------------------------------------|
//! | `GET /`                          | dashboard `index.html`               |
//! | `GET /assets/*`                  | dashboard assets                     |
//! | `GET /status`                    | broker connection status             |
//! | `GET /subscribe/*topic`          | subscribe the broker client to topic |
//! | `GET /sensor/:id`                | sensor with full reading history     |
//! | `GET /api/recent_readings`       | newest readings per sensor           |
//! | `GET /api/get_sensors`           | registered sensors                   |
//! | `POST /api/motor/control/:cmd`   | manual `start` / `stop`              |
//! | `GET /ws`                        | live snapshot stream                 |

pub mod websocket;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::{eyre, Result};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::bridge::control::{ControlError, MotorCommand};
use crate::bridge::session::serve_client;
use crate::bridge::Bridge;
use crate::persistence::{self, StorageError};
use websocket::WebSocketTransport;

const FRONTEND_MISSING: &str =
    "Frontend not built. Run 'npm run build' in the frontend directory.";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("MQTT service unavailable")]
    MqttUnavailable,

    #[error("Sensor with ID {0} not found")]
    SensorNotFound(i64),

    #[error("No readings found")]
    NoReadings,

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::MqttUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": self.to_string() }),
            ),
            ApiError::SensorNotFound(_) | ApiError::NoReadings => {
                (StatusCode::NOT_FOUND, json!({ "detail": self.to_string() }))
            }
            ApiError::Control(ControlError::InvalidCommand(command)) => {
                warn!("Invalid motor command received: {}", command);
                (
                    StatusCode::BAD_REQUEST,
                    json!({ "detail": "Invalid command. Use 'start' or 'stop'" }),
                )
            }
            ApiError::Control(ControlError::PublishFailed { .. }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "detail": "Failed to send motor control command" }),
            ),
            ApiError::Control(ControlError::Storage(e)) | ApiError::Storage(e) => {
                error!("Storage failure while serving request: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "detail": "Storage unavailable" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    let assets = ServeDir::new(state.bridge.config.server.static_dir.join("assets"));

    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/subscribe/*topic", get(subscribe))
        .route("/sensor/:sensor_id", get(sensor))
        .route("/api/recent_readings", get(recent_readings))
        .route("/api/get_sensors", get(get_sensors))
        .route("/api/motor/control/:command", post(motor_control))
        .route("/ws", get(live))
        .nest_service("/assets", assets)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(bridge: Arc<Bridge>, shutdown: CancellationToken) -> Result<()> {
    let addr = bridge.config.server.bind;
    let app = router(AppState {
        bridge,
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| eyre!("HTTP server failed: {}", e))?;
    info!("HTTP server stopped");
    Ok(())
}

async fn index(State(state): State<AppState>) -> Response {
    let path = state.bridge.config.server.static_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, Html(FRONTEND_MISSING)).into_response()
        }
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.mqtt.broker_status())
}

async fn subscribe(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mqtt = &state.bridge.mqtt;
    if !mqtt.is_connected() {
        return Err(ApiError::MqttUnavailable);
    }
    let body = if mqtt.subscribe(&topic, None) {
        json!({ "status": "success", "message": format!("Subscribed to {topic}") })
    } else {
        json!({ "status": "error", "message": "Failed to subscribe" })
    };
    Ok(Json(body))
}

async fn sensor(
    State(state): State<AppState>,
    Path(sensor_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    persistence::sensor_history(state.bridge.gateway.as_ref(), sensor_id)
        .await?
        .map(Json)
        .ok_or(ApiError::SensorNotFound(sensor_id))
}

async fn recent_readings(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let limit = state.bridge.config.storage.recent_limit;
    let readings = state.bridge.gateway.recent_readings(limit).await?;
    if readings.is_empty() {
        return Err(ApiError::NoReadings);
    }
    Ok(Json(json!({
        "status": "success",
        "message": "Recent readings retrieved successfully",
        "data": readings,
    })))
}

async fn get_sensors(State(state): State<AppState>) -> Result<Response, ApiError> {
    let sensors = state.bridge.gateway.list_sensors().await?;
    if sensors.is_empty() {
        return Ok(Json(json!({ "sensors": [] })).into_response());
    }
    Ok(Json(sensors).into_response())
}

async fn motor_control(
    State(state): State<AppState>,
    Path(command): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    info!("Motor control request received with command: {}", command);
    let command: MotorCommand = command.parse()?;
    state.bridge.controller.manual(command).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Motor {command} command sent successfully"),
    })))
}

async fn live(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let connections = state.bridge.connections.clone();
    let settings = state.bridge.config.websocket.clone();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| async move {
        let transport = Box::new(WebSocketTransport::new(socket));
        tokio::select! {
            _ = serve_client(transport, connections, settings) => {}
            _ = shutdown.cancelled() => {}
        }
    })
}
