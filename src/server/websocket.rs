use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};

use crate::bridge::session::{ClientTransport, ConnectionError};

/// Live channel of a browser client.
pub struct WebSocketTransport {
    socket: WebSocket,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            match self.socket.recv().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                // axum answers pings on its own
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}
