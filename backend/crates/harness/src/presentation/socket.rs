//! WebSocket Transport
//!
//! Adapts an axum WebSocket to the session [`Transport`]: one JSON text
//! frame per protocol message.

use crate::application::protocol::{ClientMessage, ServerMessage};
use crate::application::session::Transport;
use crate::error::{HarnessError, HarnessResult};
use axum::extract::ws::{Message, WebSocket};

pub struct WebSocketTransport {
    socket: WebSocket,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> Option<HarnessResult<ClientMessage>> {
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(HarnessError::Transport(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(ClientMessage::parse(text.as_str())),
                Message::Binary(_) => {
                    return Some(Err(HarnessError::MalformedMessage(
                        "binary frames are not supported".to_string(),
                    )));
                }
                Message::Close(_) => return None,
                // answered by the socket itself
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    async fn send(&mut self, message: ServerMessage) -> HarnessResult<()> {
        let text = message.to_json()?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| HarnessError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.send(Message::Close(None)).await {
            tracing::debug!(error = %e, "Close frame not delivered");
        }
    }
}
