//! Push socket implementations

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::client::PushError;

/// An open, bidirectional stream of text frames
#[async_trait]
pub trait FrameStream: Send {
    async fn send(&mut self, text: String) -> Result<(), PushError>;
    /// Next text payload, or `None` once the peer has closed
    async fn receive(&mut self) -> Result<Option<String>, PushError>;
    async fn close(&mut self) -> Result<(), PushError>;
}

/// Opens push connections. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, PushError>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, PushError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| PushError::Connect(e.to_string()))?;
        Ok(Box::new(WsStream { socket }))
    }
}

struct WsStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn send(&mut self, text: String) -> Result<(), PushError> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| PushError::Protocol(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Option<String>, PushError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Binary and protocol-level ping/pong carry no events
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(PushError::Protocol(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), PushError> {
        self.socket
            .close(None)
            .await
            .map_err(|e| PushError::Protocol(e.to_string()))
    }
}
