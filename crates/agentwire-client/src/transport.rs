//! Transport seam between the driver and the socket.
//!
//! The driver only sees text frames. [`TungsteniteConnector`] is the real
//! implementation; tests substitute in-memory transports.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open, bidirectional text-frame channel.
#[async_trait]
pub trait FrameTransport: Send {
    /// Write one frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound frame, or `Ok(None)` once the peer has closed.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Close politely. Errors are ignored.
    async fn close(&mut self);
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameTransport>, TransportError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameTransport>, TransportError> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url, status = response.status().as_u16(), "websocket connected");
        Ok(Box::new(TungsteniteTransport { ws }))
    }
}

struct TungsteniteTransport {
    ws: WsStream,
}

#[async_trait]
impl FrameTransport for TungsteniteTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => debug!(len = data.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        debug!(code = u16::from(frame.code), reason = %frame.reason, "server closed connection");
                    }
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
