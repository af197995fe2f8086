//! Connection: the single socket the gateway talks through.
//!
//! `Connection` is the byte-level contract (send, receive with timeout, close) and
//! `Connector` opens new connections, so the reader loop can reconnect without knowing
//! the transport. `WsConnector` is the production WebSocket implementation.

use crate::gateway::error::GatewayError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One frame on the wire. Ping/Pong are the transport-level liveness check and its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// A single open channel to the server. No retries happen here.
///
/// `receive` must be cancel-safe: the reader loop races it against outbound frames
/// and drops the future when a send wins.
#[async_trait]
pub trait Connection: Send {
    /// Write one frame. Fails with `GatewayError::Send` once the connection is closed.
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError>;

    /// Wait for the next inbound frame. Fails with `GatewayError::Closed` when the peer goes away.
    async fn receive(&mut self) -> Result<Frame, GatewayError>;

    /// Close the channel; later sends fail.
    async fn close(&mut self) -> Result<(), GatewayError>;

    /// `receive` bounded by `timeout`; fails with `GatewayError::Timeout` when nothing arrives.
    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Frame, GatewayError> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::Timeout),
        }
    }
}

/// Opens connections to one fixed endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fails with `GatewayError::Connect` when the endpoint is unreachable or the handshake fails.
    async fn connect(&self) -> Result<Box<dyn Connection>, GatewayError>;
}

/// Connector for `ws://host:port`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, GatewayError> {
        log::debug!("connecting to {}", self.url);
        let (ws, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| GatewayError::Connect(format!("{}: {}", self.url, e)))?;
        log::info!("connected to {}", self.url);
        Ok(Box::new(WsConnection { ws, closed: false }))
    }
}

/// Text carried in a binary message. Payloads that are not UTF-8 are dropped.
fn binary_text(bytes: Vec<u8>) -> Option<String> {
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(e) => {
            log::warn!("dropping binary frame of {} bytes: {}", e.as_bytes().len(), e.utf8_error());
            None
        }
    }
}

/// WebSocket-backed connection. Pings from the server are answered by tungstenite itself.
pub struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        if self.closed {
            return Err(GatewayError::Send("connection is closed".to_string()));
        }
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
        };
        self.ws
            .send(msg)
            .await
            .map_err(|e| GatewayError::Send(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Frame, GatewayError> {
        loop {
            let Some(msg) = self.ws.next().await else {
                self.closed = true;
                return Err(GatewayError::Closed("stream ended".to_string()));
            };
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    self.closed = true;
                    return Err(GatewayError::Closed(e.to_string()));
                }
            };
            return match msg {
                Message::Text(text) => Ok(Frame::Text(text)),
                Message::Binary(bytes) => match binary_text(bytes) {
                    Some(text) => Ok(Frame::Text(text)),
                    None => continue,
                },
                Message::Ping(payload) => Ok(Frame::Ping(payload)),
                Message::Pong(payload) => Ok(Frame::Pong(payload)),
                Message::Close(reason) => {
                    self.closed = true;
                    let reason = reason
                        .map(|c| format!("{} {}", c.code, c.reason))
                        .unwrap_or_else(|| "close frame".to_string());
                    Err(GatewayError::Closed(reason))
                }
                Message::Frame(_) => continue,
            };
        }
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.ws
            .close(None)
            .await
            .map_err(|e| GatewayError::Closed(e.to_string()))
    }
}
