//! Byte-stream transports for the control link
//!
//! The control link runs over a WebSocket carrying binary messages. Both
//! sides see it through the [`Transport`] trait so the session layer never
//! cares how the socket was established (direct, TLS, or through an
//! upstream proxy).

pub mod proxy;
pub mod websocket;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use websocket::{dial, DialOptions, WsListener, WsListenerConfig};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("timed out")]
    Timeout,
}

/// A bidirectional message-framed byte transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one binary message.
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Receive the next binary message; `None` on clean close.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the transport.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Split into independently-owned write and read halves so the session
    /// can run its writer and reader as separate tasks.
    fn split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>);
}

/// Write half of a split transport.
#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a split transport.
#[async_trait]
pub trait TransportReader: Send {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}
