//! Transport abstraction traits for pixelboard.
//!
//! A session never sees transport framing. It reads decoded [`ClientFrame`]s
//! and writes [`ServerFrame`]s through these traits, so the same session code
//! drives a WebSocket or an in-memory test connection.

use async_trait::async_trait;
use pixelboard_protocol::{ClientFrame, CodecError, ServerFrame};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a connection ID unique within this process.
    #[must_use]
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(format!("conn_{:x}", NEXT.fetch_add(1, Ordering::Relaxed)))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer sent something that is not a valid frame.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] CodecError),

    /// Message exceeds the configured size limit.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the peer is at fault, as opposed to the link.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, TransportError::Malformed(_) | TransportError::FrameTooLarge(_))
    }
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSender: Send {
    /// Send a frame.
    async fn send(&mut self, frame: ServerFrame) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An accepted connection to a single client.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned halves, so reading and writing can
    /// proceed concurrently.
    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_malformed_classification() {
        assert!(TransportError::FrameTooLarge(10).is_malformed());
        assert!(TransportError::from(CodecError::MalformedPixel(3)).is_malformed());
        assert!(!TransportError::ConnectionClosed.is_malformed());
    }
}
