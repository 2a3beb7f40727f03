//! In-memory connections.
//!
//! [`ChannelConnection::pair`] returns a server-side [`Connection`] and the
//! [`ChannelPeer`] playing the client. Messages pass through the same wire
//! encoding a WebSocket would use, so sessions can be exercised end to end
//! without a network.

use crate::traits::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};
use async_trait::async_trait;
use pixelboard_protocol::{ClientFrame, CodecError, ServerFrame, WireMessage};
use tokio::sync::mpsc;

/// Messages buffered in each direction.
const CHANNEL_CAPACITY: usize = 256;

/// Server side of an in-memory connection.
pub struct ChannelConnection {
    id: ConnectionId,
    inbound: mpsc::Receiver<WireMessage>,
    outbound: mpsc::Sender<WireMessage>,
}

impl ChannelConnection {
    /// Create a connected pair.
    #[must_use]
    pub fn pair() -> (ChannelConnection, ChannelPeer) {
        let (client_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, client_rx) = mpsc::channel(CHANNEL_CAPACITY);

        (
            ChannelConnection {
                id: ConnectionId::generate(),
                inbound,
                outbound,
            },
            ChannelPeer {
                tx: Some(client_tx),
                rx: client_rx,
            },
        )
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        (
            Box::new(ChannelSender {
                tx: Some(self.outbound),
            }),
            Box::new(ChannelReceiver { rx: self.inbound }),
        )
    }
}

struct ChannelReceiver {
    rx: mpsc::Receiver<WireMessage>,
}

#[async_trait]
impl FrameReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError> {
        match self.rx.recv().await {
            Some(message) => Ok(Some(ClientFrame::decode(&message)?)),
            None => Ok(None),
        }
    }
}

struct ChannelSender {
    /// `None` once closed.
    tx: Option<mpsc::Sender<WireMessage>>,
}

#[async_trait]
impl FrameSender for ChannelSender {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.encode())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Client side of an in-memory connection.
pub struct ChannelPeer {
    tx: Option<mpsc::Sender<WireMessage>>,
    rx: mpsc::Receiver<WireMessage>,
}

impl ChannelPeer {
    /// Send a raw message, valid or not.
    ///
    /// # Errors
    ///
    /// Returns an error if either side has closed.
    pub async fn send_raw(&self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if either side has closed.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.send_raw(frame.encode()).await
    }

    /// Next frame from the server, or `None` once the server has closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the server sent something undecodable.
    pub async fn recv(&mut self) -> Result<Option<ServerFrame>, CodecError> {
        match self.rx.recv().await {
            Some(message) => ServerFrame::decode(&message).map(Some),
            None => Ok(None),
        }
    }

    /// Stop sending. The server sees a clean end of stream.
    pub fn close(&mut self) {
        self.tx = None;
    }
}
