//! WebSocket connections on top of axum.
//!
//! The HTTP server performs the upgrade; this module wraps the resulting
//! socket. Binary messages carry pixel records, text messages carry JSON
//! control frames.

use crate::traits::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pixelboard_protocol::{ClientFrame, ServerFrame, WireMessage};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// WebSocket configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// An upgraded WebSocket.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketConnection {
    #[must_use]
    pub fn new(
        socket: WebSocket,
        remote_addr: Option<SocketAddr>,
        config: &WebSocketConfig,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
            max_message_size: config.max_message_size,
        }
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSender {
                id: self.id.clone(),
                sink,
                closed: false,
            }),
            Box::new(WebSocketReceiver {
                id: self.id,
                stream,
                max_message_size: self.max_message_size,
            }),
        )
    }
}

/// What an inbound WebSocket message means to a session.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Frame(ClientFrame),
    /// Control traffic the socket handles itself.
    Skip,
    Close,
}

fn interpret(message: Message, max_message_size: usize) -> Result<Inbound, TransportError> {
    let wire = match message {
        Message::Binary(data) => WireMessage::Binary(Bytes::from(data)),
        Message::Text(text) => WireMessage::Text(text),
        Message::Ping(_) | Message::Pong(_) => return Ok(Inbound::Skip),
        Message::Close(_) => return Ok(Inbound::Close),
    };

    let len = match &wire {
        WireMessage::Binary(data) => data.len(),
        WireMessage::Text(text) => text.len(),
    };
    if len > max_message_size {
        warn!(len, max = max_message_size, "Message too large");
        return Err(TransportError::FrameTooLarge(len));
    }

    Ok(Inbound::Frame(ClientFrame::decode(&wire)?))
}

fn to_message(frame: ServerFrame) -> Message {
    match frame.encode() {
        WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        WireMessage::Text(text) => Message::Text(text),
    }
}

struct WebSocketReceiver {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

#[async_trait]
impl FrameReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(message)) => match interpret(message, self.max_message_size)? {
                    Inbound::Frame(frame) => {
                        trace!(connection = %self.id, "Received frame");
                        return Ok(Some(frame));
                    }
                    Inbound::Skip => {}
                    Inbound::Close => {
                        debug!(connection = %self.id, "Received close frame");
                        return Ok(None);
                    }
                },
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

struct WebSocketSender {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSender for WebSocketSender {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        self.sink
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(()); // Already closed
        }
        self.closed = true;

        debug!(connection = %self.id, "Closing WebSocket");
        // The peer may already be gone, in which case the close frame cannot
        // be delivered; closing the sink still releases the socket.
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
