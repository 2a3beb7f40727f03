//! # pixelboard-transport
//!
//! Connection abstraction for pixelboard sessions.
//!
//! - **WebSocket** - Upgraded axum sockets, used by the server
//! - **Channel** - In-memory pairs, used by tests
//!
//! ## Connection Abstraction
//!
//! Every connection implements [`Connection`] and splits into a
//! [`FrameSender`] and a [`FrameReceiver`], so a session can read edits and
//! push updates concurrently without knowing the framing.
//!
//! ```rust,ignore
//! use pixelboard_transport::Connection;
//!
//! async fn handle_connection(conn: Box<dyn Connection>) {
//!     let (mut sender, mut receiver) = conn.split();
//!     while let Ok(Some(frame)) = receiver.recv().await {
//!         // Process frame
//!     }
//!     let _ = sender.close().await;
//! }
//! ```

pub mod channel;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{ChannelConnection, ChannelPeer};
pub use traits::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
