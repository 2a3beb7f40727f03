//! Frame types for live canvas sessions.
//!
//! Pixel traffic travels as bare 5-byte binary messages in both directions.
//! Everything else (the in-band credential and server notices) is a small JSON
//! text message tagged by `type`.

use crate::codec::{CodecError, Pixel};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A transport-level message before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
}

/// Control messages a client may send as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientControl {
    /// Credential supplied after the connection is open.
    Token { token: String },
}

/// Notices pushed to a client as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// The last edit was rejected because the cooldown has not expired.
    Cooldown,
    /// The credential does not grant access to this canvas.
    Unauthorized,
    /// The identity provider is throttling; retry later.
    RateLimited,
}

/// A decoded frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// In-band credential.
    Token(String),
    /// Pixel edit request.
    Edit(Pixel),
}

impl ClientFrame {
    /// Create a new Token frame.
    #[must_use]
    pub fn token(token: impl Into<String>) -> Self {
        ClientFrame::Token(token.into())
    }

    /// Decode a binary message, which must be a single pixel record.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is not exactly one pixel record.
    pub fn from_binary(data: &[u8]) -> Result<Self, CodecError> {
        Pixel::decode_exact(data).map(ClientFrame::Edit)
    }

    /// Decode a text control message.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a known control message.
    pub fn from_text(text: &str) -> Result<Self, CodecError> {
        let control: ClientControl =
            serde_json::from_str(text).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
        match control {
            ClientControl::Token { token } => Ok(ClientFrame::Token(token)),
        }
    }

    /// Decode whichever kind of message arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be decoded.
    pub fn decode(message: &WireMessage) -> Result<Self, CodecError> {
        match message {
            WireMessage::Binary(data) => Self::from_binary(data),
            WireMessage::Text(text) => Self::from_text(text),
        }
    }

    /// Encode for sending, as a client would.
    #[must_use]
    pub fn encode(&self) -> WireMessage {
        match self {
            ClientFrame::Edit(pixel) => WireMessage::Binary(pixel.encode()),
            ClientFrame::Token(token) => WireMessage::Text(
                serde_json::to_string(&ClientControl::Token {
                    token: token.clone(),
                })
                .unwrap_or_default(),
            ),
        }
    }
}

/// A frame sent from the server to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFrame {
    /// A pixel update published on the canvas.
    Pixel(Pixel),
    /// A notice about the session.
    Notice(Notice),
}

impl ServerFrame {
    /// Encode for sending.
    #[must_use]
    pub fn encode(&self) -> WireMessage {
        match self {
            ServerFrame::Pixel(pixel) => WireMessage::Binary(pixel.encode()),
            ServerFrame::Notice(notice) => {
                WireMessage::Text(serde_json::to_string(notice).unwrap_or_default())
            }
        }
    }

    /// Decode a message, as a client would.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is neither a pixel record nor a notice.
    pub fn decode(message: &WireMessage) -> Result<Self, CodecError> {
        match message {
            WireMessage::Binary(data) => Pixel::decode_exact(data).map(ServerFrame::Pixel),
            WireMessage::Text(text) => serde_json::from_str(text)
                .map(ServerFrame::Notice)
                .map_err(|e| CodecError::MalformedFrame(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_edit_frame() {
        let frame = ClientFrame::from_binary(&[0, 7, 0, 9, 3]).unwrap();
        assert_eq!(frame, ClientFrame::Edit(Pixel::new(7, 9, 3)));
    }

    #[test]
    fn test_binary_edit_wrong_length() {
        assert!(matches!(
            ClientFrame::from_binary(&[0, 7, 0]),
            Err(CodecError::MalformedPixel(3))
        ));
    }

    #[test]
    fn test_token_frame() {
        let frame = ClientFrame::from_text(r#"{"type":"token","token":"abc"}"#).unwrap();
        assert_eq!(frame, ClientFrame::token("abc"));
        assert_eq!(ClientFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_unknown_text_frame() {
        assert!(matches!(
            ClientFrame::from_text(r#"{"type":"subscribe"}"#),
            Err(CodecError::MalformedFrame(_))
        ));
        assert!(ClientFrame::from_text("not json").is_err());
    }

    #[test]
    fn test_notice_encoding() {
        let frame = ServerFrame::Notice(Notice::Cooldown);
        assert_eq!(
            frame.encode(),
            WireMessage::Text(r#"{"type":"cooldown"}"#.to_string())
        );
        assert_eq!(
            ServerFrame::Notice(Notice::RateLimited).encode(),
            WireMessage::Text(r#"{"type":"rate_limited"}"#.to_string())
        );
        assert_eq!(ServerFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_pixel_server_frame() {
        let frame = ServerFrame::Pixel(Pixel::new(1, 2, 3));
        assert_eq!(
            frame.encode(),
            WireMessage::Binary(Bytes::from_static(&[0, 1, 0, 2, 3]))
        );
    }
}
