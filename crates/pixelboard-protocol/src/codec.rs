//! Codec for the fixed-layout binary records exchanged with clients and stored
//! in the backend.
//!
//! All multi-byte integers are big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of an encoded pixel record: `x` (u16), `y` (u16), `color` (u8).
pub const PIXEL_RECORD_SIZE: usize = 5;

/// Size of the image header: width (u16) followed by height (u16).
pub const IMAGE_HEADER_SIZE: usize = 4;

/// Errors that can occur while decoding records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Pixel record has the wrong length.
    #[error("Malformed pixel record: expected {PIXEL_RECORD_SIZE} bytes, got {0}")]
    MalformedPixel(usize),

    /// Image buffer too short to hold a header.
    #[error("Malformed image header: expected at least {IMAGE_HEADER_SIZE} bytes, got {0}")]
    MalformedHeader(usize),

    /// Palette buffer length is not a whole number of entries.
    #[error("Malformed palette: {0} bytes is not a multiple of 3")]
    MalformedPalette(usize),

    /// Text frame could not be understood.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

/// A single cell's desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pixel {
    pub x: u16,
    pub y: u16,
    /// Palette index.
    pub color: u8,
}

impl Pixel {
    #[must_use]
    pub const fn new(x: u16, y: u16, color: u8) -> Self {
        Self { x, y, color }
    }

    /// Encode into a shareable buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PIXEL_RECORD_SIZE);
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u8(self.color);
        buf.freeze()
    }

    /// Decode from the first 5 bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedPixel`] if fewer than 5 bytes are given.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        match data {
            [x0, x1, y0, y1, color, ..] => Ok(Self {
                x: u16::from_be_bytes([*x0, *x1]),
                y: u16::from_be_bytes([*y0, *y1]),
                color: *color,
            }),
            _ => Err(CodecError::MalformedPixel(data.len())),
        }
    }

    /// Decode a record that must be exactly 5 bytes long.
    ///
    /// Inbound client frames go through this so that truncated or padded
    /// frames are rejected instead of silently reinterpreted.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedPixel`] on any other length.
    pub fn decode_exact(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != PIXEL_RECORD_SIZE {
            return Err(CodecError::MalformedPixel(data.len()));
        }
        Self::decode(data)
    }
}

/// Dimensions stored at the front of every image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHeader {
    pub width: u16,
    pub height: u16,
}

impl ImageHeader {
    #[must_use]
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Number of pixels in the body.
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }

    /// Total image length including the header.
    #[must_use]
    pub fn image_len(&self) -> usize {
        IMAGE_HEADER_SIZE + self.pixel_count()
    }

    /// Whether `(x, y)` lies on the canvas.
    #[must_use]
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x < self.width && y < self.height
    }

    /// Row-major body offset of `(x, y)`, without the header.
    #[must_use]
    pub fn offset(&self, x: u16, y: u16) -> u64 {
        u64::from(y) * u64::from(self.width) + u64::from(x)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let [w0, w1] = self.width.to_be_bytes();
        let [h0, h1] = self.height.to_be_bytes();
        [w0, w1, h0, h1]
    }

    /// Decode the header from the front of an image buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedHeader`] if fewer than 4 bytes are given.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        match data {
            [w0, w1, h0, h1, ..] => Ok(Self {
                width: u16::from_be_bytes([*w0, *w1]),
                height: u16::from_be_bytes([*h0, *h1]),
            }),
            _ => Err(CodecError::MalformedHeader(data.len())),
        }
    }

    /// Build a blank image: this header followed by a zeroed body.
    #[must_use]
    pub fn blank_image(&self) -> Bytes {
        let mut buf = BytesMut::zeroed(self.image_len());
        buf[..IMAGE_HEADER_SIZE].copy_from_slice(&self.to_bytes());
        buf.freeze()
    }
}
