//! # pixelboard-protocol
//!
//! Binary formats for the pixelboard canvas engine.
//!
//! Everything here is a pure transform with no I/O:
//!
//! - **Pixel record** - `x`, `y` (big-endian u16) and a palette index, 5 bytes
//! - **Image header** - width and height prefixed to the pixel body
//! - **Palette** - packed 24-bit RGB entries
//! - **Bit fields** - MSB-first field access compatible with Redis `BITFIELD`
//! - **Frames** - what clients and the server exchange during a live session
//!
//! ## Example
//!
//! ```rust
//! use pixelboard_protocol::Pixel;
//!
//! let pixel = Pixel::new(12, 34, 5);
//! let encoded = pixel.encode();
//! assert_eq!(encoded.len(), 5);
//! assert_eq!(Pixel::decode(&encoded).unwrap(), pixel);
//! ```

pub mod bits;
pub mod codec;
pub mod frames;
pub mod palette;

pub use codec::{CodecError, ImageHeader, Pixel, IMAGE_HEADER_SIZE, PIXEL_RECORD_SIZE};
pub use frames::{ClientFrame, Notice, ServerFrame, WireMessage};
pub use palette::{decode_palette, encode_palette, Rgb, DEFAULT_PALETTE};
