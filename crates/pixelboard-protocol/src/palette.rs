//! Palette encoding.
//!
//! A palette is a flat sequence of 24-bit big-endian RGB entries. Entry `i`
//! lives at bit offset `i * PALETTE_ENTRY_BITS`.

use crate::bits::{read_bits, write_bits};
use crate::codec::CodecError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bits per palette entry.
pub const PALETTE_ENTRY_BITS: u8 = 24;

/// Bytes per palette entry.
pub const PALETTE_ENTRY_SIZE: usize = 3;

/// A 24-bit color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Build from a packed `0xRRGGBB` value. Bits above 24 are ignored.
    #[must_use]
    pub const fn from_u24(value: u32) -> Self {
        Self {
            r: (value >> 16) as u8,
            g: (value >> 8) as u8,
            b: value as u8,
        }
    }

    #[must_use]
    pub const fn to_u24(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Palette seeded into every canvas on first access.
pub const DEFAULT_PALETTE: [Rgb; 16] = [
    Rgb::from_u24(0xFFFFFF),
    Rgb::from_u24(0xE4E4E4),
    Rgb::from_u24(0x888888),
    Rgb::from_u24(0x222222),
    Rgb::from_u24(0xFFA7D1),
    Rgb::from_u24(0xE50000),
    Rgb::from_u24(0xE59500),
    Rgb::from_u24(0xA06A42),
    Rgb::from_u24(0xE5D900),
    Rgb::from_u24(0x94E044),
    Rgb::from_u24(0x02BE01),
    Rgb::from_u24(0x00D3DD),
    Rgb::from_u24(0x0083C7),
    Rgb::from_u24(0x0000EA),
    Rgb::from_u24(0xCF6EE4),
    Rgb::from_u24(0x820080),
];

/// Bit offset of palette entry `index`.
#[must_use]
pub fn entry_bit_offset(index: usize) -> u64 {
    index as u64 * u64::from(PALETTE_ENTRY_BITS)
}

/// Number of entries held by a palette buffer of `byte_len` bytes.
#[must_use]
pub fn entry_count(byte_len: usize) -> usize {
    byte_len / PALETTE_ENTRY_SIZE
}

/// Encode colors into the packed palette layout.
#[must_use]
pub fn encode_palette(colors: &[Rgb]) -> Bytes {
    let mut buf = Vec::with_capacity(colors.len() * PALETTE_ENTRY_SIZE);
    for (index, color) in colors.iter().enumerate() {
        write_bits(
            &mut buf,
            entry_bit_offset(index),
            PALETTE_ENTRY_BITS,
            u64::from(color.to_u24()),
        );
    }
    Bytes::from(buf)
}

/// Decode a packed palette.
///
/// # Errors
///
/// Returns [`CodecError::MalformedPalette`] if the buffer does not hold a whole
/// number of entries.
pub fn decode_palette(data: &[u8]) -> Result<Vec<Rgb>, CodecError> {
    if data.len() % PALETTE_ENTRY_SIZE != 0 {
        return Err(CodecError::MalformedPalette(data.len()));
    }

    Ok((0..entry_count(data.len()))
        .map(|index| {
            let value = read_bits(data, entry_bit_offset(index), PALETTE_ENTRY_BITS);
            Rgb::from_u24(value as u32)
        })
        .collect())
}
