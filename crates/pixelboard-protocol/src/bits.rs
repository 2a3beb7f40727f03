//! Bit-field access over packed byte buffers.
//!
//! Fields are unsigned, most-significant bit first, and may start at any bit
//! offset. This is the same layout Redis uses for `BITFIELD`, so buffers written
//! through these helpers and buffers written by the server are interchangeable.

/// Widest supported field, in bits.
pub const MAX_FIELD_BITS: u8 = 64;

/// Read an unsigned field of `width` bits starting at `bit_offset`.
///
/// Bits past the end of `buf` read as zero, matching how a missing or short
/// string behaves on the server.
///
/// # Panics
///
/// Panics if `width` is zero or larger than [`MAX_FIELD_BITS`].
#[must_use]
pub fn read_bits(buf: &[u8], bit_offset: u64, width: u8) -> u64 {
    assert!(width > 0 && width <= MAX_FIELD_BITS, "invalid field width {width}");

    let mut value = 0u64;
    for i in 0..u64::from(width) {
        let bit = bit_offset + i;
        let byte = usize::try_from(bit / 8).ok().and_then(|idx| buf.get(idx));
        let set = byte.map_or(false, |b| b & (0x80 >> (bit % 8)) != 0);
        value = (value << 1) | u64::from(set);
    }
    value
}

/// Write the low `width` bits of `value` starting at `bit_offset`.
///
/// The buffer is zero-extended when the field reaches past its end.
///
/// # Panics
///
/// Panics if `width` is zero or larger than [`MAX_FIELD_BITS`].
pub fn write_bits(buf: &mut Vec<u8>, bit_offset: u64, width: u8, value: u64) {
    assert!(width > 0 && width <= MAX_FIELD_BITS, "invalid field width {width}");

    let end_bit = bit_offset + u64::from(width);
    let needed = end_bit.div_ceil(8) as usize;
    if buf.len() < needed {
        buf.resize(needed, 0);
    }

    for i in 0..u64::from(width) {
        let bit = bit_offset + i;
        let mask = 0x80u8 >> (bit % 8);
        let set = (value >> (u64::from(width) - 1 - i)) & 1 == 1;
        let byte = &mut buf[(bit / 8) as usize];
        if set {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}
