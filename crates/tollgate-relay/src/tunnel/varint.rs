//! QUIC variable-length integers (RFC 9000 section 16).
//!
//! The two high bits of the first byte give the encoded length: 1, 2, 4 or
//! 8 bytes carrying 6, 14, 30 or 62 bits.

use bytes::BufMut;

/// Largest value a varint can carry.
pub const MAX: u64 = (1 << 62) - 1;

/// Decode a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// buffer is shorter than the encoding announces.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    let bytes = buf.get(..len)?;
    let value = bytes[1..]
        .iter()
        .fold(u64::from(first & 0x3f), |acc, &b| (acc << 8) | u64::from(b));
    Some((value, len))
}

/// Number of bytes needed to encode `value`.
pub const fn encoded_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Append `value` to `buf` in its shortest encoding. Values above [`MAX`] are
/// clamped.
#[allow(clippy::cast_possible_truncation)]
pub fn encode<B: BufMut>(value: u64, buf: &mut B) {
    let value = value.min(MAX);
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}
