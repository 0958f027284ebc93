//! Variable-length integer encoding shared by packets and the wire codec.
//!
//! Values are encoded in 1 to 9 bytes. The first byte decides the shape:
//!
//! | first byte | meaning                                     |
//! |------------|---------------------------------------------|
//! | 0..=240    | the value itself                            |
//! | 241..=248  | `240 + 256 * (b0 - 241) + b1`               |
//! | 249        | `2288 + 256 * b1 + b2`                      |
//! | 250..=255  | `b0 - 247` big-endian bytes follow (3 to 8) |
//!
//! Small values (ids, lengths, ack counters) stay at one or two bytes while
//! the full `u64` range remains representable.

use bytes::BufMut;

/// Longest possible encoding.
pub const MAX_LEN: usize = 9;

/// Appends the encoding of `value` to `buf`.
pub fn put_u64<B: BufMut>(buf: &mut B, value: u64) {
    match value {
        0..=240 => buf.put_u8(value as u8),
        241..=2287 => {
            let rest = value - 240;
            buf.put_u8((rest / 256 + 241) as u8);
            buf.put_u8((rest % 256) as u8);
        }
        2288..=67823 => {
            let rest = value - 2288;
            buf.put_u8(249);
            buf.put_u8((rest / 256) as u8);
            buf.put_u8((rest % 256) as u8);
        }
        _ => {
            let width = byte_width(value);
            buf.put_u8(247 + width as u8);
            buf.put_slice(&value.to_be_bytes()[8 - width..]);
        }
    }
}

/// Number of bytes `put_u64` writes for `value`.
pub fn encoded_len(value: u64) -> usize {
    match value {
        0..=240 => 1,
        241..=2287 => 2,
        2288..=67823 => 3,
        _ => 1 + byte_width(value),
    }
}

/// Decodes a value from the front of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` when `data`
/// does not yet hold the complete encoding. Every first byte is valid, so the
/// only failure mode is running out of input.
pub fn decode_u64(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=240 => Some((u64::from(first), 1)),
        241..=248 => {
            let second = *data.get(1)?;
            let value = 240 + 256 * u64::from(first - 241) + u64::from(second);
            Some((value, 2))
        }
        249 => {
            let bytes = data.get(1..3)?;
            let value = 2288 + 256 * u64::from(bytes[0]) + u64::from(bytes[1]);
            Some((value, 3))
        }
        _ => {
            let width = usize::from(first - 247);
            let bytes = data.get(1..1 + width)?;
            let value = bytes
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            Some((value, 1 + width))
        }
    }
}

/// Maps signed integers onto unsigned ones so small magnitudes stay small.
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// Width in bytes for values that need the big-endian form (3 to 8).
fn byte_width(value: u64) -> usize {
    let significant = 8 - (value.leading_zeros() as usize / 8);
    significant.max(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, value);
        buf
    }

    #[test]
    fn boundaries_use_expected_widths() {
        let cases = [
            (0, 1),
            (240, 1),
            (241, 2),
            (2287, 2),
            (2288, 3),
            (67823, 3),
            (67824, 4),
            ((1 << 24) - 1, 4),
            (1 << 24, 5),
            (u64::from(u32::MAX), 5),
            (1 << 40, 7),
            (u64::MAX, 9),
        ];

        for (value, width) in cases {
            let bytes = encode(value);
            assert_eq!(bytes.len(), width, "width for {value}");
            assert_eq!(encoded_len(value), width, "encoded_len for {value}");
            assert_eq!(decode_u64(&bytes), Some((value, width)), "decode {value}");
        }
    }

    #[test]
    fn truncated_input_is_incomplete() {
        let bytes = encode(1 << 40);
        for cut in 0..bytes.len() {
            assert_eq!(decode_u64(&bytes[..cut]), None);
        }
    }

    #[test]
    fn zigzag_keeps_small_magnitudes_small() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MIN)), i64::MIN);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MAX)), i64::MAX);
        assert_eq!(zigzag_decode(zigzag_encode(-123_456)), -123_456);
    }
}
