// Unsigned LEB128 length prefixes
//
// Seven payload bits per byte, high bit set on every byte but the last. At most ten
// bytes encode a u64; the tenth byte may only carry the top bit.

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Outcome of decoding a prefix from the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Varint {
    /// Decoded value and the number of bytes it occupied.
    Complete { value: u64, len: usize },
    /// The buffer ends before the terminating byte.
    Incomplete,
    /// More than ten bytes, or the value overflows 64 bits.
    Overflow,
}

/// Decode a varint from the start of `buf`.
pub fn decode(buf: &[u8]) -> Varint {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Varint::Overflow;
        }
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Varint::Overflow;
            }
            return Varint::Complete {
                value: value | (u64::from(byte) << shift),
                len: i + 1,
            };
        }
        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }

    if buf.len() >= MAX_VARINT_LEN {
        Varint::Overflow
    } else {
        Varint::Incomplete
    }
}

/// Append the encoding of `value` to `out`, returning the number of bytes written.
pub fn encode(mut value: u64, out: &mut Vec<u8>) -> usize {
    let mut written = 1;
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
        written += 1;
    }
    out.push(value as u8);
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_values() {
        assert_eq!(decode(&[0x00]), Varint::Complete { value: 0, len: 1 });
        assert_eq!(decode(&[0x05, 0xff]), Varint::Complete { value: 5, len: 1 });
        assert_eq!(decode(&[0x7f]), Varint::Complete { value: 127, len: 1 });
    }

    #[test]
    fn test_multi_byte_value() {
        // 300 = 0b1_0010_1100
        assert_eq!(decode(&[0xac, 0x02]), Varint::Complete { value: 300, len: 2 });

        let mut out = Vec::new();
        assert_eq!(encode(300, &mut out), 2);
        assert_eq!(out, vec![0xac, 0x02]);
    }

    #[test]
    fn test_incomplete_prefix() {
        assert_eq!(decode(&[]), Varint::Incomplete);
        assert_eq!(decode(&[0x80]), Varint::Incomplete);
        assert_eq!(decode(&[0xff, 0xff, 0xff]), Varint::Incomplete);
    }

    #[test]
    fn test_u64_max_and_overflow() {
        let mut out = Vec::new();
        assert_eq!(encode(u64::MAX, &mut out), MAX_VARINT_LEN);
        assert_eq!(
            decode(&out),
            Varint::Complete {
                value: u64::MAX,
                len: MAX_VARINT_LEN
            }
        );

        // tenth byte carrying more than the top bit
        let mut too_big = vec![0xff; 9];
        too_big.push(0x02);
        assert_eq!(decode(&too_big), Varint::Overflow);

        // eleven continuation bytes
        assert_eq!(decode(&[0x80; 11]), Varint::Overflow);
    }
}
