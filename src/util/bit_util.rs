//! Bit-twiddling helpers shared by the integer codecs.

/// Zig-zag encode a long so that small magnitudes get small codes.
#[inline]
pub fn zigzag_encode_i64(v: i64) -> u64 {
    ((v >> 63) ^ (v << 1)) as u64
}

#[inline]
pub fn zigzag_decode_i64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[inline]
pub fn zigzag_encode_i32(v: i32) -> u32 {
    ((v >> 31) ^ (v << 1)) as u32
}

#[inline]
pub fn zigzag_decode_i32(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

/// Bits needed to store `max_value` when it is read back as unsigned.
/// Zero still needs one bit.
#[inline]
pub fn unsigned_bits_required(max_value: u64) -> u32 {
    std::cmp::max(1, 64 - max_value.leading_zeros())
}

/// Bits needed to store a non-negative `max_value`.
#[inline]
pub fn bits_required(max_value: i64) -> u32 {
    assert!(max_value >= 0, "max_value must be non-negative (got {max_value})");
    unsigned_bits_required(max_value as u64)
}

/// Largest value representable with `bits_per_value` bits.
#[inline]
pub fn max_value(bits_per_value: u32) -> u64 {
    if bits_per_value >= 64 {
        u64::MAX
    } else {
        (1u64 << bits_per_value) - 1
    }
}

/// Number of `u64` words needed to hold `num_bits` bits.
#[inline]
pub fn bits_to_words(num_bits: usize) -> usize {
    num_bits.div_ceil(64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag() {
        for v in [0i64, 1, -1, 2, -2, i64::MAX, i64::MIN, 123456789, -987654321] {
            assert_eq!(zigzag_decode_i64(zigzag_encode_i64(v)), v);
        }
        assert_eq!(zigzag_encode_i64(-1), 1);
        assert_eq!(zigzag_encode_i64(1), 2);
        assert_eq!(zigzag_encode_i32(i32::MIN), u32::MAX);
        assert_eq!(zigzag_decode_i32(zigzag_encode_i32(-77)), -77);
    }

    #[test]
    fn test_bits_required() {
        assert_eq!(bits_required(0), 1);
        assert_eq!(bits_required(1), 1);
        assert_eq!(bits_required(2), 2);
        assert_eq!(bits_required(255), 8);
        assert_eq!(bits_required(256), 9);
        assert_eq!(bits_required(i64::MAX), 63);
        assert_eq!(unsigned_bits_required(u64::MAX), 64);
        assert_eq!(max_value(3), 7);
        assert_eq!(max_value(64), u64::MAX);
    }
}
