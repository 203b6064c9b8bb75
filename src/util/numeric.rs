//! Byte encodings of numbers that sort the same as the numbers themselves
//! under unsigned lexicographic comparison. Points and sort keys use them.

/// Flip the sign bit so negative ints sort before positive ones.
pub fn int_to_sortable_bytes(value: i32) -> [u8; 4] {
    ((value as u32) ^ 0x8000_0000).to_be_bytes()
}

pub fn sortable_bytes_to_int(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    (u32::from_be_bytes(buf) ^ 0x8000_0000) as i32
}

pub fn long_to_sortable_bytes(value: i64) -> [u8; 8] {
    ((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

pub fn sortable_bytes_to_long(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    (u64::from_be_bytes(buf) ^ 0x8000_0000_0000_0000) as i64
}

/// Reorder the bits of a float so that the result compares like the float
/// when read as a signed int. NaN sorts above positive infinity.
pub fn float_to_sortable_int(value: f32) -> i32 {
    sortable_float_bits(value.to_bits() as i32)
}

pub fn sortable_int_to_float(encoded: i32) -> f32 {
    f32::from_bits(sortable_float_bits(encoded) as u32)
}

pub fn double_to_sortable_long(value: f64) -> i64 {
    sortable_double_bits(value.to_bits() as i64)
}

pub fn sortable_long_to_double(encoded: i64) -> f64 {
    f64::from_bits(sortable_double_bits(encoded) as u64)
}

/// Self-inverse: flips the non-sign bits of negative floats.
#[inline]
pub fn sortable_float_bits(bits: i32) -> i32 {
    bits ^ ((bits >> 31) & 0x7fff_ffff)
}

#[inline]
pub fn sortable_double_bits(bits: i64) -> i64 {
    bits ^ ((bits >> 63) & 0x7fff_ffff_ffff_ffff)
}

pub fn float_to_sortable_bytes(value: f32) -> [u8; 4] {
    int_to_sortable_bytes(float_to_sortable_int(value))
}

pub fn sortable_bytes_to_float(bytes: &[u8]) -> f32 {
    sortable_int_to_float(sortable_bytes_to_int(bytes))
}

pub fn double_to_sortable_bytes(value: f64) -> [u8; 8] {
    long_to_sortable_bytes(double_to_sortable_long(value))
}

pub fn sortable_bytes_to_double(bytes: &[u8]) -> f64 {
    sortable_long_to_double(sortable_bytes_to_long(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_order_is_preserved() {
        let values = [i32::MIN, -100, -1, 0, 1, 7, i32::MAX];
        for pair in values.windows(2) {
            assert!(int_to_sortable_bytes(pair[0]) < int_to_sortable_bytes(pair[1]));
        }
        for v in values {
            assert_eq!(sortable_bytes_to_int(&int_to_sortable_bytes(v)), v);
        }
    }

    #[test]
    fn test_long_order_is_preserved() {
        let values = [i64::MIN, -5_000_000_000, -1, 0, 3, i64::MAX];
        for pair in values.windows(2) {
            assert!(long_to_sortable_bytes(pair[0]) < long_to_sortable_bytes(pair[1]));
        }
        assert_eq!(sortable_bytes_to_long(&long_to_sortable_bytes(-42)), -42);
    }

    #[test]
    fn test_float_order_is_preserved() {
        let values = [f32::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-30, 3.25, f32::INFINITY];
        for pair in values.windows(2) {
            assert!(float_to_sortable_bytes(pair[0]) < float_to_sortable_bytes(pair[1]));
        }
        assert_eq!(sortable_bytes_to_float(&float_to_sortable_bytes(-2.5)), -2.5);
        assert!(float_to_sortable_int(f32::NAN) > float_to_sortable_int(f32::INFINITY));
    }

    #[test]
    fn test_double_order_is_preserved() {
        let values = [f64::MIN, -1.0, -0.0, 0.0, 0.5, f64::MAX];
        for pair in values.windows(2) {
            assert!(double_to_sortable_bytes(pair[0]) < double_to_sortable_bytes(pair[1]));
        }
        assert_eq!(sortable_bytes_to_double(&double_to_sortable_bytes(0.5)), 0.5);
        assert_eq!(sortable_long_to_double(double_to_sortable_long(-7.75)), -7.75);
    }
}
