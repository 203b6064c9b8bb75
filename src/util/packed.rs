//! Packed integer arrays and their on-disk encodings.
//!
//! Two generations of layouts live here. The older stream format is a codec
//! header followed by an MSB-first bitstream of big-endian longs, and decodes
//! into one of the [`Mutable`] variants. The newer byte-aligned `PACKED`
//! format backs the block writers in [`block`] and [`monotonic`].

use std::io::{Read, Seek, Write};

use crate::codec::codec_util;
use crate::error::Result;
use crate::storage::structured::{StructReader, StructWriter};
use crate::util::bit_util::max_value;

pub mod block;
pub mod monotonic;
mod mutable;
mod writer;

pub use block::{BlockPackedReader, BlockPackedWriter};
pub use monotonic::{
    MonotonicBlockPackedReader, MonotonicBlockPackedWriter, MonotonicLongValues,
    MonotonicLongValuesBuilder, expected,
};
pub use mutable::{Mutable, Packed64};
pub use writer::PackedWriter;

/// Codec name of the stream format.
pub const CODEC_NAME: &str = "PackedInts";

/// Stream format version; the only one ever written.
pub const STREAM_VERSION_START: i32 = 0;

/// Block format: byte counts rounded up to whole longs.
pub const VERSION_START: i32 = 0;
/// Block format: byte counts rounded up to whole bytes.
pub const VERSION_BYTE_ALIGNED: i32 = 1;
/// Block format: monotonic blocks store non-negative deltas without zig-zag.
pub const VERSION_MONOTONIC_WITHOUT_ZIGZAG: i32 = 2;
pub const VERSION_CURRENT: i32 = VERSION_MONOTONIC_WITHOUT_ZIGZAG;

/// Largest accepted block size for the block writers.
pub const MAX_BLOCK_SIZE: usize = 1 << (30 - 3);

/// Number of longs needed to hold `value_count` values of `bits_per_value` bits.
pub fn long_count(value_count: usize, bits_per_value: u32) -> usize {
    (value_count as u64 * bits_per_value as u64).div_ceil(64) as usize
}

/// Bytes used by the `PACKED` encoding of `value_count` values.
pub fn byte_count(version: i32, value_count: usize, bits_per_value: u32) -> usize {
    if version < VERSION_BYTE_ALIGNED {
        8 * long_count(value_count, bits_per_value)
    } else {
        (value_count as u64 * bits_per_value as u64).div_ceil(8) as usize
    }
}

/// Next machine width at or above `bits_per_value`.
pub fn next_fixed_size(bits_per_value: u32) -> u32 {
    match bits_per_value {
        0..=8 => 8,
        9..=16 => 16,
        17..=32 => 32,
        _ => 64,
    }
}

/// Widen to the next machine width when that wastes less than a quarter of it.
pub fn rounded_bits_per_value(bits_per_value: u32) -> u32 {
    let next = next_fixed_size(bits_per_value);
    if (next - bits_per_value) * 4 < next {
        next
    } else {
        bits_per_value
    }
}

/// Mutable array using exactly `bits_per_value` bits, or a direct array when
/// the width is already a machine width.
pub fn get_mutable(value_count: usize, bits_per_value: u32) -> Mutable {
    Mutable::new(value_count, bits_per_value)
}

/// Mutable array that trades a little memory for direct word access.
/// Widths 25 through 32 land on `Direct32`.
pub fn get_mutable_rounded(value_count: usize, bits_per_value: u32) -> Mutable {
    Mutable::new(value_count, rounded_bits_per_value(bits_per_value))
}

/// Start a stream of `value_count` values of `bits_per_value` bits.
pub fn get_writer<'a, W: Write>(
    out: &'a mut StructWriter<W>,
    value_count: usize,
    bits_per_value: u32,
) -> Result<PackedWriter<'a, W>> {
    PackedWriter::new(out, value_count, bits_per_value)
}

/// Decode a stream written by [`PackedWriter`].
pub fn get_reader<R: Read + Seek>(input: &mut StructReader<R>) -> Result<Mutable> {
    codec_util::check_header(input, CODEC_NAME, STREAM_VERSION_START, STREAM_VERSION_START)?;
    let bits_per_value = input.read_vint()?;
    if !(1..=64).contains(&bits_per_value) {
        return Err(input.corrupt(format!("invalid bitsPerValue {bits_per_value}")));
    }
    let value_count = input.read_vint_len()?;
    Mutable::read_stream(input, value_count, bits_per_value as u32)
}

/// Encode `values` as an MSB-first byte stream, `bits_per_value` bits each.
pub fn encode_packed(values: &[u64], bits_per_value: u32, version: i32, out: &mut Vec<u8>) {
    let start = out.len();
    let mask = max_value(bits_per_value);
    let mut acc: u64 = 0;
    let mut acc_bits: u32 = 0;
    for &value in values {
        let v = value & mask;
        let mut remaining = bits_per_value;
        while remaining > 0 {
            let take = (8 - acc_bits).min(remaining);
            let chunk = (v >> (remaining - take)) & ((1u64 << take) - 1);
            acc = (acc << take) | chunk;
            acc_bits += take;
            remaining -= take;
            if acc_bits == 8 {
                out.push(acc as u8);
                acc = 0;
                acc_bits = 0;
            }
        }
    }
    if acc_bits > 0 {
        out.push((acc << (8 - acc_bits)) as u8);
    }
    let expected = byte_count(version, values.len(), bits_per_value);
    out.resize(start + expected, 0);
}

/// Read one value from an MSB-first byte stream.
pub fn decode_packed_value(bytes: &[u8], index: usize, bits_per_value: u32) -> u64 {
    let mut bit_pos = index as u64 * bits_per_value as u64;
    let mut remaining = bits_per_value;
    let mut value: u64 = 0;
    while remaining > 0 {
        let byte = bytes[(bit_pos >> 3) as usize] as u64;
        let offset = (bit_pos & 7) as u32;
        let available = 8 - offset;
        let take = available.min(remaining);
        let chunk = (byte >> (available - take)) & ((1u64 << take) - 1);
        value = (value << take) | chunk;
        remaining -= take;
        bit_pos += take as u64;
    }
    value
}

/// Read a `PACKED` block of `value_count` values into a mutable array.
pub(crate) fn read_packed_block<R: Read + Seek>(
    input: &mut StructReader<R>,
    version: i32,
    value_count: usize,
    bits_per_value: u32,
) -> Result<Mutable> {
    let bytes = input.read_vec(byte_count(version, value_count, bits_per_value))?;
    let mut values = get_mutable_rounded(value_count, bits_per_value);
    for i in 0..value_count {
        values.set(i, decode_packed_value(&bytes, i, bits_per_value));
    }
    Ok(values)
}

/// Write `values` as a `PACKED` block.
pub(crate) fn write_packed_block<W: Write>(
    out: &mut StructWriter<W>,
    values: &[u64],
    bits_per_value: u32,
    version: i32,
) -> Result<()> {
    let mut buf = Vec::with_capacity(byte_count(version, values.len(), bits_per_value));
    encode_packed(values, bits_per_value, version, &mut buf);
    out.write_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_rounding_policy() {
        assert_eq!(rounded_bits_per_value(6), 6);
        assert_eq!(rounded_bits_per_value(7), 8);
        assert_eq!(rounded_bits_per_value(12), 12);
        assert_eq!(rounded_bits_per_value(13), 16);
        assert_eq!(rounded_bits_per_value(24), 24);
        assert_eq!(rounded_bits_per_value(25), 32);
        assert_eq!(rounded_bits_per_value(32), 32);
        assert_eq!(rounded_bits_per_value(48), 48);
        assert_eq!(rounded_bits_per_value(49), 64);
        assert!(matches!(get_mutable_rounded(4, 27), Mutable::Direct32(_)));
        assert!(matches!(get_mutable(4, 27), Mutable::Packed64(_)));
    }

    #[test]
    fn test_byte_counts() {
        assert_eq!(byte_count(VERSION_CURRENT, 3, 5), 2);
        assert_eq!(byte_count(VERSION_START, 3, 5), 8);
        assert_eq!(byte_count(VERSION_CURRENT, 64, 64), 512);
        assert_eq!(long_count(65, 1), 2);
    }

    #[test]
    fn test_encode_msb_first() {
        let mut out = Vec::new();
        encode_packed(&[1, 2, 3], 4, VERSION_CURRENT, &mut out);
        assert_eq!(out, vec![0x12, 0x30]);
        assert_eq!(decode_packed_value(&out, 0, 4), 1);
        assert_eq!(decode_packed_value(&out, 2, 4), 3);

        let mut wide = Vec::new();
        encode_packed(&[u64::MAX, 7], 64, VERSION_CURRENT, &mut wide);
        assert_eq!(decode_packed_value(&wide, 0, 64), u64::MAX);
        assert_eq!(decode_packed_value(&wide, 1, 64), 7);
    }

    #[test]
    fn test_stream_round_trip_all_widths() {
        for bits in 1..=64u32 {
            let count = 37;
            let mask = max_value(bits);
            let values: Vec<u64> = (0..count as u64)
                .map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask)
                .collect();

            let mut out = StructWriter::new(Vec::new());
            {
                let mut writer = get_writer(&mut out, count, bits).unwrap();
                for &v in &values {
                    writer.add(v).unwrap();
                }
                writer.finish().unwrap();
            }
            // Trailing sentinel proves the reader consumed padding exactly.
            out.write_i32(0x0BADF00D).unwrap();

            let mut input = StructReader::new(Cursor::new(out.into_inner()), "packed");
            let reader = get_reader(&mut input).unwrap();
            assert_eq!(reader.bits_per_value(), bits);
            for (i, &v) in values.iter().enumerate() {
                assert_eq!(reader.get(i), v, "bits={bits} index={i}");
            }
            assert_eq!(input.read_i32().unwrap(), 0x0BADF00D, "bits={bits}");
        }
    }
}
