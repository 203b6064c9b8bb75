//! Delta-from-minimum block encoding for arbitrary longs.
//!
//! Each block starts with a token byte holding the bit width and a flag for
//! a zero minimum, then the minimum itself when it is non-zero, then the
//! residuals packed at that width.

use std::io::{Read, Seek, Write};

use crate::error::{Result, SegmergeError};
use crate::storage::structured::{StructReader, StructWriter};
use crate::util::bit_util::{max_value, unsigned_bits_required, zigzag_decode_i64, zigzag_encode_i64};
use crate::util::packed::{
    MAX_BLOCK_SIZE, Mutable, VERSION_CURRENT, read_packed_block, write_packed_block,
};

const MIN_VALUE_EQUALS_0: u8 = 1;
const BPV_SHIFT: u32 = 1;

pub(crate) fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(SegmergeError::invalid_argument(format!(
            "block size must be in 1..={MAX_BLOCK_SIZE}, got {block_size}"
        )));
    }
    Ok(())
}

/// Vlong that spends all eight bits of a ninth byte instead of a tenth byte.
pub(crate) fn write_block_vlong<W: Write>(out: &mut StructWriter<W>, mut v: u64) -> Result<()> {
    let mut k = 0;
    while v & !0x7F != 0 && k < 8 {
        out.write_u8(((v & 0x7F) | 0x80) as u8)?;
        v >>= 7;
        k += 1;
    }
    out.write_u8(v as u8)
}

pub(crate) fn read_block_vlong<R: Read + Seek>(input: &mut StructReader<R>) -> Result<u64> {
    let mut result: u64 = 0;
    for shift in (0..56).step_by(7) {
        let b = input.read_u8()?;
        result |= ((b & 0x7F) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(result);
        }
    }
    let b = input.read_u8()?;
    Ok(result | ((b as u64) << 56))
}

/// Buffers values and writes them one block at a time.
pub struct BlockPackedWriter<'a, W: Write> {
    out: &'a mut StructWriter<W>,
    values: Vec<i64>,
    off: usize,
    ord: u64,
    finished: bool,
}

impl<'a, W: Write> BlockPackedWriter<'a, W> {
    pub fn new(out: &'a mut StructWriter<W>, block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;
        Ok(BlockPackedWriter {
            out,
            values: vec![0; block_size],
            off: 0,
            ord: 0,
            finished: false,
        })
    }

    pub fn add(&mut self, value: i64) -> Result<()> {
        if self.finished {
            return Err(SegmergeError::illegal_state("already finished"));
        }
        if self.off == self.values.len() {
            self.flush()?;
        }
        self.values[self.off] = value;
        self.off += 1;
        self.ord += 1;
        Ok(())
    }

    /// Number of values added so far.
    pub fn ord(&self) -> u64 {
        self.ord
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(SegmergeError::illegal_state("already finished"));
        }
        if self.off > 0 {
            self.flush()?;
        }
        self.finished = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let block = &self.values[..self.off];
        let mut min = block.iter().copied().min().unwrap_or(0);
        let max = block.iter().copied().max().unwrap_or(0);
        let delta = max.wrapping_sub(min) as u64;
        let bits_required = if delta == 0 {
            0
        } else {
            unsigned_bits_required(delta)
        };
        if bits_required == 64 {
            min = 0;
        } else if min > 0 {
            min = max.saturating_sub(max_value(bits_required) as i64).max(0);
        }

        let token = ((bits_required << BPV_SHIFT) as u8) | if min == 0 { MIN_VALUE_EQUALS_0 } else { 0 };
        self.out.write_u8(token)?;
        if min != 0 {
            write_block_vlong(self.out, zigzag_encode_i64(min) - 1)?;
        }
        if bits_required > 0 {
            let residuals: Vec<u64> = block.iter().map(|&v| v.wrapping_sub(min) as u64).collect();
            write_packed_block(self.out, &residuals, bits_required, VERSION_CURRENT)?;
        }
        self.off = 0;
        Ok(())
    }
}

/// Random access over blocks written by [`BlockPackedWriter`].
#[derive(Debug, Clone)]
pub struct BlockPackedReader {
    block_size: usize,
    value_count: u64,
    min_values: Vec<i64>,
    sub_readers: Vec<Option<Mutable>>,
}

impl BlockPackedReader {
    pub fn open<R: Read + Seek>(
        input: &mut StructReader<R>,
        version: i32,
        block_size: usize,
        value_count: u64,
    ) -> Result<Self> {
        check_block_size(block_size)?;
        let num_blocks = value_count.div_ceil(block_size as u64) as usize;
        let mut min_values = Vec::with_capacity(num_blocks);
        let mut sub_readers = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            let token = input.read_u8()?;
            let bits_per_value = (token >> BPV_SHIFT) as u32;
            if bits_per_value > 64 {
                return Err(input.corrupt(format!("block bitsPerValue {bits_per_value}")));
            }
            let min = if token & MIN_VALUE_EQUALS_0 == 0 {
                zigzag_decode_i64(read_block_vlong(input)?.wrapping_add(1))
            } else {
                0
            };
            min_values.push(min);
            if bits_per_value == 0 {
                sub_readers.push(None);
            } else {
                let size = (block_size as u64).min(value_count - (i * block_size) as u64) as usize;
                sub_readers.push(Some(read_packed_block(input, version, size, bits_per_value)?));
            }
        }
        Ok(BlockPackedReader {
            block_size,
            value_count,
            min_values,
            sub_readers,
        })
    }

    pub fn get(&self, index: u64) -> i64 {
        debug_assert!(index < self.value_count);
        let block = (index / self.block_size as u64) as usize;
        let idx = (index % self.block_size as u64) as usize;
        let residual = match &self.sub_readers[block] {
            Some(values) => values.get(idx),
            None => 0,
        };
        self.min_values[block].wrapping_add(residual as i64)
    }

    pub fn size(&self) -> u64 {
        self.value_count
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.min_values.len() * 8
            + self
                .sub_readers
                .iter()
                .flatten()
                .map(Mutable::ram_bytes_used)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(values: &[i64], block_size: usize) {
        let mut out = StructWriter::new(Vec::new());
        {
            let mut writer = BlockPackedWriter::new(&mut out, block_size).unwrap();
            for &v in values {
                writer.add(v).unwrap();
            }
            writer.finish().unwrap();
            assert_eq!(writer.ord(), values.len() as u64);
        }
        out.write_i32(-7).unwrap();
        let mut input = StructReader::new(Cursor::new(out.into_inner()), "blocks");
        let reader =
            BlockPackedReader::open(&mut input, VERSION_CURRENT, block_size, values.len() as u64)
                .unwrap();
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(reader.get(i as u64), v, "block_size={block_size} index={i}");
        }
        assert_eq!(input.read_i32().unwrap(), -7);
    }

    #[test]
    fn test_arbitrary_longs() {
        let values: Vec<i64> = (0..300)
            .map(|i: i64| match i % 7 {
                0 => i64::MIN + i,
                1 => i64::MAX - i,
                2 => -i * 1000,
                3 => 0,
                _ => i * 31,
            })
            .collect();
        for block_size in [1, 2, 63, 64, 65, 4096] {
            round_trip(&values, block_size);
        }
    }

    #[test]
    fn test_constant_and_positive_blocks() {
        round_trip(&[5; 130], 64);
        round_trip(&(1000..1200).collect::<Vec<_>>(), 64);
        round_trip(&[42], 64);
    }

    #[test]
    fn test_block_vlong_nine_bytes() {
        let mut out = StructWriter::new(Vec::new());
        write_block_vlong(&mut out, u64::MAX - 1).unwrap();
        let bytes = out.into_inner();
        assert_eq!(bytes.len(), 9);
        let mut input = StructReader::new(Cursor::new(bytes), "vlong");
        assert_eq!(read_block_vlong(&mut input).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn test_rejects_zero_block_size() {
        let mut out = StructWriter::new(Vec::new());
        assert!(BlockPackedWriter::new(&mut out, 0).is_err());
    }
}
