//! Block encoding for sequences that grow roughly linearly.
//!
//! Each block stores an intercept, a float slope, and the residuals of every
//! value against the line they define. Writer and reader both go through
//! [`expected`], so the prediction is computed bit-for-bit identically on
//! either side.

use std::io::{Cursor, Read, Seek, Write};

use crate::error::{Result, SegmergeError};
use crate::storage::structured::{StructReader, StructWriter};
use crate::util::bit_util::{unsigned_bits_required, zigzag_decode_i64, zigzag_encode_i64};
use crate::util::packed::block::check_block_size;
use crate::util::packed::{
    Mutable, VERSION_CURRENT, VERSION_MONOTONIC_WITHOUT_ZIGZAG, VERSION_START, read_packed_block,
    write_packed_block,
};

/// Linear prediction of the value at `index` in a block.
///
/// The product is taken in single precision and truncated toward zero,
/// saturating at the `i64` bounds.
#[inline]
pub fn expected(origin: i64, average: f32, index: usize) -> i64 {
    origin.wrapping_add((average * index as f32) as i64)
}

/// Writes monotonic blocks.
///
/// The current version stores a zig-zag intercept lowered until every
/// residual is non-negative. Older versions store the first value as the
/// intercept and zig-zag encode each residual instead.
pub struct MonotonicBlockPackedWriter<'a, W: Write> {
    out: &'a mut StructWriter<W>,
    version: i32,
    values: Vec<i64>,
    off: usize,
    ord: u64,
    finished: bool,
}

impl<'a, W: Write> MonotonicBlockPackedWriter<'a, W> {
    pub fn new(out: &'a mut StructWriter<W>, block_size: usize) -> Result<Self> {
        Self::with_version(out, block_size, VERSION_CURRENT)
    }

    /// Writer for an older block layout, used to produce legacy files.
    pub fn with_version(
        out: &'a mut StructWriter<W>,
        block_size: usize,
        version: i32,
    ) -> Result<Self> {
        check_block_size(block_size)?;
        if !(VERSION_START..=VERSION_CURRENT).contains(&version) {
            return Err(SegmergeError::invalid_argument(format!(
                "unknown packed ints version {version}"
            )));
        }
        Ok(MonotonicBlockPackedWriter {
            out,
            version,
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
        debug_assert!(self.off > 0);
        let off = self.off;
        let block = &mut self.values[..off];
        let avg = if off == 1 {
            0f32
        } else {
            block[off - 1].wrapping_sub(block[0]) as f32 / (off - 1) as f32
        };

        if self.version >= VERSION_MONOTONIC_WITHOUT_ZIGZAG {
            let mut min = block[0];
            for (i, &actual) in block.iter().enumerate().skip(1) {
                let predicted = expected(min, avg, i);
                if predicted > actual {
                    min = min.wrapping_sub(predicted.wrapping_sub(actual));
                }
            }
            let mut max_delta: u64 = 0;
            for (i, v) in block.iter_mut().enumerate() {
                *v = v.wrapping_sub(expected(min, avg, i));
                max_delta = max_delta.max(*v as u64);
            }
            self.out.write_zlong(min)?;
            self.out.write_i32(avg.to_bits() as i32)?;
            self.write_residuals(max_delta)?;
        } else {
            let min = block[0];
            let mut max_delta: u64 = 0;
            for (i, v) in block.iter_mut().enumerate() {
                let encoded = zigzag_encode_i64(v.wrapping_sub(expected(min, avg, i)));
                *v = encoded as i64;
                max_delta = max_delta.max(encoded);
            }
            self.out.write_vlong(min)?;
            self.out.write_i32(avg.to_bits() as i32)?;
            self.write_residuals(max_delta)?;
        }
        self.off = 0;
        Ok(())
    }

    fn write_residuals(&mut self, max_delta: u64) -> Result<()> {
        if max_delta == 0 {
            self.out.write_vint(0)
        } else {
            let bits_required = unsigned_bits_required(max_delta);
            self.out.write_vint(bits_required as i32)?;
            let residuals: Vec<u64> = self.values[..self.off].iter().map(|&v| v as u64).collect();
            write_packed_block(self.out, &residuals, bits_required, self.version)
        }
    }
}

/// Random access over blocks written by [`MonotonicBlockPackedWriter`].
#[derive(Debug, Clone)]
pub struct MonotonicBlockPackedReader {
    block_size: usize,
    value_count: u64,
    version: i32,
    min_values: Vec<i64>,
    averages: Vec<f32>,
    sub_readers: Vec<Option<Mutable>>,
}

impl MonotonicBlockPackedReader {
    pub fn open<R: Read + Seek>(
        input: &mut StructReader<R>,
        version: i32,
        block_size: usize,
        value_count: u64,
    ) -> Result<Self> {
        check_block_size(block_size)?;
        if !(VERSION_START..=VERSION_CURRENT).contains(&version) {
            return Err(input.corrupt(format!("unknown packed ints version {version}")));
        }
        let num_blocks = value_count.div_ceil(block_size as u64) as usize;
        let mut min_values = Vec::with_capacity(num_blocks);
        let mut averages = Vec::with_capacity(num_blocks);
        let mut sub_readers = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            if version < VERSION_MONOTONIC_WITHOUT_ZIGZAG {
                min_values.push(input.read_vlong()?);
            } else {
                min_values.push(input.read_zlong()?);
            }
            averages.push(f32::from_bits(input.read_i32()? as u32));
            let bits_per_value = input.read_vint()?;
            if !(0..=64).contains(&bits_per_value) {
                return Err(input.corrupt(format!("block bitsPerValue {bits_per_value}")));
            }
            if bits_per_value == 0 {
                sub_readers.push(None);
            } else {
                let size = (block_size as u64).min(value_count - (i * block_size) as u64) as usize;
                sub_readers.push(Some(read_packed_block(
                    input,
                    version,
                    size,
                    bits_per_value as u32,
                )?));
            }
        }
        Ok(MonotonicBlockPackedReader {
            block_size,
            value_count,
            version,
            min_values,
            averages,
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
        let predicted = expected(self.min_values[block], self.averages[block], idx);
        if self.version < VERSION_MONOTONIC_WITHOUT_ZIGZAG {
            predicted.wrapping_add(zigzag_decode_i64(residual))
        } else {
            predicted.wrapping_add(residual as i64)
        }
    }

    pub fn size(&self) -> u64 {
        self.value_count
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.min_values.len() * 8
            + self.averages.len() * 4
            + self
                .sub_readers
                .iter()
                .flatten()
                .map(Mutable::ram_bytes_used)
                .sum::<usize>()
    }
}

/// Default block size for in-memory monotonic sequences.
pub const DEFAULT_MONOTONIC_BLOCK_SIZE: usize = 1024;

/// Collects a monotonic sequence in memory before compressing it.
#[derive(Debug, Clone)]
pub struct MonotonicLongValuesBuilder {
    block_size: usize,
    pending: Vec<i64>,
}

impl MonotonicLongValuesBuilder {
    pub fn add(&mut self, value: i64) -> &mut Self {
        self.pending.push(value);
        self
    }

    pub fn size(&self) -> usize {
        self.pending.len()
    }

    pub fn build(self) -> Result<MonotonicLongValues> {
        let mut out = StructWriter::new(Vec::new());
        {
            let mut writer = MonotonicBlockPackedWriter::new(&mut out, self.block_size)?;
            for &v in &self.pending {
                writer.add(v)?;
            }
            writer.finish()?;
        }
        let mut input = StructReader::new(Cursor::new(out.into_inner()), "monotonic values");
        let reader = MonotonicBlockPackedReader::open(
            &mut input,
            VERSION_CURRENT,
            self.block_size,
            self.pending.len() as u64,
        )?;
        Ok(MonotonicLongValues { reader })
    }
}

/// A compressed, read-only monotonic sequence.
#[derive(Debug, Clone)]
pub struct MonotonicLongValues {
    reader: MonotonicBlockPackedReader,
}

impl MonotonicLongValues {
    pub fn builder() -> MonotonicLongValuesBuilder {
        Self::builder_with_block_size(DEFAULT_MONOTONIC_BLOCK_SIZE)
    }

    pub fn builder_with_block_size(block_size: usize) -> MonotonicLongValuesBuilder {
        MonotonicLongValuesBuilder {
            block_size,
            pending: Vec::new(),
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> i64 {
        self.reader.get(index as u64)
    }

    pub fn size(&self) -> usize {
        self.reader.size() as usize
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.reader.ram_bytes_used()
    }
}
