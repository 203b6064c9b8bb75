//! Fixed-width mutable integer arrays.

use std::io::{Read, Seek};

use crate::error::Result;
use crate::storage::structured::StructReader;
use crate::util::bit_util::max_value;
use crate::util::packed::long_count;

/// A fixed-size array of unsigned values of one bit width.
///
/// Machine widths get a direct array. Everything else is bit-packed into
/// longs, most significant bits first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutable {
    Direct8(Vec<u8>),
    Direct16(Vec<u16>),
    Direct32(Vec<u32>),
    Direct64(Vec<u64>),
    Packed64(Packed64),
}

impl Mutable {
    /// Array of `value_count` zeros, `bits_per_value` in `1..=64`.
    pub fn new(value_count: usize, bits_per_value: u32) -> Self {
        assert!(
            (1..=64).contains(&bits_per_value),
            "bits_per_value must be in 1..=64, got {bits_per_value}"
        );
        match bits_per_value {
            8 => Mutable::Direct8(vec![0; value_count]),
            16 => Mutable::Direct16(vec![0; value_count]),
            32 => Mutable::Direct32(vec![0; value_count]),
            64 => Mutable::Direct64(vec![0; value_count]),
            _ => Mutable::Packed64(Packed64::new(value_count, bits_per_value)),
        }
    }

    pub fn direct32(value_count: usize) -> Self {
        Mutable::Direct32(vec![0; value_count])
    }

    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        match self {
            Mutable::Direct8(v) => v[index] as u64,
            Mutable::Direct16(v) => v[index] as u64,
            Mutable::Direct32(v) => v[index] as u64,
            Mutable::Direct64(v) => v[index],
            Mutable::Packed64(p) => p.get(index),
        }
    }

    /// Store `value`, truncated to this array's width.
    #[inline]
    pub fn set(&mut self, index: usize, value: u64) {
        match self {
            Mutable::Direct8(v) => v[index] = value as u8,
            Mutable::Direct16(v) => v[index] = value as u16,
            Mutable::Direct32(v) => v[index] = value as u32,
            Mutable::Direct64(v) => v[index] = value,
            Mutable::Packed64(p) => p.set(index, value),
        }
    }

    pub fn fill(&mut self, from: usize, to: usize, value: u64) {
        for i in from..to {
            self.set(i, value);
        }
    }

    pub fn clear(&mut self) {
        match self {
            Mutable::Direct8(v) => v.fill(0),
            Mutable::Direct16(v) => v.fill(0),
            Mutable::Direct32(v) => v.fill(0),
            Mutable::Direct64(v) => v.fill(0),
            Mutable::Packed64(p) => p.blocks.fill(0),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Mutable::Direct8(v) => v.len(),
            Mutable::Direct16(v) => v.len(),
            Mutable::Direct32(v) => v.len(),
            Mutable::Direct64(v) => v.len(),
            Mutable::Packed64(p) => p.value_count,
        }
    }

    pub fn bits_per_value(&self) -> u32 {
        match self {
            Mutable::Direct8(_) => 8,
            Mutable::Direct16(_) => 16,
            Mutable::Direct32(_) => 32,
            Mutable::Direct64(_) => 64,
            Mutable::Packed64(p) => p.bits_per_value,
        }
    }

    /// Bytes held by the backing array.
    pub fn ram_bytes_used(&self) -> usize {
        match self {
            Mutable::Direct8(v) => v.len(),
            Mutable::Direct16(v) => v.len() * 2,
            Mutable::Direct32(v) => v.len() * 4,
            Mutable::Direct64(v) => v.len() * 8,
            Mutable::Packed64(p) => p.blocks.len() * 8,
        }
    }

    /// Decode the body of a stream, after its header. Direct variants skip
    /// the padding that completes the final long.
    pub(crate) fn read_stream<R: Read + Seek>(
        input: &mut StructReader<R>,
        value_count: usize,
        bits_per_value: u32,
    ) -> Result<Self> {
        Ok(match bits_per_value {
            8 => {
                let values = input.read_vec(value_count)?;
                let pad = (8 - value_count % 8) % 8;
                input.skip_bytes(pad as u64)?;
                Mutable::Direct8(values)
            }
            16 => {
                let mut values = Vec::with_capacity(value_count);
                for _ in 0..value_count {
                    values.push(input.read_i16()? as u16);
                }
                let pad = (4 - value_count % 4) % 4;
                input.skip_bytes(2 * pad as u64)?;
                Mutable::Direct16(values)
            }
            32 => {
                let mut values = Vec::with_capacity(value_count);
                for _ in 0..value_count {
                    values.push(input.read_i32()? as u32);
                }
                if value_count % 2 == 1 {
                    input.skip_bytes(4)?;
                }
                Mutable::Direct32(values)
            }
            64 => {
                let mut values = Vec::with_capacity(value_count);
                for _ in 0..value_count {
                    values.push(input.read_i64()? as u64);
                }
                Mutable::Direct64(values)
            }
            _ => {
                let mut blocks = Vec::with_capacity(long_count(value_count, bits_per_value));
                for _ in 0..long_count(value_count, bits_per_value) {
                    blocks.push(input.read_i64()? as u64);
                }
                Mutable::Packed64(Packed64 {
                    blocks,
                    value_count,
                    bits_per_value,
                    mask: max_value(bits_per_value),
                })
            }
        })
    }
}

/// Values of any width packed into longs, most significant bits first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packed64 {
    blocks: Vec<u64>,
    value_count: usize,
    bits_per_value: u32,
    mask: u64,
}

impl Packed64 {
    pub fn new(value_count: usize, bits_per_value: u32) -> Self {
        Packed64 {
            blocks: vec![0; long_count(value_count, bits_per_value)],
            value_count,
            bits_per_value,
            mask: max_value(bits_per_value),
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        let bit_pos = index as u64 * self.bits_per_value as u64;
        let element = (bit_pos >> 6) as usize;
        let end_bits = (bit_pos & 63) + self.bits_per_value as u64;
        if end_bits <= 64 {
            (self.blocks[element] >> (64 - end_bits)) & self.mask
        } else {
            let end_bits = end_bits - 64;
            ((self.blocks[element] << end_bits) | (self.blocks[element + 1] >> (64 - end_bits)))
                & self.mask
        }
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: u64) {
        let value = value & self.mask;
        let bit_pos = index as u64 * self.bits_per_value as u64;
        let element = (bit_pos >> 6) as usize;
        let end_bits = (bit_pos & 63) + self.bits_per_value as u64;
        if end_bits <= 64 {
            let shift = 64 - end_bits;
            self.blocks[element] = (self.blocks[element] & !(self.mask << shift)) | (value << shift);
        } else {
            let end_bits = end_bits - 64;
            self.blocks[element] =
                (self.blocks[element] & !(self.mask >> end_bits)) | (value >> end_bits);
            self.blocks[element + 1] = (self.blocks[element + 1] & (u64::MAX >> end_bits))
                | (value << (64 - end_bits));
        }
    }
}
