//! Sequential writer for the packed stream format.

use std::io::Write;

use crate::codec::codec_util;
use crate::error::{Result, SegmergeError};
use crate::storage::structured::StructWriter;
use crate::util::bit_util::max_value;
use crate::util::packed::{CODEC_NAME, STREAM_VERSION_START};

/// Appends values MSB-first into big-endian longs.
///
/// Missing values are zero-filled by [`finish`](PackedWriter::finish) so the
/// stream always holds exactly the declared count.
pub struct PackedWriter<'a, W: Write> {
    out: &'a mut StructWriter<W>,
    value_count: usize,
    bits_per_value: u32,
    pending: u64,
    pending_bit_pos: u32,
    written: usize,
}

impl<'a, W: Write> PackedWriter<'a, W> {
    pub(crate) fn new(
        out: &'a mut StructWriter<W>,
        value_count: usize,
        bits_per_value: u32,
    ) -> Result<Self> {
        if !(1..=64).contains(&bits_per_value) {
            return Err(SegmergeError::invalid_argument(format!(
                "bits_per_value must be in 1..=64, got {bits_per_value}"
            )));
        }
        codec_util::write_header(out, CODEC_NAME, STREAM_VERSION_START)?;
        out.write_vint(bits_per_value as i32)?;
        out.write_vint(value_count as i32)?;
        Ok(PackedWriter {
            out,
            value_count,
            bits_per_value,
            pending: 0,
            pending_bit_pos: 64,
            written: 0,
        })
    }

    pub fn add(&mut self, value: u64) -> Result<()> {
        debug_assert!(
            value <= max_value(self.bits_per_value),
            "value {value} does not fit in {} bits",
            self.bits_per_value
        );
        if self.written >= self.value_count {
            return Err(SegmergeError::illegal_state(format!(
                "already wrote {} values",
                self.value_count
            )));
        }
        let bits = self.bits_per_value;
        if self.pending_bit_pos >= bits {
            self.pending_bit_pos -= bits;
            if bits == 64 {
                self.pending = value;
            } else {
                self.pending |= value << self.pending_bit_pos;
            }
            if self.pending_bit_pos == 0 {
                self.out.write_i64(self.pending as i64)?;
                self.pending = 0;
                self.pending_bit_pos = 64;
            }
        } else {
            // Value straddles two longs.
            let overflow = bits - self.pending_bit_pos;
            self.pending |= value >> overflow;
            self.out.write_i64(self.pending as i64)?;
            self.pending_bit_pos = 64 - overflow;
            self.pending = value << self.pending_bit_pos;
        }
        self.written += 1;
        Ok(())
    }

    /// Zero-fill the remaining slots and flush the last partial long.
    pub fn finish(mut self) -> Result<()> {
        while self.written < self.value_count {
            self.add(0)?;
        }
        if self.pending_bit_pos != 64 {
            self.out.write_i64(self.pending as i64)?;
        }
        Ok(())
    }
}
