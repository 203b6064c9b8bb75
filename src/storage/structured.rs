//! Structured binary encoding on top of raw storage streams.
//!
//! Fixed-width integers are big-endian. Variable-length integers use seven
//! payload bits per byte with the high bit as a continuation flag. Every
//! byte written through a [`StructWriter`] also feeds a running CRC32 that
//! footers are computed from.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::{Result, SegmergeError};
use crate::storage::StorageOutput;
use crate::util::bit_util::{zigzag_decode_i32, zigzag_decode_i64, zigzag_encode_i32, zigzag_encode_i64};

/// Writer for the index file encodings.
pub struct StructWriter<W: Write> {
    inner: W,
    position: u64,
    hasher: crc32fast::Hasher,
}

impl<W: Write> StructWriter<W> {
    pub fn new(inner: W) -> Self {
        StructWriter {
            inner,
            position: 0,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Number of bytes written so far.
    pub fn file_pointer(&self) -> u64 {
        self.position
    }

    /// CRC32 of all bytes written so far.
    pub fn checksum(&self) -> u64 {
        self.hasher.clone().finalize() as u64
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_i16(&mut buf, value);
        self.write_bytes(&buf)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, value);
        self.write_bytes(&buf)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_i64(&mut buf, value);
        self.write_bytes(&buf)
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_i32(value.to_bits() as i32)
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_i64(value.to_bits() as i64)
    }

    /// Variable-length int. Negative values take five bytes.
    pub fn write_vint(&mut self, value: i32) -> Result<()> {
        let mut v = value as u32;
        let mut buf = [0u8; 5];
        let mut len = 0;
        while v & !0x7F != 0 {
            buf[len] = ((v & 0x7F) | 0x80) as u8;
            len += 1;
            v >>= 7;
        }
        buf[len] = v as u8;
        self.write_bytes(&buf[..=len])
    }

    /// Variable-length non-negative long, at most nine bytes.
    pub fn write_vlong(&mut self, value: i64) -> Result<()> {
        debug_assert!(value >= 0, "negative vlong {value}");
        self.write_unsigned_vlong(value as u64)
    }

    /// Zig-zag encoded int.
    pub fn write_zint(&mut self, value: i32) -> Result<()> {
        self.write_vint(zigzag_encode_i32(value) as i32)
    }

    /// Zig-zag encoded long, at most ten bytes.
    pub fn write_zlong(&mut self, value: i64) -> Result<()> {
        self.write_unsigned_vlong(zigzag_encode_i64(value))
    }

    fn write_unsigned_vlong(&mut self, mut v: u64) -> Result<()> {
        let mut buf = [0u8; 10];
        let mut len = 0;
        while v & !0x7F != 0 {
            buf[len] = ((v & 0x7F) | 0x80) as u8;
            len += 1;
            v >>= 7;
        }
        buf[len] = v as u8;
        self.write_bytes(&buf[..=len])
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_vint(value.len() as i32)?;
        self.write_bytes(value.as_bytes())
    }

    pub fn write_map_of_strings(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_vint(map.len() as i32)?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    pub fn write_set_of_strings(&mut self, set: &BTreeSet<String>) -> Result<()> {
        self.write_vint(set.len() as i32)?;
        for value in set {
            self.write_string(value)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl StructWriter<Box<dyn StorageOutput>> {
    /// Flush and close the underlying output.
    pub fn close(mut self) -> Result<()> {
        self.inner.flush()?;
        self.inner.close()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Reader for the index file encodings.
#[derive(Debug)]
pub struct StructReader<R: Read + Seek> {
    inner: R,
    resource: String,
}

impl<R: Read + Seek> StructReader<R> {
    pub fn new<S: Into<String>>(inner: R, resource: S) -> Self {
        StructReader {
            inner,
            resource: resource.into(),
        }
    }

    /// Name used when reporting corruption.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Build a corrupt-index error at the current position.
    pub fn corrupt<S: Into<String>>(&mut self, msg: S) -> SegmergeError {
        let offset = self.inner.stream_position().ok();
        SegmergeError::corrupt(msg, self.resource.clone(), offset)
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn skip_bytes(&mut self, count: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Current(count as i64))?;
        Ok(())
    }

    /// Total length of the underlying stream.
    pub fn length(&mut self) -> Result<u64> {
        let pos = self.inner.stream_position()?;
        let len = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        match self.inner.read_u8() {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(self.corrupt("read past EOF"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(self.corrupt(format!("read past EOF reading {} bytes", buf.len())))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_bytes(&mut buf)?;
        Ok(buf)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(BigEndian::read_i16(&buf))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(BigEndian::read_i32(&buf))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(BigEndian::read_i64(&buf))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_i32()? as u32))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    pub fn read_vint(&mut self) -> Result<i32> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let b = self.read_u8()?;
            if shift == 28 {
                if b & 0xF0 != 0 {
                    return Err(self.corrupt("invalid vint: too many bits"));
                }
                result |= (b as u32) << 28;
                return Ok(result as i32);
            }
            result |= ((b & 0x7F) as u32) << shift;
            if b & 0x80 == 0 {
                return Ok(result as i32);
            }
            shift += 7;
        }
    }

    /// Reads a vint that must be non-negative, e.g. a count or length.
    pub fn read_vint_len(&mut self) -> Result<usize> {
        let v = self.read_vint()?;
        if v < 0 {
            return Err(self.corrupt(format!("negative length {v}")));
        }
        Ok(v as usize)
    }

    pub fn read_vlong(&mut self) -> Result<i64> {
        self.read_vlong_impl(false)
    }

    pub fn read_zint(&mut self) -> Result<i32> {
        Ok(zigzag_decode_i32(self.read_vint()? as u32))
    }

    pub fn read_zlong(&mut self) -> Result<i64> {
        Ok(zigzag_decode_i64(self.read_vlong_impl(true)? as u64))
    }

    fn read_vlong_impl(&mut self, allow_negative: bool) -> Result<i64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.read_u8()?;
            if shift == 63 {
                // Tenth byte may only carry the sign bit.
                if b & 0xFE != 0 {
                    return Err(self.corrupt("invalid vlong: more than 64 bits"));
                }
                result |= (b as u64) << 63;
                return Ok(result as i64);
            }
            result |= ((b & 0x7F) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(result as i64);
            }
            shift += 7;
            if shift == 63 && !allow_negative {
                return Err(self.corrupt("invalid vlong: negative values disallowed"));
            }
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_vint_len()?;
        let bytes = self.read_vec(len)?;
        String::from_utf8(bytes).map_err(|e| self.corrupt(format!("invalid UTF-8 string: {e}")))
    }

    pub fn read_map_of_strings(&mut self) -> Result<BTreeMap<String, String>> {
        let count = self.read_vint_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    pub fn read_set_of_strings(&mut self) -> Result<BTreeSet<String>> {
        let count = self.read_vint_len()?;
        let mut set = BTreeSet::new();
        for _ in 0..count {
            set.insert(self.read_string()?);
        }
        Ok(set)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(bytes: Vec<u8>) -> StructReader<Cursor<Vec<u8>>> {
        StructReader::new(Cursor::new(bytes), "test")
    }

    #[test]
    fn test_vint_encoding_matches_reference_bytes() {
        let mut w = StructWriter::new(Vec::new());
        w.write_vint(0).unwrap();
        w.write_vint(127).unwrap();
        w.write_vint(128).unwrap();
        w.write_vint(16383).unwrap();
        assert_eq!(w.into_inner(), vec![0x00, 0x7F, 0x80, 0x01, 0xFF, 0x7F]);
    }

    #[test]
    fn test_fixed_width_big_endian() {
        let mut w = StructWriter::new(Vec::new());
        w.write_i32(0x01020304).unwrap();
        w.write_i16(-2).unwrap();
        assert_eq!(w.file_pointer(), 6);
        assert_eq!(w.into_inner(), vec![1, 2, 3, 4, 0xFF, 0xFE]);
    }

    #[test]
    fn test_mixed_values() {
        let mut w = StructWriter::new(Vec::new());
        w.write_vint(-1).unwrap();
        w.write_vlong(i64::MAX).unwrap();
        w.write_zlong(i64::MIN).unwrap();
        w.write_zlong(-3).unwrap();
        w.write_zint(-70000).unwrap();
        w.write_string("héllo").unwrap();
        w.write_i64(-42).unwrap();
        w.write_f32(1.5).unwrap();
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "v".to_string());
        w.write_map_of_strings(&map).unwrap();

        let mut r = reader(w.into_inner());
        assert_eq!(r.read_vint().unwrap(), -1);
        assert_eq!(r.read_vlong().unwrap(), i64::MAX);
        assert_eq!(r.read_zlong().unwrap(), i64::MIN);
        assert_eq!(r.read_zlong().unwrap(), -3);
        assert_eq!(r.read_zint().unwrap(), -70000);
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert_eq!(r.read_i64().unwrap(), -42);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_map_of_strings().unwrap(), map);
    }

    #[test]
    fn test_corrupt_vint() {
        let mut r = reader(vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let err = r.read_vint().unwrap_err();
        assert!(matches!(err, SegmergeError::CorruptIndex { offset: Some(5), .. }));
    }

    #[test]
    fn test_vlong_rejects_negative() {
        let mut w = StructWriter::new(Vec::new());
        w.write_zlong(i64::MIN).unwrap();
        let mut r = reader(w.into_inner());
        assert!(r.read_vlong().is_err());
    }

    #[test]
    fn test_eof_is_corruption() {
        let mut r = reader(vec![1, 2]);
        assert!(matches!(
            r.read_i32(),
            Err(SegmergeError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_checksum_tracks_bytes() {
        let mut w = StructWriter::new(Vec::new());
        w.write_bytes(b"123456789").unwrap();
        // Standard CRC-32 check value.
        assert_eq!(w.checksum(), 0xCBF43926);
    }
}
