//! Codec headers and checksum footers shared by every index file.

use std::io::{Read, Seek, Write};

use crate::error::{Result, SegmergeError};
use crate::storage::structured::{StructReader, StructWriter};

/// First four bytes of every codec header.
pub const CODEC_MAGIC: i32 = 0x3fd7_6c17;
/// First four bytes of every footer.
pub const FOOTER_MAGIC: i32 = !CODEC_MAGIC;
/// Magic, algorithm id and checksum.
pub const FOOTER_LENGTH: u64 = 16;
/// Length of a segment id in an index header.
pub const ID_LENGTH: usize = 16;

/// Write `magic, name, version`.
pub fn write_header<W: Write>(out: &mut StructWriter<W>, codec: &str, version: i32) -> Result<()> {
    if codec.len() >= 128 || !codec.is_ascii() {
        return Err(SegmergeError::invalid_argument(format!(
            "codec must be simple ASCII, less than 128 characters in length [got {codec}]"
        )));
    }
    out.write_i32(CODEC_MAGIC)?;
    out.write_string(codec)?;
    out.write_i32(version)
}

/// Header followed by the segment id and a short suffix.
pub fn write_index_header<W: Write>(
    out: &mut StructWriter<W>,
    codec: &str,
    version: i32,
    id: &[u8; ID_LENGTH],
    suffix: &str,
) -> Result<()> {
    if suffix.len() >= 256 || !suffix.is_ascii() {
        return Err(SegmergeError::invalid_argument(format!(
            "suffix must be simple ASCII, less than 256 characters in length [got {suffix}]"
        )));
    }
    write_header(out, codec, version)?;
    out.write_bytes(id)?;
    out.write_u8(suffix.len() as u8)?;
    out.write_bytes(suffix.as_bytes())
}

pub fn header_length(codec: &str) -> u64 {
    9 + codec.len() as u64
}

pub fn index_header_length(codec: &str, suffix: &str) -> u64 {
    header_length(codec) + ID_LENGTH as u64 + 1 + suffix.len() as u64
}

/// Validate a header and return the version found.
pub fn check_header<R: Read + Seek>(
    input: &mut StructReader<R>,
    codec: &str,
    min_version: i32,
    max_version: i32,
) -> Result<i32> {
    let magic = input.read_i32()?;
    if magic != CODEC_MAGIC {
        return Err(input.corrupt(format!(
            "codec header mismatch: actual header={magic:#x} vs expected header={CODEC_MAGIC:#x}"
        )));
    }
    check_header_no_magic(input, codec, min_version, max_version)
}

fn check_header_no_magic<R: Read + Seek>(
    input: &mut StructReader<R>,
    codec: &str,
    min_version: i32,
    max_version: i32,
) -> Result<i32> {
    let actual = input.read_string()?;
    if actual != codec {
        return Err(input.corrupt(format!(
            "codec mismatch: actual codec={actual} vs expected codec={codec}"
        )));
    }
    let version = input.read_i32()?;
    if version < min_version {
        return Err(SegmergeError::IndexFormatTooOld {
            resource: input.resource().to_string(),
            version,
            min: min_version,
            max: max_version,
        });
    }
    if version > max_version {
        return Err(SegmergeError::IndexFormatTooNew {
            resource: input.resource().to_string(),
            version,
            min: min_version,
            max: max_version,
        });
    }
    Ok(version)
}

/// Validate an index header, including the segment id and suffix.
pub fn check_index_header<R: Read + Seek>(
    input: &mut StructReader<R>,
    codec: &str,
    min_version: i32,
    max_version: i32,
    expected_id: &[u8; ID_LENGTH],
    expected_suffix: &str,
) -> Result<i32> {
    let version = check_header(input, codec, min_version, max_version)?;
    let mut id = [0u8; ID_LENGTH];
    input.read_bytes(&mut id)?;
    if &id != expected_id {
        return Err(input.corrupt(format!(
            "file mismatch, expected id={}, got={}",
            hex(expected_id),
            hex(&id)
        )));
    }
    let suffix_len = input.read_u8()? as usize;
    let suffix = input.read_vec(suffix_len)?;
    if suffix != expected_suffix.as_bytes() {
        return Err(input.corrupt(format!(
            "file mismatch, expected suffix={expected_suffix}, got={}",
            String::from_utf8_lossy(&suffix)
        )));
    }
    Ok(version)
}

/// Write the footer: magic, algorithm id, CRC32 of everything before it.
pub fn write_footer<W: Write>(out: &mut StructWriter<W>) -> Result<()> {
    out.write_i32(FOOTER_MAGIC)?;
    out.write_i32(0)?;
    let checksum = out.checksum();
    out.write_i64(checksum as i64)
}

fn validate_footer<R: Read + Seek>(input: &mut StructReader<R>) -> Result<u64> {
    let magic = input.read_i32()?;
    if magic != FOOTER_MAGIC {
        return Err(input.corrupt(format!(
            "codec footer mismatch: actual footer={magic:#x} vs expected footer={FOOTER_MAGIC:#x}"
        )));
    }
    let algorithm = input.read_i32()?;
    if algorithm != 0 {
        return Err(input.corrupt(format!("unknown checksum algorithm {algorithm}")));
    }
    let checksum = input.read_i64()? as u64;
    if checksum & 0xFFFF_FFFF_0000_0000 != 0 {
        return Err(input.corrupt(format!("illegal CRC-32 checksum: {checksum}")));
    }
    Ok(checksum)
}

/// Read the stored checksum without verifying it against the content.
pub fn retrieve_checksum<R: Read + Seek>(input: &mut StructReader<R>) -> Result<u64> {
    let length = input.length()?;
    if length < FOOTER_LENGTH {
        return Err(input.corrupt(format!("misplaced codec footer (file truncated?): length={length}")));
    }
    input.seek(length - FOOTER_LENGTH)?;
    validate_footer(input)
}

/// Check that the footer starts at the current position, ends the file,
/// and matches a checksum recomputed over every preceding byte.
pub fn check_footer<R: Read + Seek>(input: &mut StructReader<R>) -> Result<u64> {
    let pos = input.position()?;
    let length = input.length()?;
    if pos + FOOTER_LENGTH != length {
        return Err(input.corrupt(format!(
            "did not read all bytes from file: read {pos} vs size {length}"
        )));
    }
    checksum_entire_file(input)
}

/// Recompute the CRC32 of the whole file and compare it to the footer.
pub fn checksum_entire_file<R: Read + Seek>(input: &mut StructReader<R>) -> Result<u64> {
    let expected = retrieve_checksum(input)?;
    let length = input.length()?;
    input.seek(0)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut remaining = length - 8;
    let mut buf = vec![0u8; 8192];
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        input.read_bytes(&mut buf[..n])?;
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    let actual = hasher.finalize() as u64;
    input.seek(length)?;
    if actual != expected {
        return Err(input.corrupt(format!(
            "checksum failed (hardware problem?) : expected={expected:x} actual={actual:x}"
        )));
    }
    Ok(actual)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(bytes: Vec<u8>) -> StructReader<Cursor<Vec<u8>>> {
        StructReader::new(Cursor::new(bytes), "test.bin")
    }

    #[test]
    fn test_header_bytes_and_versions() {
        let mut out = StructWriter::new(Vec::new());
        write_header(&mut out, "BKD", 4).unwrap();
        assert_eq!(out.file_pointer(), header_length("BKD"));
        let bytes = out.into_inner();
        assert_eq!(&bytes[..4], &[0x3f, 0xd7, 0x6c, 0x17]);

        assert_eq!(check_header(&mut reader(bytes.clone()), "BKD", 0, 6).unwrap(), 4);
        assert!(matches!(
            check_header(&mut reader(bytes.clone()), "BKD", 5, 6),
            Err(SegmergeError::IndexFormatTooOld { version: 4, .. })
        ));
        assert!(matches!(
            check_header(&mut reader(bytes.clone()), "BKD", 0, 3),
            Err(SegmergeError::IndexFormatTooNew { version: 4, .. })
        ));
        assert!(matches!(
            check_header(&mut reader(bytes), "XYZ", 0, 6),
            Err(SegmergeError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_index_header() {
        let id = [7u8; ID_LENGTH];
        let mut out = StructWriter::new(Vec::new());
        write_index_header(&mut out, "Codec", 1, &id, "1").unwrap();
        assert_eq!(out.file_pointer(), index_header_length("Codec", "1"));
        let bytes = out.into_inner();
        assert_eq!(
            check_index_header(&mut reader(bytes.clone()), "Codec", 0, 1, &id, "1").unwrap(),
            1
        );
        assert!(check_index_header(&mut reader(bytes.clone()), "Codec", 0, 1, &[0u8; 16], "1").is_err());
        assert!(check_index_header(&mut reader(bytes), "Codec", 0, 1, &id, "2").is_err());
    }

    #[test]
    fn test_footer_detects_corruption() {
        let mut out = StructWriter::new(Vec::new());
        write_header(&mut out, "Foot", 0).unwrap();
        out.write_vint(12345).unwrap();
        write_footer(&mut out).unwrap();
        let mut bytes = out.into_inner();

        let mut input = reader(bytes.clone());
        check_header(&mut input, "Foot", 0, 0).unwrap();
        assert_eq!(input.read_vint().unwrap(), 12345);
        check_footer(&mut input).unwrap();

        let last_content = bytes.len() - FOOTER_LENGTH as usize - 1;
        bytes[last_content] ^= 0x01;
        let err = checksum_entire_file(&mut reader(bytes)).unwrap_err();
        assert!(err.to_string().contains("checksum failed"));
    }

    #[test]
    fn test_truncated_footer() {
        let err = retrieve_checksum(&mut reader(vec![1, 2, 3])).unwrap_err();
        assert!(err.is_format_error());
    }
}
