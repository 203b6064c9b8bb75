//! Doc id encodings inside leaf blocks.
//!
//! Since [`VERSION_COMPRESSED_DOC_IDS`](super::VERSION_COMPRESSED_DOC_IDS)
//! a leaf's doc ids are preceded by one byte naming the encoding: `0` for
//! sorted ids stored as vint deltas, `24` for three bytes per id and `32`
//! for plain ints. Older trees store plain ints with no marker.

use std::io::{Read, Seek, Write};

use crate::error::Result;
use crate::storage::structured::{StructReader, StructWriter};

const SORTED_DELTAS: u8 = 0;
const BITS_24: u8 = 24;
const BITS_32: u8 = 32;

/// Write `doc_ids` with the most compact marker-prefixed encoding.
pub fn write_doc_ids<W: Write>(out: &mut StructWriter<W>, doc_ids: &[u32]) -> Result<()> {
    let sorted = doc_ids.windows(2).all(|w| w[0] <= w[1]);
    if sorted {
        out.write_u8(SORTED_DELTAS)?;
        let mut previous = 0;
        for &doc in doc_ids {
            out.write_vint((doc - previous) as i32)?;
            previous = doc;
        }
        return Ok(());
    }

    let max = doc_ids.iter().fold(0u32, |acc, &doc| acc | doc);
    if max <= 0xFF_FFFF {
        out.write_u8(BITS_24)?;
        for &doc in doc_ids {
            out.write_i16((doc >> 8) as u16 as i16)?;
            out.write_u8(doc as u8)?;
        }
    } else {
        out.write_u8(BITS_32)?;
        for &doc in doc_ids {
            out.write_i32(doc as i32)?;
        }
    }
    Ok(())
}

/// Plain big-endian ints, the layout of the oldest trees.
pub fn write_doc_ids32<W: Write>(out: &mut StructWriter<W>, doc_ids: &[u32]) -> Result<()> {
    for &doc in doc_ids {
        out.write_i32(doc as i32)?;
    }
    Ok(())
}

/// Read `count` marker-prefixed doc ids, appending them to `doc_ids`.
pub fn read_ints<R: Read + Seek>(
    input: &mut StructReader<R>,
    count: usize,
    doc_ids: &mut Vec<u32>,
) -> Result<()> {
    match input.read_u8()? {
        SORTED_DELTAS => {
            let mut doc = 0u32;
            for _ in 0..count {
                doc = doc.wrapping_add(input.read_vint()? as u32);
                doc_ids.push(doc);
            }
        }
        BITS_24 => {
            for _ in 0..count {
                let high = input.read_i16()? as u16 as u32;
                let low = input.read_u8()? as u32;
                doc_ids.push((high << 8) | low);
            }
        }
        BITS_32 => read_ints32(input, count, doc_ids)?,
        bpv => {
            return Err(input.corrupt(format!("Unsupported number of bits per value: {bpv}")));
        }
    }
    Ok(())
}

/// Read `count` plain ints.
pub fn read_ints32<R: Read + Seek>(
    input: &mut StructReader<R>,
    count: usize,
    doc_ids: &mut Vec<u32>,
) -> Result<()> {
    for _ in 0..count {
        doc_ids.push(input.read_i32()? as u32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(doc_ids: &[u32]) -> Vec<u8> {
        let mut out = StructWriter::new(Vec::new());
        write_doc_ids(&mut out, doc_ids).unwrap();
        out.into_inner()
    }

    fn decode(bytes: Vec<u8>, count: usize) -> Vec<u32> {
        let mut input = StructReader::new(Cursor::new(bytes), "docs");
        let mut docs = Vec::new();
        read_ints(&mut input, count, &mut docs).unwrap();
        docs
    }

    #[test]
    fn test_sorted_uses_deltas() {
        let docs = [3, 3, 7, 1000, 1001];
        let bytes = encode(&docs);
        assert_eq!(bytes[0], SORTED_DELTAS);
        assert_eq!(bytes.len(), 1 + 4 + 2);
        assert_eq!(decode(bytes, docs.len()), docs);
    }

    #[test]
    fn test_unsorted_widths() {
        let small = [9, 2, 0xFF_FFFF, 4];
        let bytes = encode(&small);
        assert_eq!(bytes[0], BITS_24);
        assert_eq!(bytes.len(), 1 + 3 * small.len());
        assert_eq!(decode(bytes, small.len()), small);

        let large = [0x0100_0000, 5, 1];
        let bytes = encode(&large);
        assert_eq!(bytes[0], BITS_32);
        assert_eq!(decode(bytes, large.len()), large);
    }

    #[test]
    fn test_unknown_marker_is_corrupt() {
        let mut input = StructReader::new(Cursor::new(vec![17u8, 0, 0]), "docs");
        let err = read_ints(&mut input, 1, &mut Vec::new()).unwrap_err();
        assert!(err.is_format_error());
    }
}
