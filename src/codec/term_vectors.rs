//! Term vectors (`.tvd` data, `.tvx` index).
//!
//! Per document: vint field count, then per field its number, term count
//! and a positions flag, followed by the terms prefix-coded against the
//! previous term of the same field with their freqs and delta-coded
//! positions.

use std::io::Cursor;
use std::sync::Arc;

use crate::codec::{
    SegmentReadState, SegmentWriteState, TermVectorsFormat, TermVectorsReader, TermVectorsWriter,
    codec_util,
};
use crate::error::{Result, SegmergeError};
use crate::index::field_infos::FieldInfos;
use crate::storage::StorageOutput;
use crate::storage::structured::{StructReader, StructWriter};
use crate::util::packed::{self, MonotonicBlockPackedReader, MonotonicBlockPackedWriter};

pub const DATA_EXTENSION: &str = "tvd";
pub const INDEX_EXTENSION: &str = "tvx";
pub const DATA_CODEC: &str = "Segmerge10TermVectorsData";
pub const INDEX_CODEC: &str = "Segmerge10TermVectorsIndex";
pub const VERSION_START: i32 = 0;
pub const VERSION_CURRENT: i32 = VERSION_START;

const BLOCK_SIZE: usize = 64;

/// Term vector of one field of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermVectorField {
    pub field: String,
    /// Terms in unsigned byte order.
    pub terms: Vec<TermVectorTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermVectorTerm {
    pub term: Vec<u8>,
    pub freq: u32,
    /// Empty when positions are not recorded.
    pub positions: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Segmerge10TermVectorsFormat;

impl TermVectorsFormat for Segmerge10TermVectorsFormat {
    fn vectors_reader(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn TermVectorsReader>> {
        Ok(Arc::new(Segmerge10TermVectorsReader::open(state)?))
    }

    fn vectors_writer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn TermVectorsWriter>> {
        Ok(Box::new(Segmerge10TermVectorsWriter::open(state)?))
    }
}

pub struct Segmerge10TermVectorsWriter {
    data: StructWriter<Box<dyn StorageOutput>>,
    index: StructWriter<Box<dyn StorageOutput>>,
    doc_starts: Vec<i64>,
}

impl Segmerge10TermVectorsWriter {
    fn open(state: &SegmentWriteState<'_>) -> Result<Self> {
        let id = &state.segment_info.id;
        let mut data = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(DATA_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut data, DATA_CODEC, VERSION_CURRENT, id, "")?;
        let mut index = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(INDEX_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut index, INDEX_CODEC, VERSION_CURRENT, id, "")?;
        Ok(Segmerge10TermVectorsWriter {
            data,
            index,
            doc_starts: Vec::new(),
        })
    }
}

impl TermVectorsWriter for Segmerge10TermVectorsWriter {
    fn add_document(&mut self, field_infos: &FieldInfos, fields: &[TermVectorField]) -> Result<()> {
        let mut numbered = Vec::with_capacity(fields.len());
        for field in fields {
            let info = field_infos.field_info(&field.field).ok_or_else(|| {
                SegmergeError::illegal_state(format!(
                    "term vector field \"{}\" has no field info",
                    field.field
                ))
            })?;
            numbered.push((info.number, field));
        }
        numbered.sort_by_key(|(number, _)| *number);

        self.doc_starts.push(self.data.file_pointer() as i64);
        self.data.write_vint(numbered.len() as i32)?;
        for (number, field) in numbered {
            let has_positions = field.terms.iter().any(|t| !t.positions.is_empty());
            self.data.write_vint(number as i32)?;
            self.data.write_vint(field.terms.len() as i32)?;
            self.data.write_u8(has_positions as u8)?;
            let mut last_term: &[u8] = &[];
            for term in &field.terms {
                let prefix = last_term
                    .iter()
                    .zip(&term.term)
                    .take_while(|(a, b)| a == b)
                    .count();
                self.data.write_vint(prefix as i32)?;
                self.data.write_vint((term.term.len() - prefix) as i32)?;
                self.data.write_bytes(&term.term[prefix..])?;
                self.data.write_vint(term.freq as i32)?;
                if has_positions {
                    self.data.write_vint(term.positions.len() as i32)?;
                    let mut last = 0;
                    for &position in &term.positions {
                        self.data.write_vint((position - last) as i32)?;
                        last = position;
                    }
                }
                last_term = &term.term;
            }
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>, num_docs: u32) -> Result<()> {
        if self.doc_starts.len() != num_docs as usize {
            return Err(SegmergeError::illegal_state(format!(
                "wrote {} docs, finish called with num_docs={num_docs}",
                self.doc_starts.len()
            )));
        }
        let end = self.data.file_pointer() as i64;
        self.index.write_vint(num_docs as i32)?;
        self.index.write_vint(BLOCK_SIZE as i32)?;
        {
            let mut starts = MonotonicBlockPackedWriter::new(&mut self.index, BLOCK_SIZE)?;
            for &start in &self.doc_starts {
                starts.add(start)?;
            }
            starts.add(end)?;
            starts.finish()?;
        }
        codec_util::write_footer(&mut self.index)?;
        codec_util::write_footer(&mut self.data)?;
        let this = *self;
        this.data.close()?;
        this.index.close()
    }
}

#[derive(Debug)]
pub struct Segmerge10TermVectorsReader {
    resource: String,
    field_infos: FieldInfos,
    data: Vec<u8>,
    doc_starts: MonotonicBlockPackedReader,
    num_docs: u32,
}

impl Segmerge10TermVectorsReader {
    pub fn open(state: &SegmentReadState<'_>) -> Result<Self> {
        let id = &state.segment_info.id;
        let index_name = state.file_name(INDEX_EXTENSION);
        let mut index =
            StructReader::new(state.storage.open_input(&index_name, &state.context)?, index_name);
        codec_util::check_index_header(&mut index, INDEX_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        let num_docs = index.read_vint()?;
        if num_docs < 0 || num_docs as u32 != state.segment_info.max_doc {
            return Err(index.corrupt(format!(
                "index holds {num_docs} docs but the segment has {}",
                state.segment_info.max_doc
            )));
        }
        let block_size = index.read_vint_len()?;
        let doc_starts = MonotonicBlockPackedReader::open(
            &mut index,
            packed::VERSION_CURRENT,
            block_size,
            num_docs as u64 + 1,
        )?;
        codec_util::check_footer(&mut index)?;

        let data_name = state.file_name(DATA_EXTENSION);
        let mut input = StructReader::new(
            state.storage.open_input(&data_name, &state.context)?,
            data_name.clone(),
        );
        codec_util::check_index_header(&mut input, DATA_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        codec_util::retrieve_checksum(&mut input)?;
        let length = input.length()?;
        input.seek(0)?;
        let data = input.read_vec(length as usize)?;

        Ok(Segmerge10TermVectorsReader {
            resource: data_name,
            field_infos: state.field_infos.clone(),
            data,
            doc_starts,
            num_docs: num_docs as u32,
        })
    }
}

impl TermVectorsReader for Segmerge10TermVectorsReader {
    fn get(&self, doc: u32) -> Result<Vec<TermVectorField>> {
        if doc >= self.num_docs {
            return Err(SegmergeError::invalid_argument(format!(
                "doc {doc} out of bounds for {} docs",
                self.num_docs
            )));
        }
        let start = self.doc_starts.get(doc as u64) as usize;
        let end = self.doc_starts.get(doc as u64 + 1) as usize;
        let mut input =
            StructReader::new(Cursor::new(&self.data[start..end]), self.resource.as_str());
        let num_fields = input.read_vint_len()?;
        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let number = input.read_vint()? as u32;
            let name = match self.field_infos.field_info_by_number(number) {
                Some(info) => info.name.clone(),
                None => return Err(input.corrupt(format!("unknown field number {number}"))),
            };
            let num_terms = input.read_vint_len()?;
            let has_positions = input.read_u8()? != 0;
            let mut terms: Vec<TermVectorTerm> = Vec::with_capacity(num_terms);
            for _ in 0..num_terms {
                let prefix = input.read_vint_len()?;
                let suffix = input.read_vint_len()?;
                let mut term = match terms.last() {
                    Some(last) if prefix <= last.term.len() => last.term[..prefix].to_vec(),
                    None if prefix == 0 => Vec::new(),
                    _ => return Err(input.corrupt(format!("term prefix {prefix} too long"))),
                };
                term.extend_from_slice(&input.read_vec(suffix)?);
                let freq = input.read_vint()? as u32;
                let mut positions = Vec::new();
                if has_positions {
                    let count = input.read_vint_len()?;
                    let mut last = 0u32;
                    for _ in 0..count {
                        last += input.read_vint()? as u32;
                        positions.push(last);
                    }
                }
                terms.push(TermVectorTerm {
                    term,
                    freq,
                    positions,
                });
            }
            fields.push(TermVectorField { field: name, terms });
        }
        Ok(fields)
    }

    fn check_integrity(&self) -> Result<()> {
        let mut input = StructReader::new(Cursor::new(self.data.as_slice()), self.resource.as_str());
        codec_util::checksum_entire_file(&mut input).map(|_| ())
    }
}
