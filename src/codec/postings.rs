//! Postings (`.tim` term dictionary, `.doc` postings lists).
//!
//! `.tim` holds, per field, an `fst` map from term to ordinal followed by
//! one entry per ordinal: the vlong delta of its postings start in `.doc`
//! and its doc freq. `.doc` holds every postings list as doc deltas, plus
//! freqs and delta-coded positions when the field records them.

use std::io::Cursor;
use std::sync::Arc;

use ahash::AHashMap;

use crate::codec::{
    FieldsConsumer, FieldsProducer, PostingsFormat, SegmentReadState, SegmentWriteState,
    codec_util,
};
use crate::error::{Result, SegmergeError};
use crate::index::field_infos::{FieldInfo, IndexOptions};
use crate::storage::StorageOutput;
use crate::storage::structured::{StructReader, StructWriter};

pub const TERMS_EXTENSION: &str = "tim";
pub const DOC_EXTENSION: &str = "doc";
pub const TERMS_CODEC: &str = "Segmerge10PostingsTerms";
pub const DOC_CODEC: &str = "Segmerge10PostingsDoc";
pub const VERSION_START: i32 = 0;
pub const VERSION_CURRENT: i32 = VERSION_START;

/// One document of a postings list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub doc: u32,
    /// 1 when the field does not record freqs.
    pub freq: u32,
    /// Empty when the field does not record positions.
    pub positions: Vec<u32>,
}

impl Posting {
    pub fn new(doc: u32, freq: u32, positions: Vec<u32>) -> Self {
        Posting {
            doc,
            freq,
            positions,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TermMeta {
    doc_fp: u64,
    doc_freq: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Segmerge10PostingsFormat;

impl PostingsFormat for Segmerge10PostingsFormat {
    fn fields_producer(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn FieldsProducer>> {
        Ok(Arc::new(Segmerge10PostingsReader::open(state)?))
    }

    fn fields_consumer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn FieldsConsumer>> {
        Ok(Box::new(Segmerge10PostingsWriter::open(state)?))
    }
}

struct PendingField {
    number: u32,
    index_options: IndexOptions,
    terms: fst::MapBuilder<Vec<u8>>,
    metas: Vec<TermMeta>,
}

struct FinishedField {
    number: u32,
    fst: Vec<u8>,
    metas: Vec<TermMeta>,
}

pub struct Segmerge10PostingsWriter {
    terms_out: StructWriter<Box<dyn StorageOutput>>,
    doc_out: StructWriter<Box<dyn StorageOutput>>,
    current: Option<PendingField>,
    fields: Vec<FinishedField>,
}

impl Segmerge10PostingsWriter {
    fn open(state: &SegmentWriteState<'_>) -> Result<Self> {
        let id = &state.segment_info.id;
        let mut terms_out = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(TERMS_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut terms_out, TERMS_CODEC, VERSION_CURRENT, id, "")?;
        let mut doc_out = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(DOC_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut doc_out, DOC_CODEC, VERSION_CURRENT, id, "")?;
        Ok(Segmerge10PostingsWriter {
            terms_out,
            doc_out,
            current: None,
            fields: Vec::new(),
        })
    }
}

impl FieldsConsumer for Segmerge10PostingsWriter {
    fn start_field(&mut self, info: &FieldInfo) -> Result<()> {
        if self.current.is_some() {
            return Err(SegmergeError::illegal_state("previous field was not finished"));
        }
        if !info.is_indexed() {
            return Err(SegmergeError::invalid_argument(format!(
                "field \"{}\" is not indexed",
                info.name
            )));
        }
        self.current = Some(PendingField {
            number: info.number,
            index_options: info.index_options,
            terms: fst::MapBuilder::memory(),
            metas: Vec::new(),
        });
        Ok(())
    }

    fn write_term(&mut self, term: &[u8], postings: &[Posting]) -> Result<()> {
        let field = self
            .current
            .as_mut()
            .ok_or_else(|| SegmergeError::illegal_state("write_term outside of a field"))?;
        if postings.is_empty() {
            return Err(SegmergeError::invalid_argument("empty postings list"));
        }
        let ord = field.metas.len() as u64;
        field.terms.insert(term, ord).map_err(|e| {
            SegmergeError::invalid_argument(format!("terms must be added in order: {e}"))
        })?;
        field.metas.push(TermMeta {
            doc_fp: self.doc_out.file_pointer(),
            doc_freq: postings.len() as u32,
        });

        let mut last_doc = None;
        for posting in postings {
            if last_doc.is_some_and(|last| posting.doc <= last) {
                return Err(SegmergeError::invalid_argument(format!(
                    "docs out of order: {} after {:?}",
                    posting.doc, last_doc
                )));
            }
            let delta = posting.doc - last_doc.map_or(0, |last| last + 1);
            self.doc_out.write_vint(delta as i32)?;
            last_doc = Some(posting.doc);
            if field.index_options.has_freqs() {
                self.doc_out.write_vint(posting.freq as i32)?;
            }
            if field.index_options.has_positions() {
                debug_assert_eq!(posting.positions.len(), posting.freq as usize);
                let mut last = 0;
                for &position in &posting.positions {
                    self.doc_out.write_vint((position - last) as i32)?;
                    last = position;
                }
            }
        }
        Ok(())
    }

    fn finish_field(&mut self) -> Result<()> {
        let field = self
            .current
            .take()
            .ok_or_else(|| SegmergeError::illegal_state("finish_field without start_field"))?;
        let fst = field
            .terms
            .into_inner()
            .map_err(|e| SegmergeError::other(format!("building term dictionary: {e}")))?;
        self.fields.push(FinishedField {
            number: field.number,
            fst,
            metas: field.metas,
        });
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if self.current.is_some() {
            self.finish_field()?;
        }
        let fields = std::mem::take(&mut self.fields);
        let out = &mut self.terms_out;
        out.write_vint(fields.len() as i32)?;
        for field in &fields {
            out.write_vint(field.number as i32)?;
            out.write_vint(field.metas.len() as i32)?;
            out.write_vlong(field.fst.len() as i64)?;
            out.write_bytes(&field.fst)?;
            let mut last_fp = 0;
            for meta in &field.metas {
                out.write_vlong((meta.doc_fp - last_fp) as i64)?;
                out.write_vint(meta.doc_freq as i32)?;
                last_fp = meta.doc_fp;
            }
        }
        codec_util::write_footer(&mut self.terms_out)?;
        codec_util::write_footer(&mut self.doc_out)?;
        let this = *self;
        this.terms_out.close()?;
        this.doc_out.close()
    }
}

#[derive(Debug)]
struct FieldTerms {
    index_options: IndexOptions,
    terms: fst::Map<Vec<u8>>,
    metas: Vec<TermMeta>,
}

/// Term dictionaries and postings of a segment, held in memory.
#[derive(Debug)]
pub struct Segmerge10PostingsReader {
    doc_resource: String,
    fields: AHashMap<String, FieldTerms>,
    doc_data: Vec<u8>,
}

impl Segmerge10PostingsReader {
    pub fn open(state: &SegmentReadState<'_>) -> Result<Self> {
        let id = &state.segment_info.id;
        let terms_name = state.file_name(TERMS_EXTENSION);
        let mut input =
            StructReader::new(state.storage.open_input(&terms_name, &state.context)?, terms_name);
        codec_util::check_index_header(&mut input, TERMS_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        let num_fields = input.read_vint_len()?;
        let mut fields = AHashMap::with_capacity(num_fields);
        for _ in 0..num_fields {
            let number = input.read_vint()? as u32;
            let info = match state.field_infos.field_info_by_number(number) {
                Some(info) => info,
                None => return Err(input.corrupt(format!("unknown field number {number}"))),
            };
            let num_terms = input.read_vint_len()?;
            let fst_len = input.read_vlong()? as usize;
            let fst_bytes = input.read_vec(fst_len)?;
            let terms = match fst::Map::new(fst_bytes) {
                Ok(terms) => terms,
                Err(e) => return Err(input.corrupt(format!("invalid term dictionary: {e}"))),
            };
            if terms.len() != num_terms {
                return Err(input.corrupt(format!(
                    "field {} declares {num_terms} terms but the dictionary holds {}",
                    info.name,
                    terms.len()
                )));
            }
            let mut metas = Vec::with_capacity(num_terms);
            let mut doc_fp = 0u64;
            for _ in 0..num_terms {
                doc_fp += input.read_vlong()? as u64;
                let doc_freq = input.read_vint()? as u32;
                metas.push(TermMeta { doc_fp, doc_freq });
            }
            fields.insert(
                info.name.clone(),
                FieldTerms {
                    index_options: info.index_options,
                    terms,
                    metas,
                },
            );
        }
        codec_util::check_footer(&mut input)?;

        let doc_name = state.file_name(DOC_EXTENSION);
        let mut doc_input = StructReader::new(
            state.storage.open_input(&doc_name, &state.context)?,
            doc_name.clone(),
        );
        codec_util::check_index_header(&mut doc_input, DOC_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        codec_util::retrieve_checksum(&mut doc_input)?;
        let length = doc_input.length()?;
        doc_input.seek(0)?;
        let doc_data = doc_input.read_vec(length as usize)?;

        Ok(Segmerge10PostingsReader {
            doc_resource: doc_name,
            fields,
            doc_data,
        })
    }
}

impl FieldsProducer for Segmerge10PostingsReader {
    fn terms(&self, field: &str) -> Option<&fst::Map<Vec<u8>>> {
        self.fields.get(field).map(|f| &f.terms)
    }

    fn postings_by_ord(&self, field: &str, ord: u64) -> Result<Vec<Posting>> {
        let terms = self
            .fields
            .get(field)
            .ok_or_else(|| SegmergeError::not_found(format!("no postings for field {field}")))?;
        let meta = terms.metas.get(ord as usize).ok_or_else(|| {
            SegmergeError::invalid_argument(format!("term ordinal {ord} out of range"))
        })?;
        let mut input = StructReader::new(Cursor::new(self.doc_data.as_slice()), self.doc_resource.as_str());
        input.seek(meta.doc_fp)?;
        let mut postings = Vec::with_capacity(meta.doc_freq as usize);
        let mut next_doc = 0u32;
        for _ in 0..meta.doc_freq {
            let doc = next_doc + input.read_vint()? as u32;
            next_doc = doc + 1;
            let freq = if terms.index_options.has_freqs() {
                input.read_vint()? as u32
            } else {
                1
            };
            let mut positions = Vec::new();
            if terms.index_options.has_positions() {
                positions.reserve(freq as usize);
                let mut last = 0u32;
                for _ in 0..freq {
                    last += input.read_vint()? as u32;
                    positions.push(last);
                }
            }
            postings.push(Posting {
                doc,
                freq,
                positions,
            });
        }
        Ok(postings)
    }

    fn check_integrity(&self) -> Result<()> {
        let mut input = StructReader::new(Cursor::new(self.doc_data.as_slice()), self.doc_resource.as_str());
        codec_util::checksum_entire_file(&mut input).map(|_| ())
    }
}
