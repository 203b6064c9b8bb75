//! Stored fields (`.fdt` data, `.fdx` index).
//!
//! Each document in `.fdt` is a vint field count followed by its fields,
//! each a vint `number << 3 | type` and the value. `.fdx` holds the doc
//! count, the packed block size and the monotonic start pointers of every
//! document plus the end of the last one.

use std::any::Any;
use std::io::Cursor;
use std::sync::Arc;

use crate::codec::{
    SegmentReadState, SegmentWriteState, StoredFieldsFormat, StoredFieldsReader,
    StoredFieldsWriter, codec_util,
};
use crate::error::{Result, SegmergeError};
use crate::index::doc_id_merger::{DocIdMerger, MergedDoc};
use crate::index::document::{StoredDocument, StoredValue};
use crate::index::field_infos::{FieldInfo, FieldInfos};
use crate::index::merge_state::MergeState;
use crate::storage::StorageOutput;
use crate::storage::structured::{StructReader, StructWriter};
use crate::util::bits::Bits;
use crate::util::packed::{self, MonotonicBlockPackedReader, MonotonicBlockPackedWriter};

pub const DATA_EXTENSION: &str = "fdt";
pub const INDEX_EXTENSION: &str = "fdx";
pub const DATA_CODEC: &str = "Segmerge10StoredFieldsData";
pub const INDEX_CODEC: &str = "Segmerge10StoredFieldsIndex";
pub const VERSION_START: i32 = 0;
pub const VERSION_CURRENT: i32 = VERSION_START;

const TYPE_BITS: u32 = 3;
const TYPE_MASK: i32 = 0x7;
const STRING: i32 = 0;
const NUMERIC_LONG: i32 = 1;
const NUMERIC_DOUBLE: i32 = 2;
const BYTE_ARR: i32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct Segmerge10StoredFieldsFormat {
    block_size: usize,
}

impl Segmerge10StoredFieldsFormat {
    pub fn new(block_size: usize) -> Self {
        Segmerge10StoredFieldsFormat { block_size }
    }
}

impl StoredFieldsFormat for Segmerge10StoredFieldsFormat {
    fn fields_reader(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn StoredFieldsReader>> {
        Ok(Arc::new(Segmerge10StoredFieldsReader::open(state)?))
    }

    fn fields_writer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn StoredFieldsWriter>> {
        Ok(Box::new(Segmerge10StoredFieldsWriter::open(
            state,
            self.block_size,
        )?))
    }
}

pub struct Segmerge10StoredFieldsWriter {
    data: StructWriter<Box<dyn StorageOutput>>,
    index: StructWriter<Box<dyn StorageOutput>>,
    block_size: usize,
    doc_starts: Vec<i64>,
    doc_buffer: StructWriter<Vec<u8>>,
    num_buffered_fields: usize,
}

impl Segmerge10StoredFieldsWriter {
    fn open(state: &SegmentWriteState<'_>, block_size: usize) -> Result<Self> {
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
        Ok(Segmerge10StoredFieldsWriter {
            data,
            index,
            block_size,
            doc_starts: Vec::new(),
            doc_buffer: StructWriter::new(Vec::new()),
            num_buffered_fields: 0,
        })
    }

    fn write_raw_document(&mut self, raw: &[u8]) -> Result<()> {
        self.doc_starts.push(self.data.file_pointer() as i64);
        self.data.write_bytes(raw)
    }

    /// Copy docs `from..to` of a segment with identical field numbering in
    /// one write.
    fn copy_range(
        &mut self,
        reader: &Segmerge10StoredFieldsReader,
        from: u32,
        to: u32,
    ) -> Result<()> {
        let base = reader.doc_start(from);
        let delta = self.data.file_pointer() as i64 - base as i64;
        for doc in from..to {
            self.doc_starts.push(reader.doc_start(doc) as i64 + delta);
        }
        let end = reader.doc_start(to);
        self.data.write_bytes(&reader.data[base as usize..end as usize])
    }

    fn write_document(&mut self, field_infos: &FieldInfos, document: &StoredDocument) -> Result<()> {
        self.start_document()?;
        for (name, value) in &document.fields {
            let info = field_infos.field_info(name).ok_or_else(|| {
                SegmergeError::illegal_state(format!("stored field \"{name}\" has no field info"))
            })?;
            self.write_field(info, value)?;
        }
        self.finish_document()
    }
}

fn same_numbering(segment: &FieldInfos, merged: &FieldInfos) -> bool {
    segment.iter().all(|f| {
        merged
            .field_info(&f.name)
            .is_some_and(|m| m.number == f.number)
    })
}

impl StoredFieldsWriter for Segmerge10StoredFieldsWriter {
    fn start_document(&mut self) -> Result<()> {
        self.doc_buffer = StructWriter::new(Vec::new());
        self.num_buffered_fields = 0;
        Ok(())
    }

    fn write_field(&mut self, info: &FieldInfo, value: &StoredValue) -> Result<()> {
        let number = (info.number as i32) << TYPE_BITS;
        let buffer = &mut self.doc_buffer;
        match value {
            StoredValue::String(s) => {
                buffer.write_vint(number | STRING)?;
                buffer.write_string(s)?;
            }
            StoredValue::Long(v) => {
                buffer.write_vint(number | NUMERIC_LONG)?;
                buffer.write_zlong(*v)?;
            }
            StoredValue::Double(v) => {
                buffer.write_vint(number | NUMERIC_DOUBLE)?;
                buffer.write_i64(v.to_bits() as i64)?;
            }
            StoredValue::Bytes(b) => {
                buffer.write_vint(number | BYTE_ARR)?;
                buffer.write_vint(b.len() as i32)?;
                buffer.write_bytes(b)?;
            }
        }
        self.num_buffered_fields += 1;
        Ok(())
    }

    fn finish_document(&mut self) -> Result<()> {
        self.doc_starts.push(self.data.file_pointer() as i64);
        self.data.write_vint(self.num_buffered_fields as i32)?;
        let buffer = std::mem::replace(&mut self.doc_buffer, StructWriter::new(Vec::new()));
        self.data.write_bytes(&buffer.into_inner())?;
        self.num_buffered_fields = 0;
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
        self.index.write_vint(self.block_size as i32)?;
        {
            let mut starts = MonotonicBlockPackedWriter::new(&mut self.index, self.block_size)?;
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

    /// Segments written by this format with the same field numbers are
    /// copied as raw bytes unless the merge reorders documents.
    fn merge(mut self: Box<Self>, state: &MergeState) -> Result<u32> {
        let field_infos = state.merge_field_infos()?;
        let mut doc_count = 0u32;
        if state.needs_index_sort {
            for MergedDoc { segment, doc, .. } in DocIdMerger::new(state) {
                let document = state.stored_fields_readers[segment].document(doc)?;
                self.write_document(field_infos, &document)?;
                doc_count += 1;
            }
        } else {
            for (segment, reader) in state.stored_fields_readers.iter().enumerate() {
                let max_doc = state.max_docs[segment];
                let matching = reader
                    .as_any()
                    .downcast_ref::<Segmerge10StoredFieldsReader>()
                    .filter(|r| same_numbering(&r.field_infos, field_infos));
                let live_docs = state.live_docs[segment].as_ref();
                match (matching, live_docs) {
                    (Some(reader), None) => {
                        self.copy_range(reader, 0, max_doc)?;
                        doc_count += max_doc;
                    }
                    (Some(reader), Some(live)) => {
                        for doc in (0..max_doc).filter(|&d| live.get(d as usize)) {
                            self.write_raw_document(reader.raw_document(doc))?;
                            doc_count += 1;
                        }
                    }
                    (None, live) => {
                        for doc in 0..max_doc {
                            if live.is_some_and(|l| !l.get(doc as usize)) {
                                continue;
                            }
                            let document = reader.document(doc)?;
                            self.write_document(field_infos, &document)?;
                            doc_count += 1;
                        }
                    }
                }
            }
        }
        StoredFieldsWriter::finish(self, doc_count)?;
        Ok(doc_count)
    }
}

/// Loads the whole `.fdt` file and the start pointer index.
#[derive(Debug)]
pub struct Segmerge10StoredFieldsReader {
    resource: String,
    field_infos: FieldInfos,
    data: Vec<u8>,
    doc_starts: MonotonicBlockPackedReader,
    num_docs: u32,
}

impl Segmerge10StoredFieldsReader {
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

        Ok(Segmerge10StoredFieldsReader {
            resource: data_name,
            field_infos: state.field_infos.clone(),
            data,
            doc_starts,
            num_docs: num_docs as u32,
        })
    }

    fn doc_start(&self, doc: u32) -> u64 {
        self.doc_starts.get(doc as u64) as u64
    }

    fn raw_document(&self, doc: u32) -> &[u8] {
        let start = self.doc_start(doc) as usize;
        let end = self.doc_start(doc + 1) as usize;
        &self.data[start..end]
    }
}

impl StoredFieldsReader for Segmerge10StoredFieldsReader {
    fn document(&self, doc: u32) -> Result<StoredDocument> {
        if doc >= self.num_docs {
            return Err(SegmergeError::invalid_argument(format!(
                "doc {doc} out of bounds for {} docs",
                self.num_docs
            )));
        }
        let offset = self.doc_start(doc);
        let mut input = StructReader::new(Cursor::new(self.raw_document(doc)), self.resource.as_str());
        let num_fields = input.read_vint_len()?;
        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let code = input.read_vint()?;
            let number = (code as u32) >> TYPE_BITS;
            let info = self.field_infos.field_info_by_number(number).ok_or_else(|| {
                SegmergeError::corrupt(
                    format!("unknown field number {number}"),
                    self.resource.as_str(),
                    Some(offset),
                )
            })?;
            let value = match code & TYPE_MASK {
                STRING => StoredValue::String(input.read_string()?),
                NUMERIC_LONG => StoredValue::Long(input.read_zlong()?),
                NUMERIC_DOUBLE => StoredValue::Double(f64::from_bits(input.read_i64()? as u64)),
                BYTE_ARR => {
                    let len = input.read_vint_len()?;
                    StoredValue::Bytes(input.read_vec(len)?)
                }
                other => {
                    return Err(SegmergeError::corrupt(
                        format!("unknown stored value type {other}"),
                        self.resource.as_str(),
                        Some(offset),
                    ));
                }
            };
            fields.push((info.name.clone(), value));
        }
        Ok(StoredDocument { fields })
    }

    fn check_integrity(&self) -> Result<()> {
        let mut input = StructReader::new(Cursor::new(self.data.as_slice()), self.resource.as_str());
        codec_util::checksum_entire_file(&mut input).map(|_| ())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
