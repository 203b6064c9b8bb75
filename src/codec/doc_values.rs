//! Doc values (`.dvm` metadata, `.dvd` data).
//!
//! The metadata file lists one entry per field and ends with a field
//! number of -1. Every entry points into the data file:
//!
//! * NUMERIC: block-packed values, zero where a doc has no value, plus an
//!   optional docs-with-field bit set.
//! * BINARY: concatenated bytes with monotonic start addresses, plus the
//!   same optional bit set.
//! * SORTED: the sorted unique terms followed by a packed stream of
//!   `ord + 1` per doc, 0 meaning no value.

use std::collections::BTreeSet;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use ahash::AHashMap;

use crate::codec::{
    DocValuesConsumer, DocValuesFormat, DocValuesProducer, SegmentReadState, SegmentWriteState,
    codec_util,
};
use crate::error::{Result, SegmergeError};
use crate::index::field_infos::{DocValuesType, FieldInfo};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::bit_util::unsigned_bits_required;
use crate::util::bits::{Bits, FixedBitSet};
use crate::util::packed::{
    self, BlockPackedReader, BlockPackedWriter, MonotonicBlockPackedReader,
    MonotonicBlockPackedWriter, Mutable,
};

pub const DATA_EXTENSION: &str = "dvd";
pub const META_EXTENSION: &str = "dvm";
pub const DATA_CODEC: &str = "Segmerge10DocValuesData";
pub const META_CODEC: &str = "Segmerge10DocValuesMetadata";
pub const VERSION_START: i32 = 0;
pub const VERSION_CURRENT: i32 = VERSION_START;

const NUMERIC: u8 = 1;
const BINARY: u8 = 2;
const SORTED: u8 = 3;

/// Every doc has a value, no bit set was written.
const ALL_LIVE: i64 = -1;

/// Per-document longs.
#[derive(Debug, Clone)]
pub struct NumericDocValues {
    values: BlockPackedReader,
    docs_with_field: Option<FixedBitSet>,
}

impl NumericDocValues {
    pub fn get(&self, doc: u32) -> Option<i64> {
        if doc as u64 >= self.values.size() {
            return None;
        }
        if self
            .docs_with_field
            .as_ref()
            .is_some_and(|docs| !docs.get(doc as usize))
        {
            return None;
        }
        Some(self.values.get(doc as u64))
    }

    pub fn size(&self) -> u32 {
        self.values.size() as u32
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.values.ram_bytes_used() + self.docs_with_field.as_ref().map_or(0, |d| d.len() / 8)
    }
}

/// Per-document byte strings.
#[derive(Debug, Clone)]
pub struct BinaryDocValues {
    addresses: MonotonicBlockPackedReader,
    bytes: Vec<u8>,
    docs_with_field: Option<FixedBitSet>,
}

impl BinaryDocValues {
    pub fn get(&self, doc: u32) -> Option<&[u8]> {
        if doc as u64 + 1 >= self.addresses.size() {
            return None;
        }
        if self
            .docs_with_field
            .as_ref()
            .is_some_and(|docs| !docs.get(doc as usize))
        {
            return None;
        }
        let start = self.addresses.get(doc as u64) as usize;
        let end = self.addresses.get(doc as u64 + 1) as usize;
        Some(&self.bytes[start..end])
    }
}

/// Per-document byte strings deduplicated into a sorted dictionary.
#[derive(Debug, Clone)]
pub struct SortedDocValues {
    /// `ord + 1` per doc, 0 where the doc has no value.
    ords: Mutable,
    terms: Vec<Vec<u8>>,
}

impl SortedDocValues {
    pub fn ord(&self, doc: u32) -> Option<u32> {
        if doc as usize >= self.ords.size() {
            return None;
        }
        match self.ords.get(doc as usize) {
            0 => None,
            ord => Some(ord as u32 - 1),
        }
    }

    pub fn get(&self, doc: u32) -> Option<&[u8]> {
        self.ord(doc).and_then(|ord| self.lookup_ord(ord))
    }

    pub fn lookup_ord(&self, ord: u32) -> Option<&[u8]> {
        self.terms.get(ord as usize).map(Vec::as_slice)
    }

    pub fn value_count(&self) -> usize {
        self.terms.len()
    }
}

fn write_docs_with_field<W: Write>(
    data: &mut StructWriter<W>,
    present: impl Iterator<Item = bool>,
    max_doc: usize,
) -> Result<i64> {
    let mut docs = FixedBitSet::new(max_doc);
    let mut all = true;
    for (doc, has_value) in present.enumerate() {
        if has_value {
            docs.set(doc);
        } else {
            all = false;
        }
    }
    if all {
        return Ok(ALL_LIVE);
    }
    let offset = data.file_pointer() as i64;
    for word in docs.to_words() {
        data.write_i64(word as i64)?;
    }
    Ok(offset)
}

fn read_docs_with_field<R: Read + Seek>(
    data: &mut StructReader<R>,
    offset: i64,
    max_doc: usize,
) -> Result<Option<FixedBitSet>> {
    if offset == ALL_LIVE {
        return Ok(None);
    }
    data.seek(offset as u64)?;
    let mut words = Vec::with_capacity(max_doc.div_ceil(64));
    for _ in 0..max_doc.div_ceil(64) {
        words.push(data.read_i64()? as u64);
    }
    Ok(Some(FixedBitSet::from_words(&words, max_doc)))
}

/// Write one numeric column; shared with norms.
pub(crate) fn write_numeric<D: Write, M: Write>(
    data: &mut StructWriter<D>,
    meta: &mut StructWriter<M>,
    values: &[Option<i64>],
    block_size: usize,
) -> Result<()> {
    let missing_offset =
        write_docs_with_field(data, values.iter().map(Option::is_some), values.len())?;
    let values_offset = data.file_pointer() as i64;
    {
        let mut writer = BlockPackedWriter::new(data, block_size)?;
        for value in values {
            writer.add(value.unwrap_or(0))?;
        }
        writer.finish()?;
    }
    meta.write_vint(values.len() as i32)?;
    meta.write_vint(block_size as i32)?;
    meta.write_i64(values_offset)?;
    meta.write_i64(missing_offset)
}

/// Read a column written by [`write_numeric`].
pub(crate) fn read_numeric<M: Read + Seek, D: Read + Seek>(
    meta: &mut StructReader<M>,
    data: &mut StructReader<D>,
) -> Result<NumericDocValues> {
    let count = meta.read_vint_len()?;
    let block_size = meta.read_vint_len()?;
    let values_offset = meta.read_i64()?;
    let missing_offset = meta.read_i64()?;
    let docs_with_field = read_docs_with_field(data, missing_offset, count)?;
    data.seek(values_offset as u64)?;
    let values = BlockPackedReader::open(data, packed::VERSION_CURRENT, block_size, count as u64)?;
    Ok(NumericDocValues {
        values,
        docs_with_field,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Segmerge10DocValuesFormat {
    block_size: usize,
}

impl Segmerge10DocValuesFormat {
    pub fn new(block_size: usize) -> Self {
        Segmerge10DocValuesFormat { block_size }
    }
}

impl DocValuesFormat for Segmerge10DocValuesFormat {
    fn fields_producer(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn DocValuesProducer>> {
        Ok(Arc::new(Segmerge10DocValuesProducer::open(state)?))
    }

    fn fields_consumer(
        &self,
        state: &SegmentWriteState<'_>,
    ) -> Result<Box<dyn DocValuesConsumer>> {
        Ok(Box::new(Segmerge10DocValuesConsumer::open(
            state,
            self.block_size,
        )?))
    }
}

pub struct Segmerge10DocValuesConsumer {
    data: StructWriter<Box<dyn StorageOutput>>,
    meta: StructWriter<Box<dyn StorageOutput>>,
    block_size: usize,
    max_doc: usize,
}

impl Segmerge10DocValuesConsumer {
    fn open(state: &SegmentWriteState<'_>, block_size: usize) -> Result<Self> {
        let id = &state.segment_info.id;
        let mut data = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(DATA_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut data, DATA_CODEC, VERSION_CURRENT, id, "")?;
        let mut meta = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(META_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut meta, META_CODEC, VERSION_CURRENT, id, "")?;
        Ok(Segmerge10DocValuesConsumer {
            data,
            meta,
            block_size,
            max_doc: state.segment_info.max_doc as usize,
        })
    }

    fn start_entry<T>(&mut self, info: &FieldInfo, kind: u8, values: &[T]) -> Result<()> {
        if values.len() != self.max_doc {
            return Err(SegmergeError::invalid_argument(format!(
                "field \"{}\" has {} values for {} docs",
                info.name,
                values.len(),
                self.max_doc
            )));
        }
        self.meta.write_vint(info.number as i32)?;
        self.meta.write_u8(kind)
    }
}

impl DocValuesConsumer for Segmerge10DocValuesConsumer {
    fn add_numeric_field(&mut self, info: &FieldInfo, values: &[Option<i64>]) -> Result<()> {
        self.start_entry(info, NUMERIC, values)?;
        write_numeric(&mut self.data, &mut self.meta, values, self.block_size)
    }

    fn add_binary_field(&mut self, info: &FieldInfo, values: &[Option<Vec<u8>>]) -> Result<()> {
        self.start_entry(info, BINARY, values)?;
        let missing_offset =
            write_docs_with_field(&mut self.data, values.iter().map(Option::is_some), self.max_doc)?;
        let bytes_offset = self.data.file_pointer() as i64;
        for value in values.iter().flatten() {
            self.data.write_bytes(value)?;
        }
        let addresses_offset = self.data.file_pointer() as i64;
        {
            let mut addresses = MonotonicBlockPackedWriter::new(&mut self.data, self.block_size)?;
            let mut address = 0i64;
            addresses.add(address)?;
            for value in values {
                address += value.as_ref().map_or(0, Vec::len) as i64;
                addresses.add(address)?;
            }
            addresses.finish()?;
        }
        self.meta.write_i64(missing_offset)?;
        self.meta.write_i64(bytes_offset)?;
        self.meta.write_vint(self.block_size as i32)?;
        self.meta.write_i64(addresses_offset)
    }

    fn add_sorted_field(&mut self, info: &FieldInfo, values: &[Option<Vec<u8>>]) -> Result<()> {
        self.start_entry(info, SORTED, values)?;
        let terms: Vec<&[u8]> = values
            .iter()
            .flatten()
            .map(Vec::as_slice)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let terms_offset = self.data.file_pointer() as i64;
        for term in &terms {
            self.data.write_vint(term.len() as i32)?;
            self.data.write_bytes(term)?;
        }
        let ords_offset = self.data.file_pointer() as i64;
        let bits = unsigned_bits_required(terms.len() as u64).max(1);
        let mut ords = packed::get_writer(&mut self.data, self.max_doc, bits)?;
        for value in values {
            let ord = match value {
                // Every value is in the dictionary built above.
                Some(v) => terms.binary_search(&v.as_slice()).map_or(0, |i| i as u64 + 1),
                None => 0,
            };
            ords.add(ord)?;
        }
        ords.finish()?;
        self.meta.write_vint(terms.len() as i32)?;
        self.meta.write_i64(terms_offset)?;
        self.meta.write_i64(ords_offset)
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.meta.write_vint(-1)?;
        codec_util::write_footer(&mut self.meta)?;
        codec_util::write_footer(&mut self.data)?;
        let this = *self;
        this.meta.close()?;
        this.data.close()
    }
}

#[derive(Debug)]
pub struct Segmerge10DocValuesProducer {
    numerics: AHashMap<String, NumericDocValues>,
    binaries: AHashMap<String, BinaryDocValues>,
    sorted: AHashMap<String, SortedDocValues>,
    data: Box<dyn StorageInput>,
}

impl Segmerge10DocValuesProducer {
    pub fn open(state: &SegmentReadState<'_>) -> Result<Self> {
        let id = &state.segment_info.id;
        let max_doc = state.segment_info.max_doc as usize;
        let meta_name = state.file_name(META_EXTENSION);
        let mut meta =
            StructReader::new(state.storage.open_input(&meta_name, &state.context)?, meta_name);
        codec_util::check_index_header(&mut meta, META_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;

        let data_name = state.file_name(DATA_EXTENSION);
        let data_input = state.storage.open_input(&data_name, &state.context)?;
        let mut data = StructReader::new(data_input.clone_input()?, data_name);
        codec_util::check_index_header(&mut data, DATA_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        codec_util::retrieve_checksum(&mut data)?;

        let mut producer = Segmerge10DocValuesProducer {
            numerics: AHashMap::new(),
            binaries: AHashMap::new(),
            sorted: AHashMap::new(),
            data: data_input,
        };
        loop {
            let number = meta.read_vint()?;
            if number == -1 {
                break;
            }
            let Some(info) = state.field_infos.field_info_by_number(number as u32) else {
                return Err(meta.corrupt(format!("invalid field number: {number}")));
            };
            let kind = meta.read_u8()?;
            let expected = match info.doc_values_type {
                DocValuesType::Numeric => NUMERIC,
                DocValuesType::Binary => BINARY,
                DocValuesType::Sorted => SORTED,
                DocValuesType::None => 0,
            };
            if kind != expected {
                return Err(meta.corrupt(format!(
                    "field {} has doc values type {:?} but entry type {kind}",
                    info.name, info.doc_values_type
                )));
            }
            let name = info.name.clone();
            match kind {
                NUMERIC => {
                    let values = read_numeric(&mut meta, &mut data)?;
                    producer.numerics.insert(name, values);
                }
                BINARY => {
                    let missing_offset = meta.read_i64()?;
                    let bytes_offset = meta.read_i64()?;
                    let block_size = meta.read_vint_len()?;
                    let addresses_offset = meta.read_i64()?;
                    let docs_with_field = read_docs_with_field(&mut data, missing_offset, max_doc)?;
                    data.seek(addresses_offset as u64)?;
                    let addresses = MonotonicBlockPackedReader::open(
                        &mut data,
                        packed::VERSION_CURRENT,
                        block_size,
                        max_doc as u64 + 1,
                    )?;
                    let len = if max_doc == 0 {
                        0
                    } else {
                        addresses.get(max_doc as u64) as usize
                    };
                    data.seek(bytes_offset as u64)?;
                    let bytes = data.read_vec(len)?;
                    producer.binaries.insert(
                        name,
                        BinaryDocValues {
                            addresses,
                            bytes,
                            docs_with_field,
                        },
                    );
                }
                _ => {
                    let num_terms = meta.read_vint_len()?;
                    let terms_offset = meta.read_i64()?;
                    let ords_offset = meta.read_i64()?;
                    data.seek(terms_offset as u64)?;
                    let mut terms = Vec::with_capacity(num_terms);
                    for _ in 0..num_terms {
                        let len = data.read_vint_len()?;
                        terms.push(data.read_vec(len)?);
                    }
                    data.seek(ords_offset as u64)?;
                    let ords = packed::get_reader(&mut data)?;
                    if ords.size() != max_doc {
                        return Err(data.corrupt(format!(
                            "sorted field {} has {} ords for {max_doc} docs",
                            info.name,
                            ords.size()
                        )));
                    }
                    producer.sorted.insert(name, SortedDocValues { ords, terms });
                }
            }
        }
        codec_util::check_footer(&mut meta)?;
        Ok(producer)
    }
}

impl DocValuesProducer for Segmerge10DocValuesProducer {
    fn numeric(&self, field: &str) -> Option<&NumericDocValues> {
        self.numerics.get(field)
    }

    fn binary(&self, field: &str) -> Option<&BinaryDocValues> {
        self.binaries.get(field)
    }

    fn sorted(&self, field: &str) -> Option<&SortedDocValues> {
        self.sorted.get(field)
    }

    fn check_integrity(&self) -> Result<()> {
        let input = self.data.clone_input()?;
        let name = input.name().to_string();
        codec_util::checksum_entire_file(&mut StructReader::new(input, name)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::field_infos::FieldInfos;
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::IOContext;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn infos() -> FieldInfos {
        let mut rank = FieldInfo::new("rank", 0);
        rank.doc_values_type = DocValuesType::Numeric;
        let mut payload = FieldInfo::new("payload", 1);
        payload.doc_values_type = DocValuesType::Binary;
        let mut tag = FieldInfo::new("tag", 2);
        tag.doc_values_type = DocValuesType::Sorted;
        FieldInfos::new(vec![rank, payload, tag]).unwrap()
    }

    #[test]
    fn test_write_and_read_all_types() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let info = SegmentInfo::new("_4", 5, "Segmerge10");
        let infos = infos();
        let numeric = vec![Some(-3), None, Some(1 << 40), Some(7), Some(7)];
        let binary = vec![Some(b"ab".to_vec()), Some(Vec::new()), None, Some(b"xyz".to_vec()), None];
        let sorted = vec![
            Some(b"red".to_vec()),
            Some(b"blue".to_vec()),
            None,
            Some(b"red".to_vec()),
            Some(b"green".to_vec()),
        ];

        let write_state = SegmentWriteState::new(&storage, &info, &infos, IOContext::DEFAULT);
        let mut consumer = Segmerge10DocValuesFormat::new(2)
            .fields_consumer(&write_state)
            .unwrap();
        consumer
            .add_numeric_field(infos.field_info("rank").unwrap(), &numeric)
            .unwrap();
        consumer
            .add_binary_field(infos.field_info("payload").unwrap(), &binary)
            .unwrap();
        consumer
            .add_sorted_field(infos.field_info("tag").unwrap(), &sorted)
            .unwrap();
        consumer.finish().unwrap();

        let read_state = SegmentReadState::new(&storage, &info, &infos, IOContext::READ);
        let producer = Segmerge10DocValuesFormat::new(2)
            .fields_producer(&read_state)
            .unwrap();
        let rank = producer.numeric("rank").unwrap();
        assert_eq!((0..5).map(|d| rank.get(d)).collect::<Vec<_>>(), numeric);
        let payload = producer.binary("payload").unwrap();
        assert_eq!(payload.get(0), Some(&b"ab"[..]));
        assert_eq!(payload.get(1), Some(&b""[..]));
        assert_eq!(payload.get(2), None);
        assert_eq!(payload.get(3), Some(&b"xyz"[..]));
        let tag = producer.sorted("tag").unwrap();
        assert_eq!(tag.value_count(), 3);
        assert_eq!(tag.ord(1), Some(0));
        assert_eq!(tag.ord(2), None);
        assert_eq!(tag.get(4), Some(&b"green"[..]));
        assert_eq!(tag.get(3), Some(&b"red"[..]));
        assert!(producer.numeric("tag").is_none());
        producer.check_integrity().unwrap();
    }

    #[test]
    fn test_value_count_must_match_max_doc() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let info = SegmentInfo::new("_4", 5, "Segmerge10");
        let infos = infos();
        let write_state = SegmentWriteState::new(&storage, &info, &infos, IOContext::DEFAULT);
        let mut consumer = Segmerge10DocValuesFormat::new(2)
            .fields_consumer(&write_state)
            .unwrap();
        let err = consumer
            .add_numeric_field(infos.field_info("rank").unwrap(), &[Some(1)])
            .unwrap_err();
        assert!(matches!(err, SegmergeError::InvalidArgument(_)));
    }
}
