//! Buffers documents in memory and flushes them as one segment.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::codec::{Codec, Posting, SegmentWriteState, TermVectorField, TermVectorTerm};
use crate::error::{Result, SegmergeError};
use crate::index::config::MergeConfig;
use crate::index::document::{Document, FieldValue, StoredValue};
use crate::index::field_infos::{
    DocValuesType, FieldInfo, FieldInfos, FieldInfosBuilder, FieldNumbers, IndexOptions,
};
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::index::sort::{IndexSort, LeafSortKeys, SortColumn, Sorter};
use crate::storage::tracking::TrackingStorage;
use crate::storage::{FlushInfo, IOContext, Storage};

/// Lowercased whitespace tokens of a text value.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().map(str::to_lowercase)
}

/// Accumulates documents for one new segment.
#[derive(Debug)]
pub struct SegmentWriter {
    name: String,
    field_infos: FieldInfosBuilder,
    index_sort: Option<IndexSort>,
    docs: Vec<Document>,
    ram_bytes_used: usize,
}

impl SegmentWriter {
    pub fn new(name: impl Into<String>, field_numbers: Arc<FieldNumbers>, config: &MergeConfig) -> Self {
        SegmentWriter {
            name: name.into(),
            field_infos: FieldInfosBuilder::new(field_numbers),
            index_sort: config.index_sort.clone(),
            docs: Vec::new(),
            ram_bytes_used: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_docs(&self) -> u32 {
        self.docs.len() as u32
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.ram_bytes_used
    }

    /// Buffer a document, recording its fields. A field may not change its
    /// doc values type or point shape, and single-valued doc values may
    /// appear once per document.
    pub fn add_document(&mut self, doc: Document) -> Result<()> {
        let mut doc_values_seen: Vec<&str> = Vec::new();
        for field in doc.fields() {
            if matches!(
                field.value,
                FieldValue::NumericDocValues(_)
                    | FieldValue::BinaryDocValues(_)
                    | FieldValue::SortedDocValues(_)
            ) {
                if doc_values_seen.contains(&field.name.as_str()) {
                    return Err(SegmergeError::invalid_argument(format!(
                        "DocValuesField \"{}\" appears more than once in this document",
                        field.name
                    )));
                }
                doc_values_seen.push(&field.name);
            }
            if let FieldValue::Point {
                num_dims,
                bytes_per_dim,
                packed,
            } = &field.value
            {
                if *num_dims == 0 || packed.len() != num_dims * bytes_per_dim {
                    return Err(SegmergeError::invalid_argument(format!(
                        "point field \"{}\" has {} bytes for {num_dims} dims of {bytes_per_dim} bytes",
                        field.name,
                        packed.len()
                    )));
                }
            }
        }

        for field in doc.fields() {
            let info = self.field_infos.get_or_add(&field.name)?;
            match &field.value {
                FieldValue::Text { term_vectors, .. } => {
                    info.update_indexing(IndexOptions::DocsAndFreqsAndPositions, *term_vectors, false);
                }
                FieldValue::Keyword { .. } => {
                    info.update_indexing(IndexOptions::Docs, false, true);
                }
                FieldValue::Stored(_) => {}
                FieldValue::NumericDocValues(_) => info.set_doc_values_type(DocValuesType::Numeric)?,
                FieldValue::BinaryDocValues(_) => info.set_doc_values_type(DocValuesType::Binary)?,
                FieldValue::SortedDocValues(_) => info.set_doc_values_type(DocValuesType::Sorted)?,
                FieldValue::Point {
                    num_dims,
                    bytes_per_dim,
                    ..
                } => info.set_point_dimensions(*num_dims, *num_dims, *bytes_per_dim)?,
            }
            let snapshot = info.clone();
            self.field_infos.register(&snapshot)?;
            self.ram_bytes_used += field.name.len() + value_bytes(&field.value);
        }
        self.docs.push(doc);
        Ok(())
    }

    /// Write every buffered document as a new segment. Files written before
    /// a failure are deleted again.
    pub fn flush(self, storage: &dyn Storage, codec: &dyn Codec) -> Result<SegmentCommitInfo> {
        let num_docs = self.num_docs();
        if num_docs == 0 {
            return Err(SegmergeError::illegal_state(format!(
                "segment {} has no documents to flush",
                self.name
            )));
        }
        let context = IOContext::flush(FlushInfo {
            num_docs,
            estimated_segment_size: self.ram_bytes_used as u64,
        });
        let field_infos = self.field_infos.finish()?;

        // order[new_doc] = buffered doc
        let order: Vec<u32> = match &self.index_sort {
            Some(sort) => {
                let keys = sort_keys(sort, &self.docs);
                match Sorter::new(sort).sort(&keys) {
                    Some(doc_map) => (0..num_docs).map(|d| doc_map.new_to_old(d)).collect(),
                    None => (0..num_docs).collect(),
                }
            }
            None => (0..num_docs).collect(),
        };

        let mut info = SegmentInfo::new(self.name.clone(), num_docs, codec.name())
            .with_index_sort(self.index_sort.clone());
        info.diagnostics.insert("source".to_string(), "flush".to_string());
        info.diagnostics
            .insert("segmerge.version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let tracking = TrackingStorage::new(storage);
        let flushed = FlushedDocs {
            docs: &self.docs,
            order: &order,
            field_infos: &field_infos,
        };
        let state = SegmentWriteState::new(&tracking, &info, &field_infos, context);
        if let Err(e) = flushed.write(codec, &state) {
            tracking.delete_created_files();
            return Err(e);
        }
        for file in tracking.created_files() {
            info.add_file(file);
        }
        info.write(storage, &context)?;
        log::debug!(
            "flushed segment {} with {num_docs} docs and {} fields",
            info.name,
            field_infos.len()
        );
        Ok(SegmentCommitInfo::new(info))
    }
}

fn value_bytes(value: &FieldValue) -> usize {
    match value {
        FieldValue::Text { text, .. } => text.len(),
        FieldValue::Keyword { value, .. } => value.len(),
        FieldValue::Stored(StoredValue::String(s)) => s.len(),
        FieldValue::Stored(StoredValue::Bytes(b)) => b.len(),
        FieldValue::Stored(_) | FieldValue::NumericDocValues(_) => 8,
        FieldValue::BinaryDocValues(b) | FieldValue::SortedDocValues(b) => b.len(),
        FieldValue::Point { packed, .. } => packed.len(),
    }
}

fn sort_keys(sort: &IndexSort, docs: &[Document]) -> LeafSortKeys {
    let columns = sort
        .fields
        .iter()
        .map(|field| {
            if field.field_type.is_numeric() {
                SortColumn::Numeric(
                    docs.iter()
                        .map(|doc| match doc.doc_value(&field.field) {
                            Some(FieldValue::NumericDocValues(v)) => Some(*v),
                            _ => None,
                        })
                        .collect(),
                )
            } else {
                SortColumn::Bytes(
                    docs.iter()
                        .map(|doc| match doc.doc_value(&field.field) {
                            Some(FieldValue::SortedDocValues(v)) => Some(v.clone()),
                            _ => None,
                        })
                        .collect(),
                )
            }
        })
        .collect();
    LeafSortKeys::from_columns(columns, docs.len() as u32)
}

/// Buffered documents in the order they are written.
struct FlushedDocs<'a> {
    docs: &'a [Document],
    order: &'a [u32],
    field_infos: &'a FieldInfos,
}

impl FlushedDocs<'_> {
    fn in_order(&self) -> impl Iterator<Item = (u32, &Document)> + '_ {
        self.order
            .iter()
            .enumerate()
            .map(|(new_doc, &old)| (new_doc as u32, &self.docs[old as usize]))
    }

    fn info(&self, name: &str) -> Result<&FieldInfo> {
        self.field_infos
            .field_info(name)
            .ok_or_else(|| SegmergeError::illegal_state(format!("field \"{name}\" was never added")))
    }

    fn write(&self, codec: &dyn Codec, state: &SegmentWriteState<'_>) -> Result<()> {
        self.write_stored_fields(codec, state)?;
        self.write_postings(codec, state)?;
        if self.field_infos.has_doc_values() {
            self.write_doc_values(codec, state)?;
        }
        if self.field_infos.has_point_values() {
            self.write_points(codec, state)?;
        }
        if self.field_infos.has_norms() {
            self.write_norms(codec, state)?;
        }
        if self.field_infos.has_vectors() {
            self.write_term_vectors(codec, state)?;
        }
        codec
            .field_infos_format()
            .write(state.storage, state.segment_info, self.field_infos, &state.context)
    }

    fn write_stored_fields(&self, codec: &dyn Codec, state: &SegmentWriteState<'_>) -> Result<()> {
        let mut writer = codec.stored_fields_format().fields_writer(state)?;
        for (_, doc) in self.in_order() {
            writer.start_document()?;
            for field in doc.fields() {
                let value = match &field.value {
                    FieldValue::Text {
                        text, stored: true, ..
                    } => StoredValue::String(text.clone()),
                    FieldValue::Keyword {
                        value,
                        stored: true,
                    } => StoredValue::String(value.clone()),
                    FieldValue::Stored(value) => value.clone(),
                    _ => continue,
                };
                writer.write_field(self.info(&field.name)?, &value)?;
            }
            writer.finish_document()?;
        }
        writer.finish(self.order.len() as u32)
    }

    fn write_postings(&self, codec: &dyn Codec, state: &SegmentWriteState<'_>) -> Result<()> {
        // field -> term -> postings in doc order
        let mut inverted: AHashMap<&str, BTreeMap<Vec<u8>, Vec<Posting>>> = AHashMap::new();
        for (new_doc, doc) in self.in_order() {
            let mut positions: AHashMap<&str, u32> = AHashMap::new();
            for field in doc.fields() {
                let tokens: Vec<String> = match &field.value {
                    FieldValue::Text { text, .. } => tokenize(text).collect(),
                    FieldValue::Keyword { value, .. } => vec![value.clone()],
                    _ => continue,
                };
                let terms = inverted.entry(field.name.as_str()).or_default();
                let position = positions.entry(field.name.as_str()).or_insert(0);
                for token in tokens {
                    let postings = terms.entry(token.into_bytes()).or_default();
                    match postings.last_mut() {
                        Some(last) if last.doc == new_doc => {
                            last.freq += 1;
                            last.positions.push(*position);
                        }
                        _ => postings.push(Posting::new(new_doc, 1, vec![*position])),
                    }
                    *position += 1;
                }
            }
        }

        let mut consumer = codec.postings_format().fields_consumer(state)?;
        for info in self.field_infos.iter().filter(|f| f.is_indexed()) {
            let Some(terms) = inverted.get_mut(info.name.as_str()) else {
                continue;
            };
            let has_freqs = info.index_options.has_freqs();
            let has_positions = info.index_options.has_positions();
            consumer.start_field(info)?;
            for (term, postings) in terms.iter_mut() {
                for posting in postings.iter_mut() {
                    if !has_positions {
                        posting.positions.clear();
                    }
                    if !has_freqs {
                        posting.freq = 1;
                    }
                }
                consumer.write_term(term, postings)?;
            }
            consumer.finish_field()?;
        }
        consumer.finish()
    }

    fn write_doc_values(&self, codec: &dyn Codec, state: &SegmentWriteState<'_>) -> Result<()> {
        let mut consumer = codec.doc_values_format().fields_consumer(state)?;
        for info in self.field_infos.iter().filter(|f| f.has_doc_values()) {
            let values = self.in_order().map(|(_, doc)| doc.doc_value(&info.name));
            match info.doc_values_type {
                DocValuesType::Numeric => {
                    let values: Vec<Option<i64>> = values
                        .map(|v| match v {
                            Some(FieldValue::NumericDocValues(n)) => Some(*n),
                            _ => None,
                        })
                        .collect();
                    consumer.add_numeric_field(info, &values)?;
                }
                DocValuesType::Binary | DocValuesType::Sorted => {
                    let values: Vec<Option<Vec<u8>>> = values
                        .map(|v| match v {
                            Some(FieldValue::BinaryDocValues(b))
                            | Some(FieldValue::SortedDocValues(b)) => Some(b.clone()),
                            _ => None,
                        })
                        .collect();
                    if info.doc_values_type == DocValuesType::Binary {
                        consumer.add_binary_field(info, &values)?;
                    } else {
                        consumer.add_sorted_field(info, &values)?;
                    }
                }
                DocValuesType::None => {}
            }
        }
        consumer.finish()
    }

    fn write_points(&self, codec: &dyn Codec, state: &SegmentWriteState<'_>) -> Result<()> {
        let mut writer = codec.points_format().fields_writer(state)?;
        for info in self.field_infos.iter().filter(|f| f.has_points()) {
            let mut points = Vec::new();
            for (new_doc, doc) in self.in_order() {
                for field in doc.fields().iter().filter(|f| f.name == info.name) {
                    if let FieldValue::Point { packed, .. } = &field.value {
                        points.push((packed.clone(), new_doc));
                    }
                }
            }
            writer.write_field(info, points)?;
        }
        writer.finish()
    }

    /// Norms are the token count of the field in each document.
    fn write_norms(&self, codec: &dyn Codec, state: &SegmentWriteState<'_>) -> Result<()> {
        let mut consumer = codec.norms_format().norms_consumer(state)?;
        for info in self.field_infos.iter().filter(|f| f.has_norms()) {
            let norms: Vec<Option<i64>> = self
                .in_order()
                .map(|(_, doc)| {
                    let mut length = None;
                    for field in doc.fields().iter().filter(|f| f.name == info.name) {
                        if let FieldValue::Text { text, .. } = &field.value {
                            *length.get_or_insert(0) += tokenize(text).count() as i64;
                        }
                    }
                    length
                })
                .collect();
            consumer.add_norms_field(info, &norms)?;
        }
        consumer.finish()
    }

    fn write_term_vectors(&self, codec: &dyn Codec, state: &SegmentWriteState<'_>) -> Result<()> {
        let mut writer = codec.term_vectors_format().vectors_writer(state)?;
        for (_, doc) in self.in_order() {
            let mut by_field: BTreeMap<&str, BTreeMap<Vec<u8>, Vec<u32>>> = BTreeMap::new();
            let mut positions: AHashMap<&str, u32> = AHashMap::new();
            for field in doc.fields() {
                let FieldValue::Text { text, .. } = &field.value else {
                    continue;
                };
                let position = positions.entry(field.name.as_str()).or_insert(0);
                let wants_vectors = matches!(
                    field.value,
                    FieldValue::Text {
                        term_vectors: true,
                        ..
                    }
                );
                for token in tokenize(text) {
                    if wants_vectors {
                        by_field
                            .entry(field.name.as_str())
                            .or_default()
                            .entry(token.into_bytes())
                            .or_default()
                            .push(*position);
                    }
                    *position += 1;
                }
            }
            let fields: Vec<TermVectorField> = by_field
                .into_iter()
                .map(|(name, terms)| TermVectorField {
                    field: name.to_string(),
                    terms: terms
                        .into_iter()
                        .map(|(term, positions)| TermVectorTerm {
                            term,
                            freq: positions.len() as u32,
                            positions,
                        })
                        .collect(),
                })
                .collect();
            writer.add_document(self.field_infos, &fields)?;
        }
        writer.finish(self.order.len() as u32)
    }
}
