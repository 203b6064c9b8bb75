//! Codecs.
//!
//! A [`Codec`] bundles one format per kind of segment file. Each format
//! opens a read side (a producer or reader) and a write side (a consumer or
//! writer). Write sides also know how to merge: the default `merge` methods
//! read every source segment through the producers in a [`MergeState`] and
//! write the documents back in merged order, so a format only overrides
//! `merge` when it can do better, such as copying raw bytes.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use fst::Streamer;

use crate::bkd::{BkdReader, PointCollector};
use crate::error::{Result, SegmergeError};
use crate::index::config::MergeConfig;
use crate::index::doc_id_merger::{DocIdMerger, MergedDoc};
use crate::index::document::{StoredDocument, StoredValue};
use crate::index::field_infos::{DocValuesType, FieldInfo, FieldInfos};
use crate::index::merge_state::MergeState;
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo, segment_file_name};
use crate::storage::{IOContext, Storage};
use crate::util::bits::FixedBitSet;

pub mod codec_util;
pub mod doc_values;
pub mod field_infos_format;
pub mod live_docs;
pub mod norms;
pub mod points;
pub mod postings;
pub mod stored_fields;
pub mod term_vectors;

pub use doc_values::{
    BinaryDocValues, NumericDocValues, Segmerge10DocValuesFormat, SortedDocValues,
};
pub use field_infos_format::Segmerge10FieldInfosFormat;
pub use live_docs::Segmerge10LiveDocsFormat;
pub use norms::Segmerge10NormsFormat;
pub use points::Segmerge10PointsFormat;
pub use postings::{Posting, Segmerge10PostingsFormat};
pub use stored_fields::Segmerge10StoredFieldsFormat;
pub use term_vectors::{Segmerge10TermVectorsFormat, TermVectorField, TermVectorTerm};

/// Everything a format needs to write its files for one segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentWriteState<'a> {
    pub storage: &'a dyn Storage,
    pub segment_info: &'a SegmentInfo,
    pub field_infos: &'a FieldInfos,
    pub context: IOContext,
}

impl<'a> SegmentWriteState<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        segment_info: &'a SegmentInfo,
        field_infos: &'a FieldInfos,
        context: IOContext,
    ) -> Self {
        SegmentWriteState {
            storage,
            segment_info,
            field_infos,
            context,
        }
    }

    pub fn file_name(&self, ext: &str) -> String {
        segment_file_name(&self.segment_info.name, "", ext)
    }
}

/// Everything a format needs to open its files for one segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentReadState<'a> {
    pub storage: &'a dyn Storage,
    pub segment_info: &'a SegmentInfo,
    pub field_infos: &'a FieldInfos,
    pub context: IOContext,
}

impl<'a> SegmentReadState<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        segment_info: &'a SegmentInfo,
        field_infos: &'a FieldInfos,
        context: IOContext,
    ) -> Self {
        SegmentReadState {
            storage,
            segment_info,
            field_infos,
            context,
        }
    }

    pub fn file_name(&self, ext: &str) -> String {
        segment_file_name(&self.segment_info.name, "", ext)
    }
}

fn missing_field(name: &str) -> SegmergeError {
    SegmergeError::illegal_state(format!("field \"{name}\" is missing from the merged field infos"))
}

pub trait StoredFieldsFormat: Send + Sync + Debug {
    fn fields_reader(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn StoredFieldsReader>>;
    fn fields_writer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn StoredFieldsWriter>>;
}

pub trait StoredFieldsReader: Send + Sync + Debug {
    fn document(&self, doc: u32) -> Result<StoredDocument>;
    fn check_integrity(&self) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

pub trait StoredFieldsWriter: Send {
    fn start_document(&mut self) -> Result<()>;
    fn write_field(&mut self, info: &FieldInfo, value: &StoredValue) -> Result<()>;
    fn finish_document(&mut self) -> Result<()>;
    /// Write indexes and footers. `num_docs` must match the documents
    /// written.
    fn finish(self: Box<Self>, num_docs: u32) -> Result<()>;

    /// Copy every live document in merged order and return the count.
    fn merge(mut self: Box<Self>, state: &MergeState) -> Result<u32> {
        let field_infos = state.merge_field_infos()?;
        let mut doc_count = 0;
        for MergedDoc { segment, doc, .. } in DocIdMerger::new(state) {
            let document = state.stored_fields_readers[segment].document(doc)?;
            self.start_document()?;
            for (name, value) in &document.fields {
                let info = field_infos.field_info(name).ok_or_else(|| missing_field(name))?;
                self.write_field(info, value)?;
            }
            self.finish_document()?;
            doc_count += 1;
        }
        self.finish(doc_count)?;
        Ok(doc_count)
    }
}

pub trait TermVectorsFormat: Send + Sync + Debug {
    fn vectors_reader(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn TermVectorsReader>>;
    fn vectors_writer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn TermVectorsWriter>>;
}

pub trait TermVectorsReader: Send + Sync + Debug {
    /// Vectors of one document, fields in number order.
    fn get(&self, doc: u32) -> Result<Vec<TermVectorField>>;
    fn check_integrity(&self) -> Result<()>;
}

pub trait TermVectorsWriter: Send {
    fn add_document(&mut self, field_infos: &FieldInfos, fields: &[TermVectorField]) -> Result<()>;
    fn finish(self: Box<Self>, num_docs: u32) -> Result<()>;

    fn merge(mut self: Box<Self>, state: &MergeState) -> Result<u32> {
        let field_infos = state.merge_field_infos()?;
        let mut doc_count = 0;
        for MergedDoc { segment, doc, .. } in DocIdMerger::new(state) {
            let fields = match &state.term_vectors_readers[segment] {
                Some(reader) => reader.get(doc)?,
                None => Vec::new(),
            };
            self.add_document(field_infos, &fields)?;
            doc_count += 1;
        }
        self.finish(doc_count)?;
        Ok(doc_count)
    }
}

pub trait PostingsFormat: Send + Sync + Debug {
    fn fields_producer(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn FieldsProducer>>;
    fn fields_consumer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn FieldsConsumer>>;
}

pub trait FieldsProducer: Send + Sync + Debug {
    /// Term dictionary of a field, mapping each term to its ordinal.
    fn terms(&self, field: &str) -> Option<&fst::Map<Vec<u8>>>;

    fn postings_by_ord(&self, field: &str, ord: u64) -> Result<Vec<Posting>>;

    fn postings(&self, field: &str, term: &[u8]) -> Result<Option<Vec<Posting>>> {
        match self.terms(field).and_then(|terms| terms.get(term)) {
            Some(ord) => self.postings_by_ord(field, ord).map(Some),
            None => Ok(None),
        }
    }

    fn check_integrity(&self) -> Result<()>;
}

pub trait FieldsConsumer: Send {
    fn start_field(&mut self, info: &FieldInfo) -> Result<()>;
    /// Terms arrive in unsigned byte order, postings in doc order.
    fn write_term(&mut self, term: &[u8], postings: &[Posting]) -> Result<()>;
    fn finish_field(&mut self) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;

    /// Union the term dictionaries of every source segment and write each
    /// term's remapped postings.
    fn merge(mut self: Box<Self>, state: &MergeState) -> Result<()> {
        let field_infos = state.merge_field_infos()?;
        for info in field_infos.iter().filter(|f| f.is_indexed()) {
            let mut sources = Vec::new();
            for (segment, producer) in state.fields_producers.iter().enumerate() {
                if let Some(terms) = producer.as_ref().and_then(|p| p.terms(&info.name)) {
                    sources.push((segment, terms));
                }
            }
            if sources.is_empty() {
                continue;
            }

            self.start_field(info)?;
            let mut op = fst::map::OpBuilder::new();
            for (_, terms) in &sources {
                op.push(terms.stream());
            }
            let mut union = op.union();
            let mut merged = Vec::new();
            while let Some((term, ords)) = union.next() {
                merged.clear();
                for ord in ords {
                    let segment = sources[ord.index].0;
                    let Some(producer) = &state.fields_producers[segment] else {
                        continue;
                    };
                    for posting in producer.postings_by_ord(&info.name, ord.value)? {
                        if let Some(new_doc) = state.map_doc(segment, posting.doc) {
                            merged.push(Posting {
                                doc: new_doc,
                                ..posting
                            });
                        }
                    }
                }
                if merged.is_empty() {
                    continue;
                }
                merged.sort_by_key(|p| p.doc);
                self.write_term(term, &merged)?;
            }
            self.finish_field()?;
        }
        self.finish()
    }
}

pub trait DocValuesFormat: Send + Sync + Debug {
    fn fields_producer(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn DocValuesProducer>>;
    fn fields_consumer(&self, state: &SegmentWriteState<'_>)
    -> Result<Box<dyn DocValuesConsumer>>;
}

pub trait DocValuesProducer: Send + Sync + Debug {
    fn numeric(&self, field: &str) -> Option<&NumericDocValues>;
    fn binary(&self, field: &str) -> Option<&BinaryDocValues>;
    fn sorted(&self, field: &str) -> Option<&SortedDocValues>;
    fn check_integrity(&self) -> Result<()>;
}

pub trait DocValuesConsumer: Send {
    /// One entry per document, `None` where the document has no value.
    fn add_numeric_field(&mut self, info: &FieldInfo, values: &[Option<i64>]) -> Result<()>;
    fn add_binary_field(&mut self, info: &FieldInfo, values: &[Option<Vec<u8>>]) -> Result<()>;
    fn add_sorted_field(&mut self, info: &FieldInfo, values: &[Option<Vec<u8>>]) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;

    fn merge(mut self: Box<Self>, state: &MergeState) -> Result<()> {
        let field_infos = state.merge_field_infos()?;
        let max_doc = state.segment_info.max_doc as usize;
        for info in field_infos.iter() {
            let producer = |segment: usize| state.doc_values_producers[segment].as_deref();
            match info.doc_values_type {
                DocValuesType::None => {}
                DocValuesType::Numeric => {
                    let mut values = vec![None; max_doc];
                    for d in DocIdMerger::new(state) {
                        values[d.new_doc as usize] = producer(d.segment)
                            .and_then(|p| p.numeric(&info.name))
                            .and_then(|v| v.get(d.doc));
                    }
                    self.add_numeric_field(info, &values)?;
                }
                DocValuesType::Binary => {
                    let mut values = vec![None; max_doc];
                    for d in DocIdMerger::new(state) {
                        values[d.new_doc as usize] = producer(d.segment)
                            .and_then(|p| p.binary(&info.name))
                            .and_then(|v| v.get(d.doc))
                            .map(<[u8]>::to_vec);
                    }
                    self.add_binary_field(info, &values)?;
                }
                DocValuesType::Sorted => {
                    let mut values = vec![None; max_doc];
                    for d in DocIdMerger::new(state) {
                        values[d.new_doc as usize] = producer(d.segment)
                            .and_then(|p| p.sorted(&info.name))
                            .and_then(|v| v.get(d.doc))
                            .map(<[u8]>::to_vec);
                    }
                    self.add_sorted_field(info, &values)?;
                }
            }
        }
        self.finish()
    }
}

pub trait NormsFormat: Send + Sync + Debug {
    fn norms_producer(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn NormsProducer>>;
    fn norms_consumer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn NormsConsumer>>;
}

pub trait NormsProducer: Send + Sync + Debug {
    fn norms(&self, field: &str) -> Option<&NumericDocValues>;
    fn check_integrity(&self) -> Result<()>;
}

pub trait NormsConsumer: Send {
    fn add_norms_field(&mut self, info: &FieldInfo, values: &[Option<i64>]) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;

    fn merge(mut self: Box<Self>, state: &MergeState) -> Result<()> {
        let field_infos = state.merge_field_infos()?;
        let max_doc = state.segment_info.max_doc as usize;
        for info in field_infos.iter().filter(|f| f.has_norms()) {
            let mut values = vec![None; max_doc];
            for d in DocIdMerger::new(state) {
                values[d.new_doc as usize] = state.norms_producers[d.segment]
                    .as_ref()
                    .and_then(|p| p.norms(&info.name))
                    .and_then(|v| v.get(d.doc));
            }
            self.add_norms_field(info, &values)?;
        }
        self.finish()
    }
}

pub trait PointsFormat: Send + Sync + Debug {
    fn fields_reader(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn PointsReader>>;
    fn fields_writer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn PointsWriter>>;
}

pub trait PointsReader: Send + Sync + Debug {
    fn tree(&self, field: &str) -> Option<&BkdReader>;
    fn check_integrity(&self) -> Result<()>;
}

pub trait PointsWriter: Send {
    /// Write one field's points, given as `(packed value, doc)` pairs in any
    /// order.
    fn write_field(&mut self, info: &FieldInfo, points: Vec<(Vec<u8>, u32)>) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;

    /// Re-read every source tree, remap docs and rebuild the trees.
    fn merge(mut self: Box<Self>, state: &MergeState) -> Result<()> {
        let field_infos = state.merge_field_infos()?;
        for info in field_infos.iter().filter(|f| f.has_points()) {
            let mut points = Vec::new();
            for (segment, reader) in state.points_readers.iter().enumerate() {
                let Some(tree) = reader.as_ref().and_then(|r| r.tree(&info.name)) else {
                    continue;
                };
                let mut collector = PointCollector::default();
                tree.intersect(&mut collector)?;
                for (doc, value) in collector.points {
                    if let Some(new_doc) = state.map_doc(segment, doc) {
                        points.push((value, new_doc));
                    }
                }
            }
            self.write_field(info, points)?;
        }
        self.finish()
    }
}

pub trait FieldInfosFormat: Send + Sync + Debug {
    fn read(
        &self,
        storage: &dyn Storage,
        segment_info: &SegmentInfo,
        context: &IOContext,
    ) -> Result<FieldInfos>;

    fn write(
        &self,
        storage: &dyn Storage,
        segment_info: &SegmentInfo,
        field_infos: &FieldInfos,
        context: &IOContext,
    ) -> Result<()>;
}

pub trait LiveDocsFormat: Send + Sync + Debug {
    /// Live docs of the generation recorded in `info`.
    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        context: &IOContext,
    ) -> Result<FixedBitSet>;

    /// Write `live_docs` as generation `info.next_del_gen()`. The caller
    /// advances the generation once this succeeds.
    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        live_docs: &FixedBitSet,
        info: &SegmentCommitInfo,
        new_del_count: u32,
        context: &IOContext,
    ) -> Result<String>;

    /// Name of the live docs file of the generation recorded in `info`.
    fn file_name(&self, info: &SegmentCommitInfo) -> Option<String>;
}

/// A set of formats, one per kind of segment file.
pub trait Codec: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn stored_fields_format(&self) -> &dyn StoredFieldsFormat;
    fn term_vectors_format(&self) -> &dyn TermVectorsFormat;
    fn postings_format(&self) -> &dyn PostingsFormat;
    fn doc_values_format(&self) -> &dyn DocValuesFormat;
    fn norms_format(&self) -> &dyn NormsFormat;
    fn points_format(&self) -> &dyn PointsFormat;
    fn field_infos_format(&self) -> &dyn FieldInfosFormat;
    fn live_docs_format(&self) -> &dyn LiveDocsFormat;
}

pub const SEGMERGE10_CODEC_NAME: &str = "Segmerge10";

/// The codec every segment of this crate is written with.
#[derive(Debug, Clone)]
pub struct Segmerge10Codec {
    stored_fields: Segmerge10StoredFieldsFormat,
    term_vectors: Segmerge10TermVectorsFormat,
    postings: Segmerge10PostingsFormat,
    doc_values: Segmerge10DocValuesFormat,
    norms: Segmerge10NormsFormat,
    points: Segmerge10PointsFormat,
    field_infos: Segmerge10FieldInfosFormat,
    live_docs: Segmerge10LiveDocsFormat,
}

impl Segmerge10Codec {
    pub fn new() -> Self {
        Self::from_config(&MergeConfig::default())
    }

    /// Codec writing block sizes and point trees as configured.
    pub fn from_config(config: &MergeConfig) -> Self {
        Segmerge10Codec {
            stored_fields: Segmerge10StoredFieldsFormat::new(config.packed_block_size),
            term_vectors: Segmerge10TermVectorsFormat,
            postings: Segmerge10PostingsFormat,
            doc_values: Segmerge10DocValuesFormat::new(config.packed_block_size),
            norms: Segmerge10NormsFormat::new(config.packed_block_size),
            points: Segmerge10PointsFormat::new(config.max_points_in_leaf_node, config.bkd_version),
            field_infos: Segmerge10FieldInfosFormat,
            live_docs: Segmerge10LiveDocsFormat,
        }
    }
}

impl Default for Segmerge10Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for Segmerge10Codec {
    fn name(&self) -> &str {
        SEGMERGE10_CODEC_NAME
    }

    fn stored_fields_format(&self) -> &dyn StoredFieldsFormat {
        &self.stored_fields
    }

    fn term_vectors_format(&self) -> &dyn TermVectorsFormat {
        &self.term_vectors
    }

    fn postings_format(&self) -> &dyn PostingsFormat {
        &self.postings
    }

    fn doc_values_format(&self) -> &dyn DocValuesFormat {
        &self.doc_values
    }

    fn norms_format(&self) -> &dyn NormsFormat {
        &self.norms
    }

    fn points_format(&self) -> &dyn PointsFormat {
        &self.points
    }

    fn field_infos_format(&self) -> &dyn FieldInfosFormat {
        &self.field_infos
    }

    fn live_docs_format(&self) -> &dyn LiveDocsFormat {
        &self.live_docs
    }
}
