//! Read access to one segment.
//!
//! The per-format readers of a segment are opened once into a shared
//! [`SegmentCore`]. A [`SegmentReader`] pairs that core with a snapshot of
//! the segment's live docs, so applying deletes yields a new reader without
//! reopening any file.

use std::sync::Arc;

use crate::codec::{
    Codec, DocValuesProducer, FieldsProducer, NormsProducer, Posting, PointsReader,
    SegmentReadState, StoredFieldsReader, TermVectorField, TermVectorsReader,
};
use crate::error::{Result, SegmergeError};
use crate::index::document::StoredDocument;
use crate::index::field_infos::FieldInfos;
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::storage::{IOContext, Storage};
use crate::util::bits::{Bits, FixedBitSet};

/// The immutable, shareable readers of one segment.
#[derive(Debug)]
pub struct SegmentCore {
    pub segment_info: SegmentInfo,
    pub field_infos: FieldInfos,
    pub stored_fields: Arc<dyn StoredFieldsReader>,
    pub term_vectors: Option<Arc<dyn TermVectorsReader>>,
    pub postings: Option<Arc<dyn FieldsProducer>>,
    pub doc_values: Option<Arc<dyn DocValuesProducer>>,
    pub norms: Option<Arc<dyn NormsProducer>>,
    pub points: Option<Arc<dyn PointsReader>>,
}

impl SegmentCore {
    /// Open every reader the field infos call for. A failure drops the
    /// readers already opened.
    pub fn open(
        storage: &dyn Storage,
        codec: &dyn Codec,
        segment_info: &SegmentInfo,
        context: &IOContext,
    ) -> Result<Self> {
        if segment_info.codec != codec.name() {
            return Err(SegmergeError::invalid_argument(format!(
                "segment {} was written by codec {} but {} was given",
                segment_info.name,
                segment_info.codec,
                codec.name()
            )));
        }
        let field_infos = codec
            .field_infos_format()
            .read(storage, segment_info, context)?;
        let state = SegmentReadState::new(storage, segment_info, &field_infos, *context);

        let stored_fields = codec.stored_fields_format().fields_reader(&state)?;
        let term_vectors = match field_infos.has_vectors() {
            true => Some(codec.term_vectors_format().vectors_reader(&state)?),
            false => None,
        };
        let postings = match field_infos.has_postings() {
            true => Some(codec.postings_format().fields_producer(&state)?),
            false => None,
        };
        let doc_values = match field_infos.has_doc_values() {
            true => Some(codec.doc_values_format().fields_producer(&state)?),
            false => None,
        };
        let norms = match field_infos.has_norms() {
            true => Some(codec.norms_format().norms_producer(&state)?),
            false => None,
        };
        let points = match field_infos.has_point_values() {
            true => Some(codec.points_format().fields_reader(&state)?),
            false => None,
        };

        Ok(SegmentCore {
            segment_info: segment_info.clone(),
            field_infos,
            stored_fields,
            term_vectors,
            postings,
            doc_values,
            norms,
            points,
        })
    }

    /// Verify the checksums of every data file.
    pub fn check_integrity(&self) -> Result<()> {
        self.stored_fields.check_integrity()?;
        if let Some(term_vectors) = &self.term_vectors {
            term_vectors.check_integrity()?;
        }
        if let Some(postings) = &self.postings {
            postings.check_integrity()?;
        }
        if let Some(doc_values) = &self.doc_values {
            doc_values.check_integrity()?;
        }
        if let Some(norms) = &self.norms {
            norms.check_integrity()?;
        }
        if let Some(points) = &self.points {
            points.check_integrity()?;
        }
        Ok(())
    }
}

/// A segment's readers plus a point-in-time view of its live docs.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    core: Arc<SegmentCore>,
    info: SegmentCommitInfo,
    live_docs: Option<Arc<FixedBitSet>>,
}

impl SegmentReader {
    pub fn open(
        storage: &dyn Storage,
        codec: &dyn Codec,
        info: &SegmentCommitInfo,
        context: &IOContext,
    ) -> Result<Self> {
        let core = SegmentCore::open(storage, codec, &info.info, context)?;
        let live_docs = if info.has_deletions() {
            Some(Arc::new(
                codec.live_docs_format().read_live_docs(storage, info, context)?,
            ))
        } else {
            None
        };
        log::debug!(
            "opened segment {} ({} docs, {} deleted)",
            info.name(),
            info.max_doc(),
            info.del_count
        );
        Ok(SegmentReader {
            core: Arc::new(core),
            info: info.clone(),
            live_docs,
        })
    }

    /// A reader over the same files with different live docs.
    pub fn with_live_docs(&self, info: SegmentCommitInfo, live_docs: Option<FixedBitSet>) -> Self {
        debug_assert_eq!(info.name(), self.info.name());
        debug_assert_eq!(
            live_docs.as_ref().map_or(0, |l| l.len() - l.cardinality()),
            info.del_count as usize
        );
        SegmentReader {
            core: Arc::clone(&self.core),
            info,
            live_docs: live_docs.map(Arc::new),
        }
    }

    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    pub fn commit_info(&self) -> &SegmentCommitInfo {
        &self.info
    }

    pub fn segment_info(&self) -> &SegmentInfo {
        &self.core.segment_info
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn field_infos(&self) -> &FieldInfos {
        &self.core.field_infos
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc()
    }

    pub fn num_docs(&self) -> u32 {
        self.info.num_docs()
    }

    pub fn live_docs(&self) -> Option<&FixedBitSet> {
        self.live_docs.as_deref()
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.live_docs().is_none_or(|live| live.get(doc as usize))
    }

    pub fn document(&self, doc: u32) -> Result<StoredDocument> {
        self.core.stored_fields.document(doc)
    }

    /// Postings of `term` in `field`, deleted docs included.
    pub fn postings(&self, field: &str, term: &[u8]) -> Result<Option<Vec<Posting>>> {
        match &self.core.postings {
            Some(postings) => postings.postings(field, term),
            None => Ok(None),
        }
    }

    pub fn term_vectors(&self, doc: u32) -> Result<Vec<TermVectorField>> {
        match &self.core.term_vectors {
            Some(vectors) => vectors.get(doc),
            None => Ok(Vec::new()),
        }
    }

    pub fn doc_values(&self) -> Option<&dyn DocValuesProducer> {
        self.core.doc_values.as_deref()
    }

    pub fn norms(&self) -> Option<&dyn NormsProducer> {
        self.core.norms.as_deref()
    }

    pub fn points(&self) -> Option<&dyn PointsReader> {
        self.core.points.as_deref()
    }

    pub fn check_integrity(&self) -> Result<()> {
        self.core.check_integrity()
    }
}
