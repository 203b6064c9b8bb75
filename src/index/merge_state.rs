//! Everything one merge reads from.
//!
//! A [`MergeState`] holds the producers of every source segment, their live
//! docs and the doc maps that place each surviving document in the merged
//! segment. Docs of a segment are translated in two hops: the optional leaf
//! doc map moves an original doc id into the segment's sorted view, and the
//! segment's [`DocMap`] moves the view doc id into the merged segment.

use std::sync::Arc;

use crate::codec::{
    DocValuesProducer, FieldsProducer, NormsProducer, PointsReader, StoredFieldsReader,
    TermVectorsReader,
};
use crate::error::{Result, SegmergeError};
use crate::index::doc_map::{DocMap, build_deletion_doc_maps};
use crate::index::field_infos::FieldInfos;
use crate::index::segment_info::SegmentInfo;
use crate::index::segment_reader::SegmentReader;
use crate::index::sort::{IndexSort, LeafDocMap, LeafSortKeys, MultiSorter, SortedLeaf, Sorter};
use crate::util::bits::{Bits, FixedBitSet};

#[derive(Debug)]
pub struct MergeState {
    /// The segment being written. `max_doc` is the number of live docs
    /// across all sources.
    pub segment_info: SegmentInfo,
    merge_field_infos: Option<FieldInfos>,

    pub field_infos: Vec<FieldInfos>,
    pub stored_fields_readers: Vec<Arc<dyn StoredFieldsReader>>,
    pub term_vectors_readers: Vec<Option<Arc<dyn TermVectorsReader>>>,
    pub fields_producers: Vec<Option<Arc<dyn FieldsProducer>>>,
    pub doc_values_producers: Vec<Option<Arc<dyn DocValuesProducer>>>,
    pub norms_producers: Vec<Option<Arc<dyn NormsProducer>>>,
    pub points_readers: Vec<Option<Arc<dyn PointsReader>>>,

    pub max_docs: Vec<u32>,
    /// Live docs of each source, indexed by the source's own doc ids.
    pub live_docs: Vec<Option<FixedBitSet>>,
    /// Original to sorted-view doc ids, for sources that were not written in
    /// index sort order.
    pub leaf_doc_maps: Vec<Option<LeafDocMap>>,
    /// Sorted-view to merged doc ids.
    pub doc_maps: Vec<DocMap>,
    /// Whether merged order differs from plain concatenation.
    pub needs_index_sort: bool,
}

impl MergeState {
    /// Snapshot `readers` and compute the doc maps for a merge into
    /// `segment_info`, sorting by its index sort if it has one.
    pub fn new(readers: &[SegmentReader], mut segment_info: SegmentInfo) -> Result<Self> {
        let count = readers.len();
        let mut state = MergeState {
            segment_info: SegmentInfo::new("", 0, ""),
            merge_field_infos: None,
            field_infos: Vec::with_capacity(count),
            stored_fields_readers: Vec::with_capacity(count),
            term_vectors_readers: Vec::with_capacity(count),
            fields_producers: Vec::with_capacity(count),
            doc_values_producers: Vec::with_capacity(count),
            norms_producers: Vec::with_capacity(count),
            points_readers: Vec::with_capacity(count),
            max_docs: Vec::with_capacity(count),
            live_docs: Vec::with_capacity(count),
            leaf_doc_maps: Vec::with_capacity(count),
            doc_maps: Vec::new(),
            needs_index_sort: false,
        };

        let mut num_docs = 0u64;
        for reader in readers {
            let core = reader.core();
            state.field_infos.push(core.field_infos.clone());
            state.stored_fields_readers.push(Arc::clone(&core.stored_fields));
            state.term_vectors_readers.push(core.term_vectors.clone());
            state.fields_producers.push(core.postings.clone());
            state.doc_values_producers.push(core.doc_values.clone());
            state.norms_producers.push(core.norms.clone());
            state.points_readers.push(core.points.clone());
            state.max_docs.push(reader.max_doc());
            state.live_docs.push(reader.live_docs().cloned());
            num_docs += reader.num_docs() as u64;
        }
        if num_docs > u32::MAX as u64 {
            return Err(SegmergeError::invalid_argument(format!(
                "merged segment would have {num_docs} docs"
            )));
        }
        segment_info.max_doc = num_docs as u32;

        match segment_info.index_sort.clone() {
            Some(sort) => state.build_sorted_doc_maps(readers, &sort)?,
            None => {
                state.leaf_doc_maps = vec![None; count];
                state.doc_maps = build_deletion_doc_maps(&state.max_docs, &state.live_docs)?;
            }
        }
        state.segment_info = segment_info;
        Ok(state)
    }

    fn build_sorted_doc_maps(&mut self, readers: &[SegmentReader], sort: &IndexSort) -> Result<()> {
        let mut keys = Vec::with_capacity(readers.len());
        for reader in readers {
            let leaf_keys = LeafSortKeys::load(sort, reader.doc_values(), reader.max_doc())?;
            let leaf_doc_map = match &reader.segment_info().index_sort {
                Some(segment_sort) if segment_sort == sort => None,
                Some(segment_sort) => {
                    return Err(SegmergeError::invalid_argument(format!(
                        "index sort mismatch: merged segment has sort={sort:?} but {} has sort={segment_sort:?}",
                        reader.name()
                    )));
                }
                None => Sorter::new(sort).sort(&leaf_keys),
            };
            if leaf_doc_map.is_some() {
                log::debug!(target: "SM", "segment {} is not sorted, sorting it", reader.name());
            }
            self.leaf_doc_maps.push(leaf_doc_map);
            keys.push(leaf_keys);
        }

        let leaves: Vec<SortedLeaf<'_>> = keys
            .iter()
            .enumerate()
            .map(|(i, keys)| SortedLeaf {
                keys,
                doc_map: self.leaf_doc_maps[i].as_ref(),
                live_docs: self.live_docs[i].as_ref(),
            })
            .collect();
        match MultiSorter::sort(sort, &leaves) {
            Some(doc_maps) => {
                self.doc_maps = doc_maps;
                self.needs_index_sort = true;
            }
            None if self.leaf_doc_maps.iter().any(Option::is_some) => {
                // Concatenation of the sorted views, so deletions have to be
                // looked up in view order.
                let view_live_docs: Vec<Option<FixedBitSet>> = self
                    .live_docs
                    .iter()
                    .zip(&self.leaf_doc_maps)
                    .map(|(live, leaf_map)| match (live, leaf_map) {
                        (Some(live), Some(leaf_map)) => {
                            let mut view = FixedBitSet::new(live.len());
                            for view_doc in 0..leaf_map.size() {
                                if live.get(leaf_map.new_to_old(view_doc as u32) as usize) {
                                    view.set(view_doc);
                                }
                            }
                            Some(view)
                        }
                        (live, _) => live.clone(),
                    })
                    .collect();
                self.doc_maps = build_deletion_doc_maps(&self.max_docs, &view_live_docs)?;
                self.needs_index_sort = true;
            }
            None => {
                self.doc_maps = build_deletion_doc_maps(&self.max_docs, &self.live_docs)?;
            }
        }
        Ok(())
    }

    /// Field infos of the merged segment, set once they are merged.
    pub fn merge_field_infos(&self) -> Result<&FieldInfos> {
        self.merge_field_infos
            .as_ref()
            .ok_or_else(|| SegmergeError::illegal_state("merged field infos are not built yet"))
    }

    pub fn set_merge_field_infos(&mut self, field_infos: FieldInfos) {
        self.merge_field_infos = Some(field_infos);
    }

    pub fn num_segments(&self) -> usize {
        self.max_docs.len()
    }

    /// Merged doc id of `doc`, an original doc id of source `segment`.
    /// `None` when the doc is deleted.
    pub fn map_doc(&self, segment: usize, doc: u32) -> Option<u32> {
        let view_doc = match &self.leaf_doc_maps[segment] {
            Some(leaf_map) => leaf_map.old_to_new(doc),
            None => doc,
        };
        self.doc_maps[segment].get(view_doc)
    }

    /// Original doc id of the doc at `view_doc` in the sorted view of
    /// `segment`.
    pub fn original_doc(&self, segment: usize, view_doc: u32) -> u32 {
        match &self.leaf_doc_maps[segment] {
            Some(leaf_map) => leaf_map.new_to_old(view_doc),
            None => view_doc,
        }
    }

    pub fn ram_bytes_used(&self) -> usize {
        let doc_maps: usize = self.doc_maps.iter().map(DocMap::ram_bytes_used).sum();
        let leaf_maps: usize = self
            .leaf_doc_maps
            .iter()
            .flatten()
            .map(LeafDocMap::ram_bytes_used)
            .sum();
        doc_maps + leaf_maps
    }
}
