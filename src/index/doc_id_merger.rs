//! Walks the surviving documents of a merge in merged order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::index::merge_state::MergeState;

/// One document as it moves into the merged segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedDoc {
    pub segment: usize,
    /// Doc id in the source segment.
    pub doc: u32,
    pub new_doc: u32,
}

enum Order {
    /// Segments one after another, each in doc id order.
    Concatenated { segment: usize, doc: u32 },
    /// Heap of `(new_doc, segment, view_doc)`, smallest merged doc first.
    Sorted(BinaryHeap<Reverse<(u32, usize, u32)>>),
}

/// Iterator over [`MergedDoc`]s, skipping deleted docs. Merged doc ids come
/// out strictly increasing.
pub struct DocIdMerger<'a> {
    state: &'a MergeState,
    order: Order,
}

impl<'a> DocIdMerger<'a> {
    pub fn new(state: &'a MergeState) -> Self {
        let order = if state.needs_index_sort {
            let mut heap = BinaryHeap::with_capacity(state.num_segments());
            for segment in 0..state.num_segments() {
                if let Some(entry) = next_in_view(state, segment, 0) {
                    heap.push(Reverse(entry));
                }
            }
            Order::Sorted(heap)
        } else {
            Order::Concatenated { segment: 0, doc: 0 }
        };
        DocIdMerger { state, order }
    }
}

/// First live doc at or after `from` in the sorted view of `segment`.
fn next_in_view(state: &MergeState, segment: usize, from: u32) -> Option<(u32, usize, u32)> {
    let doc_map = &state.doc_maps[segment];
    (from..state.max_docs[segment])
        .find_map(|view_doc| doc_map.get(view_doc).map(|new_doc| (new_doc, segment, view_doc)))
}

impl Iterator for DocIdMerger<'_> {
    type Item = MergedDoc;

    fn next(&mut self) -> Option<MergedDoc> {
        let state = self.state;
        match &mut self.order {
            Order::Concatenated { segment, doc } => {
                while *segment < state.num_segments() {
                    while *doc < state.max_docs[*segment] {
                        let current = *doc;
                        *doc += 1;
                        if let Some(new_doc) = state.map_doc(*segment, current) {
                            return Some(MergedDoc {
                                segment: *segment,
                                doc: current,
                                new_doc,
                            });
                        }
                    }
                    *segment += 1;
                    *doc = 0;
                }
                None
            }
            Order::Sorted(heap) => {
                let Reverse((new_doc, segment, view_doc)) = heap.pop()?;
                if let Some(next) = next_in_view(state, segment, view_doc + 1) {
                    heap.push(Reverse(next));
                }
                Some(MergedDoc {
                    segment,
                    doc: state.original_doc(segment, view_doc),
                    new_doc,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Segmerge10Codec;
    use crate::index::config::MergeConfig;
    use crate::index::document::Document;
    use crate::index::field_infos::FieldNumbers;
    use crate::index::segment_info::SegmentInfo;
    use crate::index::segment_reader::SegmentReader;
    use crate::index::segment_writer::SegmentWriter;
    use crate::index::sort::{IndexSort, SortField, SortFieldType};
    use crate::storage::IOContext;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::util::bits::FixedBitSet;

    fn readers(storage: &MemoryStorage, segments: &[&[i64]]) -> Vec<SegmentReader> {
        let codec = Segmerge10Codec::new();
        let numbers = FieldNumbers::new();
        segments
            .iter()
            .enumerate()
            .map(|(i, ranks)| {
                let mut writer =
                    SegmentWriter::new(format!("_{i}"), numbers.clone(), &MergeConfig::default());
                for &rank in *ranks {
                    writer
                        .add_document(Document::new().add_numeric_doc_value("rank", rank))
                        .unwrap();
                }
                let info = writer.flush(storage, &codec).unwrap();
                SegmentReader::open(storage, &codec, &info, &IOContext::READ).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_concatenated_order_skips_deleted() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut sources = readers(&storage, &[&[0, 0, 0], &[0, 0]]);
        let mut live = FixedBitSet::new_all_set(3);
        live.clear(0);
        let mut info = sources[0].commit_info().clone();
        info.del_count = 1;
        sources[0] = sources[0].with_live_docs(info, Some(live));

        let state = MergeState::new(&sources, SegmentInfo::new("_9", 0, "Segmerge10")).unwrap();
        let docs: Vec<(usize, u32, u32)> = DocIdMerger::new(&state)
            .map(|d| (d.segment, d.doc, d.new_doc))
            .collect();
        assert_eq!(docs, vec![(0, 1, 0), (0, 2, 1), (1, 0, 2), (1, 1, 3)]);
    }

    #[test]
    fn test_sorted_order_interleaves() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let sources = readers(&storage, &[&[30, 10], &[20, 40]]);
        let sort = IndexSort::new(vec![SortField::new("rank", SortFieldType::Long)]);
        let target = SegmentInfo::new("_9", 0, "Segmerge10").with_index_sort(Some(sort));
        let state = MergeState::new(&sources, target).unwrap();
        let docs: Vec<(usize, u32, u32)> = DocIdMerger::new(&state)
            .map(|d| (d.segment, d.doc, d.new_doc))
            .collect();
        assert_eq!(docs, vec![(0, 1, 0), (1, 0, 1), (0, 0, 2), (1, 1, 3)]);
    }
}
