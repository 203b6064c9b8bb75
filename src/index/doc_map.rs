//! Old to new doc id maps used while merging.

use crate::error::Result;
use crate::util::bits::{Bits, FixedBitSet};
use crate::util::packed::{MonotonicLongValues, Mutable};

/// Maps the docs of one merging segment to their ids in the merged segment.
/// Deleted docs map to `None`.
#[derive(Debug, Clone)]
pub enum DocMap {
    /// No deletions: docs shift by the live docs of earlier segments.
    Offset { base: u32, max_doc: u32 },
    /// Deletions compacted away: `base + mapping[doc]` for live docs.
    Compacted {
        base: u32,
        live_docs: FixedBitSet,
        mapping: MonotonicLongValues,
    },
    /// Arbitrary permutation from a sorted merge, stored plus one so that
    /// zero can mark deleted docs.
    Explicit { mapping: Mutable },
}

impl DocMap {
    pub fn get(&self, doc: u32) -> Option<u32> {
        match self {
            DocMap::Offset { base, max_doc } => {
                debug_assert!(doc < *max_doc);
                Some(base + doc)
            }
            DocMap::Compacted {
                base,
                live_docs,
                mapping,
            } => {
                if live_docs.get(doc as usize) {
                    Some(base + mapping.get(doc as usize) as u32)
                } else {
                    None
                }
            }
            DocMap::Explicit { mapping } => match mapping.get(doc as usize) {
                0 => None,
                shifted => Some((shifted - 1) as u32),
            },
        }
    }

    pub fn ram_bytes_used(&self) -> usize {
        match self {
            DocMap::Offset { .. } => 8,
            DocMap::Compacted {
                live_docs, mapping, ..
            } => live_docs.len().div_ceil(8) + mapping.ram_bytes_used(),
            DocMap::Explicit { mapping } => mapping.ram_bytes_used(),
        }
    }
}

/// Concatenate segments in order, skipping deleted docs.
pub fn build_deletion_doc_maps(
    max_docs: &[u32],
    live_docs: &[Option<FixedBitSet>],
) -> Result<Vec<DocMap>> {
    debug_assert_eq!(max_docs.len(), live_docs.len());
    let mut doc_maps = Vec::with_capacity(max_docs.len());
    let mut base = 0u32;
    for (&max_doc, live) in max_docs.iter().zip(live_docs) {
        match live {
            Some(live) => {
                let (doc_map, num_docs) = remove_deletes(base, max_doc, live.clone())?;
                doc_maps.push(doc_map);
                base += num_docs;
            }
            None => {
                doc_maps.push(DocMap::Offset { base, max_doc });
                base += max_doc;
            }
        }
    }
    Ok(doc_maps)
}

/// Doc map for one segment with deletions, plus its live doc count.
pub fn remove_deletes(base: u32, max_doc: u32, live_docs: FixedBitSet) -> Result<(DocMap, u32)> {
    let mut builder = MonotonicLongValues::builder();
    let mut del = 0i64;
    for doc in 0..max_doc {
        builder.add(doc as i64 - del);
        if !live_docs.get(doc as usize) {
            del += 1;
        }
    }
    let mapping = builder.build()?;
    let num_docs = max_doc - del as u32;
    Ok((
        DocMap::Compacted {
            base,
            live_docs,
            mapping,
        },
        num_docs,
    ))
}
