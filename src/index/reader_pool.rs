//! Open readers and pending deletes of every live segment.
//!
//! The pool is the one place deletes land. Buffered delete packets resolve
//! their terms against the pooled readers, merges snapshot the readers they
//! merge, and on commit the deletes that arrived while a merge ran are
//! carried into the merged segment. One lock guards the whole pool.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::Codec;
use crate::error::{Result, SegmergeError};
use crate::index::merge_state::MergeState;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;
use crate::storage::{IOContext, Storage};
use crate::util::bits::{Bits, FixedBitSet};

/// A pooled segment: its reader plus deletes not yet written to disk.
#[derive(Debug)]
pub struct ReadersAndUpdates {
    info: SegmentCommitInfo,
    reader: SegmentReader,
    /// Persisted and pending deletes together. `None` while nothing is
    /// deleted.
    live_docs: Option<FixedBitSet>,
    pending_del_count: u32,
    merging: bool,
}

impl ReadersAndUpdates {
    fn new(reader: SegmentReader) -> Self {
        ReadersAndUpdates {
            info: reader.commit_info().clone(),
            live_docs: reader.live_docs().cloned(),
            reader,
            pending_del_count: 0,
            merging: false,
        }
    }

    pub fn info(&self) -> &SegmentCommitInfo {
        &self.info
    }

    pub fn pending_del_count(&self) -> u32 {
        self.pending_del_count
    }

    pub fn num_docs(&self) -> u32 {
        self.info.num_docs() - self.pending_del_count
    }

    pub fn is_merging(&self) -> bool {
        self.merging
    }

    /// Mark `doc` deleted. False if it already was.
    pub fn delete(&mut self, doc: u32) -> bool {
        let max_doc = self.info.max_doc() as usize;
        let live = self
            .live_docs
            .get_or_insert_with(|| FixedBitSet::new_all_set(max_doc));
        if live.get_and_clear(doc as usize) {
            self.pending_del_count += 1;
            true
        } else {
            false
        }
    }

    /// A reader reflecting every delete so far, pending ones included.
    pub fn reader(&self) -> SegmentReader {
        if self.pending_del_count == 0 {
            return self.reader.clone();
        }
        let mut info = self.info.clone();
        info.del_count += self.pending_del_count;
        self.reader.with_live_docs(info, self.live_docs.clone())
    }

    /// Write pending deletes as the next live docs generation. Returns
    /// whether anything was written.
    fn write_live_docs(&mut self, storage: &dyn Storage, codec: &dyn Codec) -> Result<bool> {
        let Some(live_docs) = self.live_docs.as_ref().filter(|_| self.pending_del_count > 0) else {
            return Ok(false);
        };
        let live_docs_format = codec.live_docs_format();
        let previous = live_docs_format.file_name(&self.info);
        let file_name = live_docs_format.write_live_docs(
            storage,
            live_docs,
            &self.info,
            self.pending_del_count,
            &IOContext::DEFAULT,
        )?;
        self.info.del_gen = self.info.next_del_gen() as i64;
        self.info.del_count += self.pending_del_count;
        self.pending_del_count = 0;
        self.reader = self
            .reader
            .with_live_docs(self.info.clone(), Some(live_docs.clone()));
        log::debug!(
            "wrote {file_name} for segment {} ({} deleted)",
            self.info.name(),
            self.info.del_count
        );
        if let Some(previous) = previous {
            if let Err(e) = storage.delete_file(&previous) {
                log::debug!("could not delete {previous}: {e}");
            }
        }
        Ok(true)
    }
}

/// Every segment of the index in order, with its pooled reader.
#[derive(Debug)]
pub struct ReaderPool {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    segments: Mutex<Vec<ReadersAndUpdates>>,
}

impl ReaderPool {
    pub fn new(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Self {
        ReaderPool {
            storage,
            codec,
            segments: Mutex::new(Vec::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Open `info` and append it to the pool.
    pub fn add(&self, info: &SegmentCommitInfo) -> Result<()> {
        let reader = SegmentReader::open(self.storage.as_ref(), self.codec.as_ref(), info, &IOContext::READ)?;
        let mut segments = self.segments.lock();
        if segments.iter().any(|rld| rld.info.name() == info.name()) {
            return Err(SegmergeError::invalid_argument(format!(
                "segment {} is already pooled",
                info.name()
            )));
        }
        segments.push(ReadersAndUpdates::new(reader));
        Ok(())
    }

    pub fn segment_infos(&self) -> Vec<SegmentCommitInfo> {
        self.segments.lock().iter().map(|rld| rld.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.segments.lock().iter().any(|rld| rld.info.name() == name)
    }

    fn with_segment<T>(&self, name: &str, f: impl FnOnce(&mut ReadersAndUpdates) -> Result<T>) -> Result<T> {
        let mut segments = self.segments.lock();
        let rld = segments
            .iter_mut()
            .find(|rld| rld.info.name() == name)
            .ok_or_else(|| SegmergeError::not_found(format!("segment {name} is not pooled")))?;
        f(rld)
    }

    /// Current reader of `name`, pending deletes included.
    pub fn get_reader(&self, name: &str) -> Result<SegmentReader> {
        self.with_segment(name, |rld| Ok(rld.reader()))
    }

    pub fn num_docs(&self, name: &str) -> Result<u32> {
        self.with_segment(name, |rld| Ok(rld.num_docs()))
    }

    pub fn delete_document(&self, name: &str, doc: u32) -> Result<bool> {
        self.with_segment(name, |rld| {
            if doc >= rld.info.max_doc() {
                return Err(SegmergeError::invalid_argument(format!(
                    "doc {doc} is out of bounds for segment {name} with {} docs",
                    rld.info.max_doc()
                )));
            }
            Ok(rld.delete(doc))
        })
    }

    pub fn set_buffered_deletes_gen(&self, name: &str, generation: u64) -> Result<()> {
        self.with_segment(name, |rld| {
            rld.info.buffered_deletes_gen = generation;
            Ok(())
        })
    }

    /// Delete every doc matching one of `terms` in the segments `applies_to`
    /// selects. Returns the number of newly deleted docs.
    pub fn apply_term_deletes(
        &self,
        terms: &[Term],
        applies_to: impl Fn(&SegmentCommitInfo) -> bool,
    ) -> Result<u64> {
        let mut segments = self.segments.lock();
        let mut total = 0u64;
        for rld in segments.iter_mut().filter(|rld| applies_to(&rld.info)) {
            let mut deleted = 0u64;
            for term in terms {
                let Some(postings) = rld.reader.postings(&term.field, &term.bytes)? else {
                    continue;
                };
                for posting in postings {
                    if rld.delete(posting.doc) {
                        deleted += 1;
                    }
                }
            }
            if deleted > 0 {
                log::trace!(
                    target: "BD",
                    "seg={} delCount={deleted} pending={}",
                    rld.info.name(),
                    rld.pending_del_count
                );
            }
            total += deleted;
        }
        Ok(total)
    }

    /// Persist pending deletes of every segment.
    pub fn write_all_live_docs(&self) -> Result<usize> {
        let mut segments = self.segments.lock();
        let mut written = 0;
        for rld in segments.iter_mut() {
            if rld.write_live_docs(self.storage.as_ref(), self.codec.as_ref())? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Flag `names` as merging. Fails without flagging anything if a
    /// segment is missing or already merging.
    pub fn start_merge(&self, names: &[String]) -> Result<()> {
        let mut segments = self.segments.lock();
        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let position = segments
                .iter()
                .position(|rld| rld.info.name() == name)
                .ok_or_else(|| SegmergeError::not_found(format!("segment {name} is not pooled")))?;
            if segments[position].merging {
                return Err(SegmergeError::illegal_state(format!(
                    "segment {name} is already merging"
                )));
            }
            positions.push(position);
        }
        for position in positions {
            segments[position].merging = true;
        }
        Ok(())
    }

    /// Snapshot the current readers of `names`, in the given order.
    pub fn merge_readers(&self, names: &[String]) -> Result<Vec<SegmentReader>> {
        names.iter().map(|name| self.get_reader(name)).collect()
    }

    pub fn abort_merge(&self, names: &[String]) {
        for rld in self.segments.lock().iter_mut() {
            if names.iter().any(|name| name == rld.info.name()) {
                rld.merging = false;
            }
        }
    }

    /// Replace the merged `sources` with `merged`, carrying over every doc
    /// deleted since the sources were snapshotted. Returns `None` when those
    /// deletes left the merged segment empty, in which case it is dropped.
    pub fn commit_merge(
        &self,
        sources: &[SegmentReader],
        merge_state: &MergeState,
        mut merged: SegmentCommitInfo,
    ) -> Result<Option<SegmentCommitInfo>> {
        let mut segments = self.segments.lock();
        let max_doc = merged.max_doc();
        let mut merged_live: Option<FixedBitSet> = None;
        let mut carried = 0u32;
        let mut positions = Vec::with_capacity(sources.len());

        for (segment, source) in sources.iter().enumerate() {
            let position = segments
                .iter()
                .position(|rld| rld.info.name() == source.name())
                .ok_or_else(|| {
                    SegmergeError::illegal_state(format!(
                        "merged segment {} left the pool during the merge",
                        source.name()
                    ))
                })?;
            positions.push(position);
            let Some(current) = segments[position].live_docs.as_ref() else {
                continue;
            };
            let previous = source.live_docs();
            for doc in 0..source.max_doc() {
                let was_live = previous.is_none_or(|p| p.get(doc as usize));
                if !was_live || current.get(doc as usize) {
                    continue;
                }
                if let Some(new_doc) = merge_state.map_doc(segment, doc) {
                    merged_live
                        .get_or_insert_with(|| FixedBitSet::new_all_set(max_doc as usize))
                        .clear(new_doc as usize);
                    carried += 1;
                }
            }
        }

        merged.buffered_deletes_gen = positions
            .iter()
            .map(|&p| segments[p].info.buffered_deletes_gen)
            .max()
            .unwrap_or(0);

        // Open the merged segment before touching the pool so a failure
        // leaves the sources in place.
        let rld = if carried == max_doc {
            None
        } else {
            let reader =
                SegmentReader::open(self.storage.as_ref(), self.codec.as_ref(), &merged, &IOContext::READ)?;
            let mut rld = ReadersAndUpdates::new(reader);
            if carried > 0 {
                log::debug!(
                    "carried {carried} deletes into merged segment {}",
                    merged.name()
                );
                rld.live_docs = merged_live;
                rld.pending_del_count = carried;
            }
            Some(rld)
        };

        positions.sort_unstable();
        let insert_at = positions.first().copied().unwrap_or(segments.len());
        for position in positions.into_iter().rev() {
            segments.remove(position);
        }
        let Some(rld) = rld else {
            log::debug!(
                "merged segment {} is fully deleted, dropping it",
                merged.name()
            );
            return Ok(None);
        };
        let insert_at = insert_at.min(segments.len());
        segments.insert(insert_at, rld);
        Ok(Some(merged))
    }

    /// Remove a segment from the pool without writing its pending deletes.
    pub fn drop_segment(&self, name: &str) -> Result<SegmentCommitInfo> {
        let mut segments = self.segments.lock();
        let position = segments
            .iter()
            .position(|rld| rld.info.name() == name)
            .ok_or_else(|| SegmergeError::not_found(format!("segment {name} is not pooled")))?;
        Ok(segments.remove(position).info)
    }
}
