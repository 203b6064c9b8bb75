//! Buffered delete packets and the stream that tracks them.
//!
//! Every flush freezes the deletes buffered since the previous flush into a
//! [`FrozenBufferedUpdates`] packet and pushes it onto the
//! [`BufferedUpdatesStream`], which stamps it with the next generation.
//! Packets are applied to the pooled segments by whichever thread gets to
//! them first: the background resolver, a merge waiting for them, or a
//! caller of [`BufferedUpdatesStream::wait_apply_all`]. A packet is applied
//! at most once; later claimants wait for the first one to finish.
//!
//! [`FinishedSegments`] turns out-of-order completions into a watermark that
//! only moves over contiguous generations.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, SegmergeError};
use crate::index::reader_pool::ReaderPool;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::term::Term;
use crate::util::latch::CountDownLatch;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ApplyState {
    Pending,
    Applied,
    Failed(String),
}

/// An immutable batch of delete terms.
#[derive(Debug)]
pub struct FrozenBufferedUpdates {
    terms: Vec<Term>,
    bytes_used: usize,
    /// Only this segment is affected when set.
    private_segment: Option<String>,
    del_gen: OnceLock<u64>,
    apply_lock: Mutex<ApplyState>,
    applied: CountDownLatch,
}

impl FrozenBufferedUpdates {
    pub fn new(mut terms: Vec<Term>, private_segment: Option<String>) -> Self {
        terms.sort_unstable();
        terms.dedup();
        let bytes_used = terms.iter().map(Term::ram_bytes_used).sum();
        FrozenBufferedUpdates {
            terms,
            bytes_used,
            private_segment,
            del_gen: OnceLock::new(),
            apply_lock: Mutex::new(ApplyState::Pending),
            applied: CountDownLatch::new(1),
        }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
    }

    pub fn private_segment(&self) -> Option<&str> {
        self.private_segment.as_deref()
    }

    /// Generation assigned by [`BufferedUpdatesStream::push`], 0 before.
    pub fn del_gen(&self) -> u64 {
        self.del_gen.get().copied().unwrap_or(0)
    }

    fn set_del_gen(&self, generation: u64) {
        assert!(
            self.del_gen.set(generation).is_ok(),
            "packet was already pushed with delGen={}",
            self.del_gen()
        );
    }

    /// Whether the packet has been applied, successfully or not.
    pub fn is_applied(&self) -> bool {
        self.applied.count() == 0
    }

    /// Block until the packet has been applied by some thread.
    pub fn wait_applied(&self) {
        self.applied.wait();
    }

    /// Apply unless another thread is applying right now. Returns false if
    /// the packet was busy.
    pub fn try_apply(&self, stream: &BufferedUpdatesStream, pool: &ReaderPool) -> Result<bool> {
        match self.apply_lock.try_lock() {
            Some(mut state) => self.apply_locked(&mut state, stream, pool).map(|_| true),
            None => Ok(false),
        }
    }

    /// Apply, waiting for a concurrent claimant if there is one.
    pub fn force_apply(&self, stream: &BufferedUpdatesStream, pool: &ReaderPool) -> Result<()> {
        let mut state = self.apply_lock.lock();
        self.apply_locked(&mut state, stream, pool)
    }

    fn apply_locked(
        &self,
        state: &mut ApplyState,
        stream: &BufferedUpdatesStream,
        pool: &ReaderPool,
    ) -> Result<()> {
        match state {
            ApplyState::Applied => return Ok(()),
            ApplyState::Failed(message) => {
                return Err(SegmergeError::merge_aborted(format!(
                    "delete packet delGen={} failed to apply: {message}",
                    self.del_gen()
                )));
            }
            ApplyState::Pending => {}
        }
        let del_gen = self.del_gen();
        assert!(del_gen != 0, "packet applied before it was pushed");

        let start = Instant::now();
        let applies_to = |info: &SegmentCommitInfo| match &self.private_segment {
            Some(name) => info.name() == name,
            None => info.buffered_deletes_gen <= del_gen,
        };
        match pool.apply_term_deletes(&self.terms, applies_to) {
            Ok(deleted) => {
                *state = ApplyState::Applied;
                log::debug!(
                    target: "BD",
                    "applied {deleted} deletes for packet {self} in {} msec",
                    start.elapsed().as_millis()
                );
                stream.finished(self);
                self.applied.count_down();
                Ok(())
            }
            Err(e) => {
                log::debug!(target: "BD", "packet {self} failed to apply: {e}");
                *state = ApplyState::Failed(e.to_string());
                self.applied.count_down();
                Err(SegmergeError::merge_aborted(format!(
                    "delete packet delGen={del_gen} failed to apply: {e}"
                )))
            }
        }
    }
}

impl fmt::Display for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delGen={} numTerms={} bytesUsed={}",
            self.del_gen(),
            self.terms.len(),
            self.bytes_used
        )?;
        if let Some(segment) = &self.private_segment {
            write!(f, " privateSegment={segment}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FinishedInner {
    completed_del_gen: u64,
    finished_del_gens: BTreeSet<u64>,
}

/// Completion watermark over packet generations.
#[derive(Debug, Default)]
pub struct FinishedSegments {
    inner: Mutex<FinishedInner>,
}

impl FinishedSegments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `del_gen` as finished and advance the watermark over every
    /// contiguous finished generation.
    pub fn finished_segment(&self, del_gen: u64) {
        let mut inner = self.inner.lock();
        inner.finished_del_gens.insert(del_gen);
        while let Some(&first) = inner.finished_del_gens.first() {
            if first != inner.completed_del_gen + 1 {
                break;
            }
            inner.finished_del_gens.remove(&first);
            inner.completed_del_gen = first;
        }
        log::trace!(
            target: "BD",
            "finished packet delGen={del_gen} now completedDelGen={}",
            inner.completed_del_gen
        );
    }

    /// Highest generation with every generation at or below it finished.
    pub fn completed_del_gen(&self) -> u64 {
        self.inner.lock().completed_del_gen
    }

    pub fn still_running(&self, del_gen: u64) -> bool {
        let inner = self.inner.lock();
        del_gen > inner.completed_del_gen && !inner.finished_del_gens.contains(&del_gen)
    }

    pub fn clear(&self) {
        *self.inner.lock() = FinishedInner::default();
    }
}

#[derive(Debug)]
struct StreamInner {
    /// Pending packets in generation order.
    updates: Vec<Arc<FrozenBufferedUpdates>>,
    next_gen: u64,
    num_terms: usize,
    bytes_used: usize,
}

impl Default for StreamInner {
    fn default() -> Self {
        StreamInner {
            updates: Vec::new(),
            next_gen: 1,
            num_terms: 0,
            bytes_used: 0,
        }
    }
}

/// Pending delete packets, their generations and their accounting.
#[derive(Debug, Default)]
pub struct BufferedUpdatesStream {
    inner: Mutex<StreamInner>,
    finished_segments: FinishedSegments,
}

impl BufferedUpdatesStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `packet` with the next generation and register it as pending.
    pub fn push(&self, packet: Arc<FrozenBufferedUpdates>) -> u64 {
        let mut inner = self.inner.lock();
        let del_gen = inner.next_gen;
        inner.next_gen += 1;
        packet.set_del_gen(del_gen);
        inner.num_terms += packet.num_terms();
        inner.bytes_used += packet.bytes_used();
        log::debug!(
            target: "BD",
            "push new packet ({packet}), packetCount={}, bytesUsed={}",
            inner.updates.len() + 1,
            inner.bytes_used
        );
        inner.updates.push(packet);
        del_gen
    }

    /// Reserve a generation, as a newly flushed segment does for its
    /// buffered-deletes gen.
    pub fn next_gen(&self) -> u64 {
        let mut inner = self.inner.lock();
        let del_gen = inner.next_gen;
        inner.next_gen += 1;
        del_gen
    }

    /// Drop an applied packet and advance the watermark.
    pub fn finished(&self, packet: &FrozenBufferedUpdates) {
        let mut inner = self.inner.lock();
        let del_gen = packet.del_gen();
        if let Some(position) = inner.updates.iter().position(|p| p.del_gen() == del_gen) {
            inner.updates.remove(position);
            inner.num_terms -= packet.num_terms();
            inner.bytes_used -= packet.bytes_used();
        }
        drop(inner);
        self.finished_segments.finished_segment(del_gen);
    }

    /// Mark a generation reserved with [`next_gen`](Self::next_gen) as done,
    /// once the segment holding it is published.
    pub fn finished_segment(&self, del_gen: u64) {
        self.finished_segments.finished_segment(del_gen);
    }

    pub fn completed_del_gen(&self) -> u64 {
        self.finished_segments.completed_del_gen()
    }

    pub fn still_running(&self, del_gen: u64) -> bool {
        self.finished_segments.still_running(del_gen)
    }

    pub fn any(&self) -> bool {
        self.inner.lock().bytes_used != 0
    }

    pub fn pending_updates_count(&self) -> usize {
        self.inner.lock().updates.len()
    }

    pub fn num_terms(&self) -> usize {
        self.inner.lock().num_terms
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.inner.lock().bytes_used
    }

    /// Forget every pending packet and restart generations at 1.
    pub fn clear(&self) {
        *self.inner.lock() = StreamInner::default();
        self.finished_segments.clear();
    }

    /// Apply every packet pending right now.
    pub fn wait_apply_all(&self, pool: &ReaderPool) -> Result<()> {
        let wait_for: Vec<_> = self.inner.lock().updates.clone();
        self.wait_apply(&wait_for, pool)
    }

    /// Apply every pending packet a merge of `infos` depends on: those at or
    /// below the highest buffered-deletes gen of the merging segments.
    pub fn wait_apply_for_merge(&self, infos: &[SegmentCommitInfo], pool: &ReaderPool) -> Result<()> {
        let max_del_gen = infos
            .iter()
            .map(|info| info.buffered_deletes_gen)
            .max()
            .unwrap_or(0);
        let wait_for: Vec<_> = self
            .inner
            .lock()
            .updates
            .iter()
            .filter(|packet| packet.del_gen() <= max_del_gen)
            .cloned()
            .collect();
        log::debug!(
            target: "BD",
            "waitApplyForMerge: {} packets, {} merging segments",
            wait_for.len(),
            infos.len()
        );
        self.wait_apply(&wait_for, pool)
    }

    fn wait_apply(&self, wait_for: &[Arc<FrozenBufferedUpdates>], pool: &ReaderPool) -> Result<()> {
        let start = Instant::now();
        for packet in wait_for {
            packet.force_apply(self, pool)?;
        }
        if !wait_for.is_empty() {
            log::debug!(
                target: "BD",
                "waitApply: {} packets done in {} msec",
                wait_for.len(),
                start.elapsed().as_millis()
            );
        }
        Ok(())
    }

    /// Start the background thread that applies packets handed to the
    /// returned resolver.
    pub fn start_resolver(self: &Arc<Self>, pool: Arc<ReaderPool>) -> Result<DeleteResolver> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stream = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("segmerge-delete-resolver".to_string())
            .spawn(move || resolve_loop(receiver, &stream, &pool))?;
        Ok(DeleteResolver {
            sender: Some(sender),
            handle: Some(handle),
        })
    }
}

fn resolve_loop(
    receiver: Receiver<Arc<FrozenBufferedUpdates>>,
    stream: &BufferedUpdatesStream,
    pool: &ReaderPool,
) {
    for packet in receiver {
        match packet.try_apply(stream, pool) {
            Ok(true) => {}
            Ok(false) => log::trace!(target: "BD", "packet {packet} is being applied elsewhere"),
            Err(e) => log::warn!(target: "BD", "failed to resolve packet {packet}: {e}"),
        }
    }
}

/// Handle to the background resolver thread.
#[derive(Debug)]
pub struct DeleteResolver {
    sender: Option<Sender<Arc<FrozenBufferedUpdates>>>,
    handle: Option<JoinHandle<()>>,
}

impl DeleteResolver {
    /// Queue a pushed packet for asynchronous application.
    pub fn resolve(&self, packet: Arc<FrozenBufferedUpdates>) -> Result<()> {
        match &self.sender {
            Some(sender) => sender
                .send(packet)
                .map_err(|_| SegmergeError::illegal_state("delete resolver has stopped")),
            None => Err(SegmergeError::illegal_state("delete resolver has stopped")),
        }
    }

    /// Let the thread drain its queue and wait for it to exit.
    pub fn shutdown(&mut self) -> Result<()> {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| SegmergeError::other("delete resolver thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for DeleteResolver {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!(target: "BD", "{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, Segmerge10Codec};
    use crate::index::config::MergeConfig;
    use crate::index::document::Document;
    use crate::index::field_infos::FieldNumbers;
    use crate::index::segment_writer::SegmentWriter;
    use crate::storage::Storage;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn pool(stream: &BufferedUpdatesStream, segments: &[&str]) -> ReaderPool {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        let codec: Arc<dyn Codec> = Arc::new(Segmerge10Codec::new());
        let pool = ReaderPool::new(Arc::clone(&storage), Arc::clone(&codec));
        let numbers = FieldNumbers::new();
        for name in segments {
            let mut writer = SegmentWriter::new(*name, Arc::clone(&numbers), &MergeConfig::default());
            for id in ["a", "b", "c"] {
                writer
                    .add_document(Document::new().add_keyword("id", id))
                    .unwrap();
            }
            let mut info = writer.flush(storage.as_ref(), codec.as_ref()).unwrap();
            info.buffered_deletes_gen = stream.next_gen();
            pool.add(&info).unwrap();
            stream.finished_segment(info.buffered_deletes_gen);
        }
        pool
    }

    #[test]
    fn test_watermark_only_advances_contiguously() {
        let finished = FinishedSegments::new();
        finished.finished_segment(3);
        assert_eq!(finished.completed_del_gen(), 0);
        assert!(!finished.still_running(3));
        assert!(finished.still_running(1));
        finished.finished_segment(1);
        assert_eq!(finished.completed_del_gen(), 1);
        finished.finished_segment(2);
        assert_eq!(finished.completed_del_gen(), 3);
        assert!(!finished.still_running(2));
        assert!(finished.still_running(4));
    }

    #[test]
    fn test_push_assigns_increasing_generations() {
        let stream = BufferedUpdatesStream::new();
        let first = Arc::new(FrozenBufferedUpdates::new(
            vec![Term::new("id", "b"), Term::new("id", "a"), Term::new("id", "a")],
            None,
        ));
        assert_eq!(first.num_terms(), 2);
        assert_eq!(stream.push(Arc::clone(&first)), 1);
        assert_eq!(stream.next_gen(), 2);
        let second = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("id", "c")], None));
        assert_eq!(stream.push(second), 3);
        assert_eq!(stream.pending_updates_count(), 2);
        assert_eq!(stream.num_terms(), 3);
        assert!(stream.any());

        stream.clear();
        assert!(!stream.any());
        assert_eq!(stream.pending_updates_count(), 0);
        assert_eq!(stream.next_gen(), 1);
    }

    #[test]
    #[should_panic(expected = "already pushed")]
    fn test_double_push_panics() {
        let stream = BufferedUpdatesStream::new();
        let packet = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("id", "a")], None));
        stream.push(Arc::clone(&packet));
        stream.push(packet);
    }

    #[test]
    fn test_packets_only_touch_older_segments() {
        let stream = BufferedUpdatesStream::new();
        // _0 gets gen 1
        let pool = pool(&stream, &["_0"]);
        let packet = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("id", "a")], None));
        stream.push(Arc::clone(&packet)); // gen 2

        let storage = Arc::clone(pool.storage());
        let codec = Arc::clone(pool.codec());
        let mut writer = SegmentWriter::new("_1", FieldNumbers::new(), &MergeConfig::default());
        writer.add_document(Document::new().add_keyword("id", "a")).unwrap();
        let mut newer = writer.flush(storage.as_ref(), codec.as_ref()).unwrap();
        newer.buffered_deletes_gen = stream.next_gen(); // gen 3
        pool.add(&newer).unwrap();
        stream.finished_segment(newer.buffered_deletes_gen);
        assert_eq!(stream.completed_del_gen(), 1);

        stream.wait_apply_all(&pool).unwrap();
        assert!(packet.is_applied());
        assert_eq!(pool.num_docs("_0").unwrap(), 2);
        assert_eq!(pool.num_docs("_1").unwrap(), 1);
        assert_eq!(stream.completed_del_gen(), 3);
        assert!(!stream.still_running(2));
        assert!(!stream.any());

        // Applying again is a no-op.
        packet.force_apply(&stream, &pool).unwrap();
        assert_eq!(pool.num_docs("_0").unwrap(), 2);
    }

    #[test]
    fn test_private_packet_touches_only_its_segment() {
        let stream = BufferedUpdatesStream::new();
        let pool = pool(&stream, &["_0", "_1"]);
        let packet = Arc::new(FrozenBufferedUpdates::new(
            vec![Term::new("id", "b")],
            Some("_1".to_string()),
        ));
        stream.push(Arc::clone(&packet));
        assert!(packet.try_apply(&stream, &pool).unwrap());
        assert_eq!(pool.num_docs("_0").unwrap(), 3);
        assert_eq!(pool.num_docs("_1").unwrap(), 2);
    }

    #[test]
    fn test_wait_apply_for_merge_selects_by_generation() {
        let stream = BufferedUpdatesStream::new();
        let pool = pool(&stream, &["_0"]); // gen 1
        let early = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("id", "a")], None));
        stream.push(Arc::clone(&early)); // gen 2
        pool.set_buffered_deletes_gen("_0", 2).unwrap();
        let late = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("id", "b")], None));
        stream.push(Arc::clone(&late)); // gen 3

        stream
            .wait_apply_for_merge(&pool.segment_infos(), &pool)
            .unwrap();
        assert!(early.is_applied());
        assert!(!late.is_applied());
        assert_eq!(stream.pending_updates_count(), 1);
        assert_eq!(stream.completed_del_gen(), 2);
        assert!(stream.still_running(3));
    }

    #[test]
    fn test_resolver_thread_applies_packets() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let pool = Arc::new(pool(&stream, &["_0"]));
        let mut resolver = stream.start_resolver(Arc::clone(&pool)).unwrap();
        let packet = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("id", "c")], None));
        stream.push(Arc::clone(&packet));
        resolver.resolve(Arc::clone(&packet)).unwrap();
        packet.wait_applied();
        assert_eq!(pool.num_docs("_0").unwrap(), 2);
        resolver.shutdown().unwrap();
        assert!(resolver.resolve(packet).is_err());
    }
}
