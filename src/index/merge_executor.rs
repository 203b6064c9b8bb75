//! Runs one merge end to end against a [`ReaderPool`].

use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::index::buffered_updates::BufferedUpdatesStream;
use crate::index::config::MergeConfig;
use crate::index::field_infos::FieldNumbers;
use crate::index::reader_pool::ReaderPool;
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::index::merge_state::MergeState;
use crate::index::segment_merger::SegmentMerger;
use crate::index::segment_reader::SegmentReader;
use crate::storage::{IOContext, MergeInfo, TrackingStorage};

/// Merges pooled segments into new ones.
///
/// A merge waits for the delete packets its segments depend on, snapshots
/// their readers, writes the merged segment and then swaps it into the pool
/// in place of the sources. Deletes applied to the sources while the merge
/// ran are carried into the merged segment on commit.
#[derive(Debug)]
pub struct MergeExecutor {
    pool: Arc<ReaderPool>,
    stream: Arc<BufferedUpdatesStream>,
    field_numbers: Arc<FieldNumbers>,
    config: MergeConfig,
}

impl MergeExecutor {
    pub fn new(
        pool: Arc<ReaderPool>,
        stream: Arc<BufferedUpdatesStream>,
        field_numbers: Arc<FieldNumbers>,
        config: MergeConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(MergeExecutor {
            pool,
            stream,
            field_numbers,
            config,
        })
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge the segments `sources` into a new segment `merged_name`.
    /// Returns `None` when no document survives, in which case the sources
    /// are dropped and nothing is written.
    pub fn merge(&self, sources: &[String], merged_name: &str) -> Result<Option<SegmentCommitInfo>> {
        self.pool.start_merge(sources)?;
        let tracking = TrackingStorage::new(self.pool.storage().as_ref());
        match self.run(sources, merged_name, &tracking) {
            Ok(merged) => Ok(merged),
            Err(e) => {
                log::debug!(target: "SM", "merge into {merged_name} failed: {e}");
                tracking.delete_created_files();
                self.pool.abort_merge(sources);
                Err(e)
            }
        }
    }

    fn run(
        &self,
        sources: &[String],
        merged_name: &str,
        tracking: &TrackingStorage<'_>,
    ) -> Result<Option<SegmentCommitInfo>> {
        let start = Instant::now();
        let infos: Vec<SegmentCommitInfo> = self
            .pool
            .segment_infos()
            .into_iter()
            .filter(|info| sources.iter().any(|name| name == info.name()))
            .collect();
        self.stream.wait_apply_for_merge(&infos, &self.pool)?;

        let readers = self.pool.merge_readers(sources)?;
        let total_max_doc: u64 = readers.iter().map(|r| r.max_doc() as u64).sum();
        let mut estimated_merge_bytes = 0u64;
        for reader in &readers {
            for file in &reader.segment_info().files {
                estimated_merge_bytes += self.pool.storage().file_length(file).unwrap_or(0);
            }
        }
        let context = IOContext::merge(MergeInfo {
            total_max_doc: total_max_doc.min(u32::MAX as u64) as u32,
            estimated_merge_bytes,
            is_external: false,
            merge_max_num_segments: -1,
        });

        let codec = self.pool.codec().as_ref();
        let mut segment_info = SegmentInfo::new(merged_name, 0, codec.name())
            .with_index_sort(self.config.index_sort.clone());
        segment_info
            .diagnostics
            .insert("source".to_string(), "merge".to_string());
        segment_info
            .diagnostics
            .insert("mergeFactor".to_string(), readers.len().to_string());

        let merger = SegmentMerger::new(
            &readers,
            segment_info,
            tracking,
            codec,
            Arc::clone(&self.field_numbers),
            context,
            &self.config,
        )?;
        if !merger.should_merge() {
            log::debug!(
                target: "SM",
                "all docs of {} segments are deleted, dropping them",
                readers.len()
            );
            for name in sources {
                self.pool.drop_segment(name)?;
            }
            return Ok(None);
        }

        let merge_state = merger.merge()?;
        let merged = self.commit(&readers, &merge_state, tracking, &context)?;
        log::info!(
            target: "SM",
            "merged {} segments into {merged_name} ({} docs) in {} msec",
            readers.len(),
            merge_state.segment_info.max_doc,
            start.elapsed().as_millis()
        );
        Ok(merged)
    }

    /// Write the `.si` of a finished merge and swap it into the pool. The
    /// merged files are deleted again when deletes carried in during the
    /// merge left nothing alive.
    fn commit(
        &self,
        readers: &[SegmentReader],
        merge_state: &MergeState,
        tracking: &TrackingStorage<'_>,
        context: &IOContext,
    ) -> Result<Option<SegmentCommitInfo>> {
        let mut info = merge_state.segment_info.clone();
        for file in tracking.created_files() {
            info.add_file(file);
        }
        info.write(tracking, context)?;

        let merged = self
            .pool
            .commit_merge(readers, merge_state, SegmentCommitInfo::new(info))?;
        if merged.is_none() {
            tracking.delete_created_files();
        }
        Ok(merged)
    }
}
