//! Merges the readers of several segments into one new segment.
//!
//! The merger drives each format's `merge` in a fixed order: field infos,
//! stored fields, postings, doc values, points, norms, term vectors, then
//! the merged field infos are written. Steps for data no field carries are
//! skipped. Each step is timed under the `SM` log target.

use std::sync::Arc;
use std::time::Instant;

use crate::codec::{Codec, SegmentWriteState};
use crate::error::{Result, SegmergeError};
use crate::index::config::MergeConfig;
use crate::index::field_infos::{FieldInfosBuilder, FieldNumbers};
use crate::index::merge_state::MergeState;
use crate::index::segment_info::SegmentInfo;
use crate::index::segment_reader::SegmentReader;
use crate::storage::{IOContext, Storage};

pub struct SegmentMerger<'a> {
    storage: &'a dyn Storage,
    codec: &'a dyn Codec,
    context: IOContext,
    field_numbers: Arc<FieldNumbers>,
    merge_state: MergeState,
}

impl<'a> SegmentMerger<'a> {
    /// Prepare a merge of `readers` into `segment_info`. The context must be
    /// a merge context.
    pub fn new(
        readers: &[SegmentReader],
        segment_info: SegmentInfo,
        storage: &'a dyn Storage,
        codec: &'a dyn Codec,
        field_numbers: Arc<FieldNumbers>,
        context: IOContext,
        config: &MergeConfig,
    ) -> Result<Self> {
        if !context.is_merge() {
            return Err(SegmergeError::invalid_argument(format!(
                "IOContext should be a merge context; got: {context:?}"
            )));
        }
        if config.check_integrity_at_merge {
            let start = Instant::now();
            for reader in readers {
                reader.check_integrity()?;
            }
            log::debug!(
                target: "SM",
                "{} msec to check integrity of {} segments",
                start.elapsed().as_millis(),
                readers.len()
            );
        }
        let merge_state = MergeState::new(readers, segment_info)?;
        Ok(SegmentMerger {
            storage,
            codec,
            context,
            field_numbers,
            merge_state,
        })
    }

    /// False when every source doc is deleted.
    pub fn should_merge(&self) -> bool {
        self.merge_state.segment_info.max_doc > 0
    }

    pub fn merge_state(&self) -> &MergeState {
        &self.merge_state
    }

    /// Run every merge step and return the finished merge state, whose
    /// segment info and merged field infos describe the new segment.
    pub fn merge(mut self) -> Result<MergeState> {
        if !self.should_merge() {
            return Err(SegmergeError::illegal_state(
                "Merge would result in 0 document segment",
            ));
        }
        let max_doc = self.merge_state.segment_info.max_doc;

        let start = Instant::now();
        self.merge_field_infos()?;
        log::debug!(
            target: "SM",
            "{} msec to merge fieldInfos",
            start.elapsed().as_millis()
        );

        let start = Instant::now();
        let num_merged = self.merge_stored_fields()?;
        log::debug!(
            target: "SM",
            "{} msec to merge stored fields [{num_merged} docs]",
            start.elapsed().as_millis()
        );
        assert_eq!(
            num_merged, max_doc,
            "numMerged={num_merged} vs segmentInfo.maxDoc()={max_doc}"
        );

        let start = Instant::now();
        self.merge_postings()?;
        log::debug!(
            target: "SM",
            "{} msec to merge postings [{max_doc} docs]",
            start.elapsed().as_millis()
        );

        let field_infos = self.merge_state.merge_field_infos()?;
        let (has_doc_values, has_points, has_norms, has_vectors) = (
            field_infos.has_doc_values(),
            field_infos.has_point_values(),
            field_infos.has_norms(),
            field_infos.has_vectors(),
        );

        if has_doc_values {
            let start = Instant::now();
            self.merge_doc_values()?;
            log::debug!(
                target: "SM",
                "{} msec to merge doc values [{max_doc} docs]",
                start.elapsed().as_millis()
            );
        }

        if has_points {
            let start = Instant::now();
            self.merge_points()?;
            log::debug!(
                target: "SM",
                "{} msec to merge points [{max_doc} docs]",
                start.elapsed().as_millis()
            );
        }

        if has_norms {
            let start = Instant::now();
            self.merge_norms()?;
            log::debug!(
                target: "SM",
                "{} msec to merge norms [{max_doc} docs]",
                start.elapsed().as_millis()
            );
        }

        if has_vectors {
            let start = Instant::now();
            let num_merged = self.merge_vectors()?;
            log::debug!(
                target: "SM",
                "{} msec to merge vectors [{num_merged} docs]",
                start.elapsed().as_millis()
            );
            assert_eq!(
                num_merged, max_doc,
                "numMerged={num_merged} vs segmentInfo.maxDoc()={max_doc}"
            );
        }

        let start = Instant::now();
        let state = &self.merge_state;
        self.codec.field_infos_format().write(
            self.storage,
            &state.segment_info,
            state.merge_field_infos()?,
            &self.context,
        )?;
        log::debug!(
            target: "SM",
            "{} msec to write field infos [{max_doc} docs]",
            start.elapsed().as_millis()
        );

        Ok(self.merge_state)
    }

    /// Number every field consistently with the index-wide field numbers.
    fn merge_field_infos(&mut self) -> Result<()> {
        let mut builder = FieldInfosBuilder::new(Arc::clone(&self.field_numbers));
        for field_infos in &self.merge_state.field_infos {
            for info in field_infos.iter() {
                builder.add(info)?;
            }
        }
        let merged = builder.finish()?;
        self.merge_state.set_merge_field_infos(merged);
        Ok(())
    }

    fn write_state(&self) -> Result<SegmentWriteState<'_>> {
        let state = &self.merge_state;
        Ok(SegmentWriteState::new(
            self.storage,
            &state.segment_info,
            state.merge_field_infos()?,
            self.context,
        ))
    }

    fn merge_stored_fields(&self) -> Result<u32> {
        let writer = self
            .codec
            .stored_fields_format()
            .fields_writer(&self.write_state()?)?;
        writer.merge(&self.merge_state)
    }

    fn merge_postings(&self) -> Result<()> {
        let consumer = self
            .codec
            .postings_format()
            .fields_consumer(&self.write_state()?)?;
        consumer.merge(&self.merge_state)
    }

    fn merge_doc_values(&self) -> Result<()> {
        let consumer = self
            .codec
            .doc_values_format()
            .fields_consumer(&self.write_state()?)?;
        consumer.merge(&self.merge_state)
    }

    fn merge_points(&self) -> Result<()> {
        let writer = self
            .codec
            .points_format()
            .fields_writer(&self.write_state()?)?;
        writer.merge(&self.merge_state)
    }

    fn merge_norms(&self) -> Result<()> {
        let consumer = self
            .codec
            .norms_format()
            .norms_consumer(&self.write_state()?)?;
        consumer.merge(&self.merge_state)
    }

    fn merge_vectors(&self) -> Result<u32> {
        let writer = self
            .codec
            .term_vectors_format()
            .vectors_writer(&self.write_state()?)?;
        writer.merge(&self.merge_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Segmerge10Codec;
    use crate::index::document::Document;
    use crate::index::segment_info::SegmentCommitInfo;
    use crate::index::segment_writer::SegmentWriter;
    use crate::storage::MergeInfo;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::util::bits::FixedBitSet;

    fn merge_context(total_max_doc: u32) -> IOContext {
        IOContext::merge(MergeInfo {
            total_max_doc,
            estimated_merge_bytes: 0,
            is_external: false,
            merge_max_num_segments: -1,
        })
    }

    fn flush(
        storage: &MemoryStorage,
        codec: &Segmerge10Codec,
        numbers: &Arc<FieldNumbers>,
        name: &str,
        ids: std::ops::Range<u32>,
    ) -> SegmentCommitInfo {
        let mut writer = SegmentWriter::new(name, Arc::clone(numbers), &MergeConfig::default());
        for id in ids {
            writer
                .add_document(
                    Document::new()
                        .add_keyword("id", id.to_string())
                        .add_text("body", format!("doc {id}"))
                        .add_numeric_doc_value("n", id as i64),
                )
                .unwrap();
        }
        writer.flush(storage, codec).unwrap()
    }

    #[test]
    fn test_rejects_non_merge_context() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let codec = Segmerge10Codec::new();
        let result = SegmentMerger::new(
            &[],
            SegmentInfo::new("_1", 0, "Segmerge10"),
            &storage,
            &codec,
            FieldNumbers::new(),
            IOContext::DEFAULT,
            &MergeConfig::default(),
        );
        assert!(matches!(result, Err(SegmergeError::InvalidArgument(_))));
    }

    #[test]
    fn test_all_deleted_would_be_empty() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let codec = Segmerge10Codec::new();
        let numbers = FieldNumbers::new();
        let info = flush(&storage, &codec, &numbers, "_0", 0..2);
        let reader = SegmentReader::open(&storage, &codec, &info, &IOContext::READ).unwrap();
        let mut deleted = info.clone();
        deleted.del_count = 2;
        let reader = reader.with_live_docs(deleted, Some(FixedBitSet::new(2)));

        let merger = SegmentMerger::new(
            &[reader],
            SegmentInfo::new("_1", 0, "Segmerge10"),
            &storage,
            &codec,
            numbers,
            merge_context(2),
            &MergeConfig::default(),
        )
        .unwrap();
        assert!(!merger.should_merge());
        let err = merger.merge().unwrap_err();
        assert!(err.to_string().contains("0 document segment"));
    }

    #[test]
    fn test_merge_two_segments() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let codec = Segmerge10Codec::new();
        let numbers = FieldNumbers::new();
        let readers: Vec<SegmentReader> = [("_0", 0..3), ("_1", 3..5)]
            .into_iter()
            .map(|(name, ids)| {
                let info = flush(&storage, &codec, &numbers, name, ids);
                SegmentReader::open(&storage, &codec, &info, &IOContext::READ).unwrap()
            })
            .collect();

        let merger = SegmentMerger::new(
            &readers,
            SegmentInfo::new("_2", 0, "Segmerge10"),
            &storage,
            &codec,
            numbers,
            merge_context(5),
            &MergeConfig::default(),
        )
        .unwrap();
        let state = merger.merge().unwrap();
        assert_eq!(state.segment_info.max_doc, 5);

        let mut merged = SegmentCommitInfo::new(state.segment_info.clone());
        merged.info.write(&storage, &IOContext::DEFAULT).unwrap();
        let reader = SegmentReader::open(&storage, &codec, &merged, &IOContext::READ).unwrap();
        assert_eq!(
            reader.document(4).unwrap().get("id").and_then(|v| v.as_str()),
            Some("4")
        );
        let doc = reader.postings("body", b"doc").unwrap().unwrap();
        assert_eq!(doc.iter().map(|p| p.doc).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        let n = reader.doc_values().unwrap().numeric("n").unwrap();
        assert_eq!(n.get(3), Some(3));
        assert_eq!(reader.norms().unwrap().norms("body").unwrap().get(1), Some(2));
    }
}
