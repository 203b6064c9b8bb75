//! Live docs files (`.liv`).
//!
//! One file per deletion generation, named `segment_gen.liv`. The bit set
//! is written as little-bit-first 64-bit words under an index header whose
//! suffix is the generation.

use crate::codec::{LiveDocsFormat, codec_util};
use crate::error::Result;
use crate::index::segment_info::{SegmentCommitInfo, file_name_from_generation, gen_to_string};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{IOContext, Storage};
use crate::util::bits::{Bits, FixedBitSet};

pub const EXTENSION: &str = "liv";
pub const CODEC_NAME: &str = "Segmerge10LiveDocs";
pub const VERSION_START: i32 = 0;
pub const VERSION_CURRENT: i32 = VERSION_START;

#[derive(Debug, Clone, Copy, Default)]
pub struct Segmerge10LiveDocsFormat;

impl LiveDocsFormat for Segmerge10LiveDocsFormat {
    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        context: &IOContext,
    ) -> Result<FixedBitSet> {
        let generation = info.del_gen as u64;
        let file_name = file_name_from_generation(info.name(), EXTENSION, generation);
        let mut input = StructReader::new(storage.open_input(&file_name, context)?, file_name);
        codec_util::check_index_header(
            &mut input,
            CODEC_NAME,
            VERSION_START,
            VERSION_CURRENT,
            &info.info.id,
            &gen_to_string(generation),
        )?;
        let max_doc = info.max_doc() as usize;
        let num_words = max_doc.div_ceil(64);
        let mut words = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            words.push(input.read_i64()? as u64);
        }
        let live_docs = FixedBitSet::from_words(&words, max_doc);
        let expected = info.max_doc() - info.del_count;
        if live_docs.cardinality() != expected as usize {
            return Err(input.corrupt(format!(
                "bits.deleted={} info.delcount={}",
                max_doc - live_docs.cardinality(),
                info.del_count
            )));
        }
        codec_util::check_footer(&mut input)?;
        Ok(live_docs)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        live_docs: &FixedBitSet,
        info: &SegmentCommitInfo,
        new_del_count: u32,
        context: &IOContext,
    ) -> Result<String> {
        let generation = info.next_del_gen();
        let file_name = file_name_from_generation(info.name(), EXTENSION, generation);
        let deleted = live_docs.len() - live_docs.cardinality();
        assert_eq!(
            deleted,
            (info.del_count + new_del_count) as usize,
            "live docs disagree with the delete count of {}",
            info.name()
        );
        let mut out = StructWriter::new(storage.create_output(&file_name, context)?);
        codec_util::write_index_header(
            &mut out,
            CODEC_NAME,
            VERSION_CURRENT,
            &info.info.id,
            &gen_to_string(generation),
        )?;
        for word in live_docs.to_words() {
            out.write_i64(word as i64)?;
        }
        codec_util::write_footer(&mut out)?;
        out.close()?;
        Ok(file_name)
    }

    fn file_name(&self, info: &SegmentCommitInfo) -> Option<String> {
        if info.has_deletions() {
            Some(file_name_from_generation(
                info.name(),
                EXTENSION,
                info.del_gen as u64,
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_generations() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let format = Segmerge10LiveDocsFormat;
        let mut info = SegmentCommitInfo::new(SegmentInfo::new("_2", 70, "Segmerge10"));
        assert_eq!(format.file_name(&info), None);

        let mut live = FixedBitSet::new_all_set(70);
        live.clear(3);
        live.clear(65);
        let name = format
            .write_live_docs(&storage, &live, &info, 2, &IOContext::DEFAULT)
            .unwrap();
        assert_eq!(name, "_2_1.liv");
        info.del_gen = 1;
        info.del_count = 2;
        assert_eq!(format.file_name(&info).as_deref(), Some("_2_1.liv"));

        let read = format
            .read_live_docs(&storage, &info, &IOContext::READ)
            .unwrap();
        assert_eq!(read, live);
    }

    #[test]
    fn test_del_count_mismatch_is_corrupt() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let format = Segmerge10LiveDocsFormat;
        let mut info = SegmentCommitInfo::new(SegmentInfo::new("_2", 10, "Segmerge10"));
        let mut live = FixedBitSet::new_all_set(10);
        live.clear(0);
        format
            .write_live_docs(&storage, &live, &info, 1, &IOContext::DEFAULT)
            .unwrap();
        info.del_gen = 1;
        info.del_count = 2;
        let err = format
            .read_live_docs(&storage, &info, &IOContext::READ)
            .unwrap_err();
        assert!(err.is_format_error());
    }
}
