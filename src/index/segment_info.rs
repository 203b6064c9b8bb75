//! Segment metadata and file naming.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::codec::codec_util::ID_LENGTH;
use crate::error::{Result, SegmergeError};
use crate::index::sort::IndexSort;
use crate::storage::{IOContext, Storage};

pub const SEGMENT_INFO_EXTENSION: &str = "si";

/// `name.ext`, or `name_suffix.ext` when a suffix is given.
pub fn segment_file_name(segment: &str, suffix: &str, ext: &str) -> String {
    if suffix.is_empty() {
        format!("{segment}.{ext}")
    } else {
        format!("{segment}_{suffix}.{ext}")
    }
}

/// Generation as used in file names: base 36, lowercase.
pub fn gen_to_string(mut generation: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if generation == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while generation > 0 {
        buf.push(DIGITS[(generation % 36) as usize]);
        generation /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// `segment_gen.ext` for a positive generation.
pub fn file_name_from_generation(segment: &str, ext: &str, generation: u64) -> String {
    segment_file_name(segment, &gen_to_string(generation), ext)
}

/// Write-once description of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub max_doc: u32,
    pub id: [u8; ID_LENGTH],
    pub codec: String,
    pub index_sort: Option<IndexSort>,
    pub diagnostics: BTreeMap<String, String>,
    pub files: BTreeSet<String>,
}

impl SegmentInfo {
    pub fn new(name: impl Into<String>, max_doc: u32, codec: impl Into<String>) -> Self {
        SegmentInfo {
            name: name.into(),
            max_doc,
            id: *uuid::Uuid::new_v4().as_bytes(),
            codec: codec.into(),
            index_sort: None,
            diagnostics: BTreeMap::new(),
            files: BTreeSet::new(),
        }
    }

    pub fn with_index_sort(mut self, index_sort: Option<IndexSort>) -> Self {
        self.index_sort = index_sort;
        self
    }

    pub fn add_file(&mut self, name: impl Into<String>) {
        self.files.insert(name.into());
    }

    pub fn file_name(&self, suffix: &str, ext: &str) -> String {
        segment_file_name(&self.name, suffix, ext)
    }

    /// Persist as `name.si`.
    pub fn write(&mut self, storage: &dyn Storage, context: &IOContext) -> Result<()> {
        let file_name = self.file_name("", SEGMENT_INFO_EXTENSION);
        self.add_file(file_name.clone());
        let json = serde_json::to_vec_pretty(self)?;
        let mut output = storage.create_output(&file_name, context)?;
        output.write_all(&json)?;
        output.close()
    }

    pub fn read(storage: &dyn Storage, segment: &str, context: &IOContext) -> Result<Self> {
        let file_name = segment_file_name(segment, "", SEGMENT_INFO_EXTENSION);
        let mut input = storage.open_input(&file_name, context)?;
        let mut json = Vec::new();
        input.read_to_end(&mut json)?;
        let info: SegmentInfo = serde_json::from_slice(&json).map_err(|e| {
            SegmergeError::corrupt(format!("unreadable segment info: {e}"), file_name.clone(), None)
        })?;
        if info.name != segment {
            return Err(SegmergeError::corrupt(
                format!("segment info names {}", info.name),
                file_name,
                None,
            ));
        }
        Ok(info)
    }
}

/// A segment plus the mutable state the writer tracks for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCommitInfo {
    pub info: SegmentInfo,
    pub del_count: u32,
    /// Generation of the live docs file, -1 while there are no deletes.
    pub del_gen: i64,
    /// Deletes packets with a generation at or above this apply to the
    /// segment.
    pub buffered_deletes_gen: u64,
}

impl SegmentCommitInfo {
    pub fn new(info: SegmentInfo) -> Self {
        SegmentCommitInfo {
            info,
            del_count: 0,
            del_gen: -1,
            buffered_deletes_gen: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    pub fn num_docs(&self) -> u32 {
        self.info.max_doc - self.del_count
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen != -1
    }

    pub fn next_del_gen(&self) -> u64 {
        if self.del_gen == -1 {
            1
        } else {
            self.del_gen as u64 + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_file_names() {
        assert_eq!(segment_file_name("_0", "", "fdt"), "_0.fdt");
        assert_eq!(segment_file_name("_0", "1", "liv"), "_0_1.liv");
        assert_eq!(gen_to_string(0), "0");
        assert_eq!(gen_to_string(35), "z");
        assert_eq!(gen_to_string(36), "10");
        assert_eq!(file_name_from_generation("_3", "liv", 37), "_3_11.liv");
    }

    #[test]
    fn test_segment_info_round_trip() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut info = SegmentInfo::new("_7", 42, "Segmerge10");
        info.diagnostics.insert("source".into(), "flush".into());
        info.add_file("_7.fdt");
        info.write(&storage, &IOContext::DEFAULT).unwrap();

        let read = SegmentInfo::read(&storage, "_7", &IOContext::READ).unwrap();
        assert_eq!(read, info);
        assert!(read.files.contains("_7.si"));
        assert!(SegmentInfo::read(&storage, "_8", &IOContext::READ).is_err());
    }

    #[test]
    fn test_commit_info_counts() {
        let mut commit = SegmentCommitInfo::new(SegmentInfo::new("_1", 10, "Segmerge10"));
        assert!(!commit.has_deletions());
        assert_eq!(commit.next_del_gen(), 1);
        commit.del_count = 4;
        commit.del_gen = 2;
        assert_eq!(commit.num_docs(), 6);
        assert_eq!(commit.next_del_gen(), 3);
    }
}
