use serde::{Deserialize, Serialize};

use crate::bkd::{BkdConfig, DEFAULT_MAX_POINTS_IN_LEAF_NODE, VERSION_CURRENT};
use crate::error::{Result, SegmergeError};
use crate::index::sort::IndexSort;
use crate::util::packed::MAX_BLOCK_SIZE;

pub const DEFAULT_PACKED_BLOCK_SIZE: usize = 128;

/// Settings for flushing and merging segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Order documents of merged segments by these fields. `None` keeps
    /// segments concatenated in merge order.
    pub index_sort: Option<IndexSort>,

    /// Leaf size of point trees written by flushes and merges.
    pub max_points_in_leaf_node: usize,

    /// Block size of block packed doc values, norms and stored field indexes.
    pub packed_block_size: usize,

    /// Verify checksums of every source file before merging.
    pub check_integrity_at_merge: bool,

    /// BKD format version to write, 0 through 6.
    pub bkd_version: i32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            index_sort: None,
            max_points_in_leaf_node: DEFAULT_MAX_POINTS_IN_LEAF_NODE,
            packed_block_size: DEFAULT_PACKED_BLOCK_SIZE,
            check_integrity_at_merge: true,
            bkd_version: VERSION_CURRENT,
        }
    }
}

impl MergeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MergeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_index_sort(mut self, index_sort: IndexSort) -> Self {
        self.index_sort = Some(index_sort);
        self
    }

    pub fn with_max_points_in_leaf_node(mut self, max_points_in_leaf_node: usize) -> Self {
        self.max_points_in_leaf_node = max_points_in_leaf_node;
        self
    }

    pub fn with_packed_block_size(mut self, packed_block_size: usize) -> Self {
        self.packed_block_size = packed_block_size;
        self
    }

    pub fn with_bkd_version(mut self, bkd_version: i32) -> Self {
        self.bkd_version = bkd_version;
        self
    }

    pub fn with_check_integrity_at_merge(mut self, check: bool) -> Self {
        self.check_integrity_at_merge = check;
        self
    }

    pub fn validate(&self) -> Result<()> {
        BkdConfig::new(1, 1, 4, self.max_points_in_leaf_node)?;
        if !(0..=VERSION_CURRENT).contains(&self.bkd_version) {
            return Err(SegmergeError::invalid_argument(format!(
                "bkd_version must be 0 .. {VERSION_CURRENT} (got: {})",
                self.bkd_version
            )));
        }
        if self.packed_block_size == 0 || self.packed_block_size > MAX_BLOCK_SIZE {
            return Err(SegmergeError::invalid_argument(format!(
                "packed_block_size must be 1 .. {MAX_BLOCK_SIZE} (got: {})",
                self.packed_block_size
            )));
        }
        if let Some(sort) = &self.index_sort {
            sort.validate()?;
        }
        Ok(())
    }
}
