//! Block k-d trees for multi-dimensional point values.
//!
//! A tree is a run of leaf blocks, each holding up to
//! `max_points_in_leaf_node` points with their doc ids, followed by an
//! index that describes the implicit binary tree over those leaves. The
//! index comes in two layouts: the legacy flat array of split values plus a
//! leaf file-pointer table (versions before [`VERSION_PACKED_INDEX`]) and the
//! packed, prefix-coded byte blob used since.
//!
//! Trees are written by [`BkdWriter`] for freshly flushed points and by
//! [`OneDimensionBkdWriter`] when merging sorted 1-D points, and searched
//! with [`BkdReader::intersect`].

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmergeError};

pub mod doc_ids;
pub mod index_tree;
pub mod one_dim;
pub mod reader;
pub mod writer;

pub use index_tree::{IndexTree, IndexTreeNavigation};
pub use one_dim::OneDimensionBkdWriter;
pub use reader::BkdReader;
pub use writer::BkdWriter;

pub const CODEC_NAME: &str = "BKD";

pub const VERSION_START: i32 = 0;
pub const VERSION_COMPRESSED_DOC_IDS: i32 = 1;
pub const VERSION_COMPRESSED_VALUES: i32 = 2;
pub const VERSION_IMPLICIT_SPLIT_DIM_1D: i32 = 3;
pub const VERSION_PACKED_INDEX: i32 = 4;
pub const VERSION_LEAF_STORES_BOUNDS: i32 = 5;
pub const VERSION_SELECTIVE_INDEXING: i32 = 6;
pub const VERSION_CURRENT: i32 = VERSION_SELECTIVE_INDEXING;

pub const DEFAULT_MAX_POINTS_IN_LEAF_NODE: usize = 1024;
pub const MAX_DIMS: usize = 8;
pub const MAX_INDEX_DIMS: usize = 8;
pub const MAX_BYTES_PER_DIM: usize = 16;

/// How a cell relates to the query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Every point in the cell matches.
    CellInsideQuery,
    /// No point in the cell matches.
    CellOutsideQuery,
    /// Some points may match; each must be checked.
    CellCrossesQuery,
}

/// Callbacks driven by [`BkdReader::intersect`].
pub trait IntersectVisitor {
    /// Called for every doc of a cell that is fully inside the query.
    fn visit(&mut self, doc_id: u32) -> Result<()>;

    /// Called for every point of a leaf that crosses the query.
    fn visit_value(&mut self, doc_id: u32, packed_value: &[u8]) -> Result<()>;

    /// Classify the cell bounded by `min_packed_value` and `max_packed_value`,
    /// both `num_index_dims * bytes_per_dim` bytes.
    fn compare(&self, min_packed_value: &[u8], max_packed_value: &[u8]) -> Relation;

    /// Hint that up to `count` more docs are about to be visited.
    fn grow(&mut self, _count: usize) {}
}

/// Shape of the points held by one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BkdConfig {
    /// Dimensions stored per point.
    pub num_data_dims: usize,
    /// Leading dimensions used to build the tree; the rest are carried along.
    pub num_index_dims: usize,
    /// Width in bytes of one dimension.
    pub bytes_per_dim: usize,
    /// Upper bound on points per leaf block.
    pub max_points_in_leaf_node: usize,
}

impl BkdConfig {
    pub fn new(
        num_data_dims: usize,
        num_index_dims: usize,
        bytes_per_dim: usize,
        max_points_in_leaf_node: usize,
    ) -> Result<Self> {
        let config = BkdConfig {
            num_data_dims,
            num_index_dims,
            bytes_per_dim,
            max_points_in_leaf_node,
        };
        config.validate()?;
        Ok(config)
    }

    /// Single dimension of `bytes_per_dim` bytes with the default leaf size.
    pub fn one_dimension(bytes_per_dim: usize) -> Result<Self> {
        Self::new(1, 1, bytes_per_dim, DEFAULT_MAX_POINTS_IN_LEAF_NODE)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_data_dims < 1 || self.num_data_dims > MAX_DIMS {
            return Err(SegmergeError::invalid_argument(format!(
                "num_data_dims must be 1 .. {MAX_DIMS} (got: {})",
                self.num_data_dims
            )));
        }
        if self.num_index_dims < 1 || self.num_index_dims > MAX_INDEX_DIMS {
            return Err(SegmergeError::invalid_argument(format!(
                "num_index_dims must be 1 .. {MAX_INDEX_DIMS} (got: {})",
                self.num_index_dims
            )));
        }
        if self.num_index_dims > self.num_data_dims {
            return Err(SegmergeError::invalid_argument(format!(
                "num_index_dims cannot exceed num_data_dims ({}) (got: {})",
                self.num_data_dims, self.num_index_dims
            )));
        }
        if self.bytes_per_dim < 1 || self.bytes_per_dim > MAX_BYTES_PER_DIM {
            return Err(SegmergeError::invalid_argument(format!(
                "bytes_per_dim must be 1 .. {MAX_BYTES_PER_DIM} (got: {})",
                self.bytes_per_dim
            )));
        }
        if self.max_points_in_leaf_node == 0 || self.max_points_in_leaf_node > i32::MAX as usize {
            return Err(SegmergeError::invalid_argument(format!(
                "max_points_in_leaf_node must be > 0 (got: {})",
                self.max_points_in_leaf_node
            )));
        }
        Ok(())
    }

    pub fn packed_bytes_length(&self) -> usize {
        self.num_data_dims * self.bytes_per_dim
    }

    pub fn packed_index_bytes_length(&self) -> usize {
        self.num_index_dims * self.bytes_per_dim
    }
}

/// Unsigned lexicographic comparison of dimension `dim` of two packed values.
#[inline]
pub fn compare_dim(a: &[u8], b: &[u8], dim: usize, bytes_per_dim: usize) -> Ordering {
    let offset = dim * bytes_per_dim;
    a[offset..offset + bytes_per_dim].cmp(&b[offset..offset + bytes_per_dim])
}

/// Tree depth needed for `num_leaves` leaves, counting the root as level 1.
pub fn tree_depth(num_leaves: usize) -> usize {
    debug_assert!(num_leaves > 0);
    num_leaves.ilog2() as usize + 2
}

/// Box query over the index dimensions that collects matching doc ids.
///
/// Bounds are inclusive packed values of `num_index_dims * bytes_per_dim`
/// bytes.
#[derive(Debug, Clone)]
pub struct PointRangeVisitor {
    lower: Vec<u8>,
    upper: Vec<u8>,
    num_dims: usize,
    bytes_per_dim: usize,
    docs: Vec<u32>,
}

impl PointRangeVisitor {
    pub fn new(lower: Vec<u8>, upper: Vec<u8>, bytes_per_dim: usize) -> Result<Self> {
        if lower.len() != upper.len() || bytes_per_dim == 0 || lower.len() % bytes_per_dim != 0 {
            return Err(SegmergeError::invalid_argument(format!(
                "bounds of {} and {} bytes do not match bytes_per_dim={bytes_per_dim}",
                lower.len(),
                upper.len()
            )));
        }
        Ok(PointRangeVisitor {
            num_dims: lower.len() / bytes_per_dim,
            lower,
            upper,
            bytes_per_dim,
            docs: Vec::new(),
        })
    }

    /// Docs visited so far, in visit order.
    pub fn docs(&self) -> &[u32] {
        &self.docs
    }

    pub fn into_docs(self) -> Vec<u32> {
        self.docs
    }

    fn matches(&self, packed_value: &[u8]) -> bool {
        (0..self.num_dims).all(|dim| {
            compare_dim(packed_value, &self.lower, dim, self.bytes_per_dim) != Ordering::Less
                && compare_dim(packed_value, &self.upper, dim, self.bytes_per_dim)
                    != Ordering::Greater
        })
    }
}

impl IntersectVisitor for PointRangeVisitor {
    fn visit(&mut self, doc_id: u32) -> Result<()> {
        self.docs.push(doc_id);
        Ok(())
    }

    fn visit_value(&mut self, doc_id: u32, packed_value: &[u8]) -> Result<()> {
        if self.matches(packed_value) {
            self.docs.push(doc_id);
        }
        Ok(())
    }

    fn compare(&self, min_packed_value: &[u8], max_packed_value: &[u8]) -> Relation {
        let bpd = self.bytes_per_dim;
        let mut crosses = false;
        for dim in 0..self.num_dims {
            if compare_dim(min_packed_value, &self.upper, dim, bpd) == Ordering::Greater
                || compare_dim(max_packed_value, &self.lower, dim, bpd) == Ordering::Less
            {
                return Relation::CellOutsideQuery;
            }
            crosses |= compare_dim(min_packed_value, &self.lower, dim, bpd) == Ordering::Less
                || compare_dim(max_packed_value, &self.upper, dim, bpd) == Ordering::Greater;
        }
        if crosses {
            Relation::CellCrossesQuery
        } else {
            Relation::CellInsideQuery
        }
    }

    fn grow(&mut self, count: usize) {
        self.docs.reserve(count);
    }
}

/// Collects every point with its full packed value. Used to re-read trees
/// during merge.
#[derive(Debug, Default, Clone)]
pub struct PointCollector {
    pub points: Vec<(u32, Vec<u8>)>,
}

impl IntersectVisitor for PointCollector {
    fn visit(&mut self, doc_id: u32) -> Result<()> {
        Err(SegmergeError::illegal_state(format!(
            "point collector needs values, got bare doc {doc_id}"
        )))
    }

    fn visit_value(&mut self, doc_id: u32, packed_value: &[u8]) -> Result<()> {
        self.points.push((doc_id, packed_value.to_vec()));
        Ok(())
    }

    fn compare(&self, _min_packed_value: &[u8], _max_packed_value: &[u8]) -> Relation {
        Relation::CellCrossesQuery
    }

    fn grow(&mut self, count: usize) {
        self.points.reserve(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(BkdConfig::new(2, 2, 4, 512).is_ok());
        assert!(BkdConfig::new(0, 0, 4, 512).is_err());
        assert!(BkdConfig::new(2, 3, 4, 512).is_err());
        assert!(BkdConfig::new(9, 1, 4, 512).is_err());
        assert!(BkdConfig::new(1, 1, 17, 512).is_err());
        assert!(BkdConfig::new(1, 1, 4, 0).is_err());

        let config = BkdConfig::new(3, 2, 8, 16).unwrap();
        assert_eq!(config.packed_bytes_length(), 24);
        assert_eq!(config.packed_index_bytes_length(), 16);
    }

    #[test]
    fn test_tree_depth() {
        assert_eq!(tree_depth(1), 2);
        assert_eq!(tree_depth(4), 4);
        assert_eq!(tree_depth(5), 4);
        assert_eq!(tree_depth(8), 5);
    }

    #[test]
    fn test_range_visitor_relations() {
        let visitor = PointRangeVisitor::new(vec![10, 10], vec![20, 20], 1).unwrap();
        assert_eq!(visitor.compare(&[0, 0], &[5, 5]), Relation::CellOutsideQuery);
        assert_eq!(visitor.compare(&[12, 12], &[18, 20]), Relation::CellInsideQuery);
        assert_eq!(visitor.compare(&[5, 12], &[15, 18]), Relation::CellCrossesQuery);
        assert_eq!(visitor.compare(&[21, 0], &[30, 30]), Relation::CellOutsideQuery);
    }

    #[test]
    fn test_range_visitor_is_unsigned() {
        let mut visitor = PointRangeVisitor::new(vec![0x10], vec![0xF0], 1).unwrap();
        visitor.visit_value(1, &[0x80]).unwrap();
        visitor.visit_value(2, &[0xFF]).unwrap();
        visitor.visit_value(3, &[0x05]).unwrap();
        assert_eq!(visitor.docs(), &[1]);
    }
}
