//! Navigation over the implicit binary tree of a BKD index.
//!
//! Nodes are addressed by id: the root is 1 and node `n` has children `2n`
//! and `2n + 1`. Ids at or above the leaf count are leaves. Both index
//! layouts expose the same push/pop API through [`IndexTreeNavigation`];
//! the packed layout decodes nodes incrementally and keeps per-level stacks
//! so that `pop` restores the parent without re-reading it.

use std::io::Cursor;
use std::sync::Arc;

use crate::bkd::{VERSION_IMPLICIT_SPLIT_DIM_1D, tree_depth};
use crate::error::Result;
use crate::storage::structured::StructReader;

/// Node id, level and the id of the first leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCursor {
    node_id: usize,
    // 1-based so that level - 1 is always valid.
    level: usize,
    leaf_node_offset: usize,
}

impl NodeCursor {
    pub fn new(num_leaves: usize) -> Self {
        NodeCursor {
            node_id: 1,
            level: 1,
            leaf_node_offset: num_leaves,
        }
    }

    fn push_left(&mut self) {
        self.node_id *= 2;
        self.level += 1;
    }

    fn push_right(&mut self) {
        self.node_id = self.node_id * 2 + 1;
        self.level += 1;
    }

    fn pop(&mut self) {
        self.node_id /= 2;
        self.level -= 1;
    }

    pub fn is_leaf_node(&self) -> bool {
        self.node_id >= self.leaf_node_offset
    }

    /// False for the phantom right sibling of an unbalanced tree's leftmost leaf.
    pub fn node_exists(&self) -> bool {
        self.node_id - self.leaf_node_offset < self.leaf_node_offset
    }

    /// Number of leaves below the current node.
    pub fn num_leaves(&self) -> usize {
        let mut left_most = self.node_id;
        while left_most < self.leaf_node_offset {
            left_most *= 2;
        }
        let mut right_most = self.node_id;
        while right_most < self.leaf_node_offset {
            right_most = right_most * 2 + 1;
        }
        if right_most >= left_most {
            right_most - left_most + 1
        } else {
            // The left side is one level deeper than the right.
            right_most + self.leaf_node_offset + 1 - left_most
        }
    }
}

/// Shared navigation API of both index layouts.
pub trait IndexTreeNavigation {
    fn cursor(&self) -> &NodeCursor;

    /// Descend to the left child.
    fn push_left(&mut self) -> Result<()>;

    /// Descend to the right child.
    fn push_right(&mut self) -> Result<()>;

    /// Return to the parent, restoring its state.
    fn pop(&mut self);

    /// Dimension the current inner node splits on.
    fn split_dim(&self) -> usize;

    /// Split value of the current inner node, `bytes_per_dim` bytes.
    fn split_dim_value(&self) -> &[u8];

    /// File pointer of the current leaf block.
    fn leaf_block_fp(&self) -> u64;

    fn node_id(&self) -> usize {
        self.cursor().node_id
    }

    fn level(&self) -> usize {
        self.cursor().level
    }

    fn is_leaf_node(&self) -> bool {
        self.cursor().is_leaf_node()
    }

    fn node_exists(&self) -> bool {
        self.cursor().node_exists()
    }

    fn num_leaves(&self) -> usize {
        self.cursor().num_leaves()
    }
}

/// The flat index of pre-packed trees: one entry per inner node plus the
/// leaf file pointers, already rotated into node order.
#[derive(Debug)]
pub struct LegacyIndex {
    pub(crate) split_packed_values: Vec<u8>,
    pub(crate) leaf_block_fps: Vec<u64>,
    pub(crate) bytes_per_index_entry: usize,
    pub(crate) bytes_per_dim: usize,
    pub(crate) num_index_dims: usize,
    pub(crate) version: i32,
}

impl LegacyIndex {
    fn split_address(&self, node_id: usize) -> (usize, usize) {
        let address = node_id * self.bytes_per_index_entry;
        if self.num_index_dims == 1 {
            // Before the implicit split dim, 1-D entries still carried a zero dim byte.
            if self.version < VERSION_IMPLICIT_SPLIT_DIM_1D {
                (0, address + 1)
            } else {
                (0, address)
            }
        } else {
            (self.split_packed_values[address] as usize, address + 1)
        }
    }

    pub(crate) fn split_dim(&self, node_id: usize) -> usize {
        self.split_address(node_id).0
    }

    pub(crate) fn ram_bytes_used(&self) -> usize {
        self.split_packed_values.len() + self.leaf_block_fps.len() * 8
    }
}

/// Stateless view over a [`LegacyIndex`]; every node is a direct lookup.
#[derive(Debug, Clone)]
pub struct LegacyIndexTree {
    cursor: NodeCursor,
    index: Arc<LegacyIndex>,
}

impl LegacyIndexTree {
    pub fn new(index: Arc<LegacyIndex>) -> Self {
        LegacyIndexTree {
            cursor: NodeCursor::new(index.leaf_block_fps.len()),
            index,
        }
    }
}

impl IndexTreeNavigation for LegacyIndexTree {
    fn cursor(&self) -> &NodeCursor {
        &self.cursor
    }

    fn push_left(&mut self) -> Result<()> {
        self.cursor.push_left();
        Ok(())
    }

    fn push_right(&mut self) -> Result<()> {
        self.cursor.push_right();
        Ok(())
    }

    fn pop(&mut self) {
        self.cursor.pop();
    }

    fn split_dim(&self) -> usize {
        debug_assert!(!self.is_leaf_node());
        self.index.split_dim(self.cursor.node_id)
    }

    fn split_dim_value(&self) -> &[u8] {
        debug_assert!(!self.is_leaf_node());
        let (_, address) = self.index.split_address(self.cursor.node_id);
        &self.index.split_packed_values[address..address + self.index.bytes_per_dim]
    }

    fn leaf_block_fp(&self) -> u64 {
        debug_assert!(self.is_leaf_node());
        self.index.leaf_block_fps[self.cursor.node_id - self.cursor.leaf_node_offset]
    }
}

/// Incremental decoder of the packed index blob.
#[derive(Debug)]
pub struct PackedIndexTree {
    cursor: NodeCursor,
    input: StructReader<Cursor<Arc<[u8]>>>,
    num_index_dims: usize,
    bytes_per_dim: usize,
    // Leftmost leaf block file pointer per level.
    leaf_block_fp_stack: Vec<u64>,
    left_node_positions: Vec<u64>,
    right_node_positions: Vec<u64>,
    split_dims: Vec<usize>,
    // [level * num_index_dims + dim]: the last split on dim went left.
    negative_deltas: Vec<bool>,
    split_values_stack: Vec<Vec<u8>>,
}

impl PackedIndexTree {
    pub fn new(
        packed_index: Arc<[u8]>,
        num_leaves: usize,
        num_index_dims: usize,
        bytes_per_dim: usize,
    ) -> Result<Self> {
        let mut tree = Self::empty(packed_index, num_leaves, num_index_dims, bytes_per_dim);
        tree.read_node_data(false)?;
        Ok(tree)
    }

    fn empty(
        packed_index: Arc<[u8]>,
        num_leaves: usize,
        num_index_dims: usize,
        bytes_per_dim: usize,
    ) -> Self {
        let depth = tree_depth(num_leaves);
        PackedIndexTree {
            cursor: NodeCursor::new(num_leaves),
            input: StructReader::new(Cursor::new(packed_index), "packed index"),
            num_index_dims,
            bytes_per_dim,
            leaf_block_fp_stack: vec![0; depth + 1],
            left_node_positions: vec![0; depth + 1],
            right_node_positions: vec![0; depth + 1],
            split_dims: vec![0; depth + 1],
            negative_deltas: vec![false; num_index_dims * (depth + 1)],
            split_values_stack: vec![vec![0; num_index_dims * bytes_per_dim]; depth + 1],
        }
    }

    fn copy_negative_deltas_from_parent(&mut self, level: usize) {
        let n = self.num_index_dims;
        self.negative_deltas
            .copy_within((level - 1) * n..level * n, level * n);
    }

    fn read_node_data(&mut self, is_left: bool) -> Result<()> {
        let level = self.cursor.level;
        self.leaf_block_fp_stack[level] = self.leaf_block_fp_stack[level - 1];
        if !is_left {
            let delta = self.input.read_vlong()?;
            self.leaf_block_fp_stack[level] += delta as u64;
        }
        if self.cursor.is_leaf_node() {
            return Ok(());
        }

        // Split dim, prefix length and first differing byte delta share one vint.
        let code = self.input.read_vint()?;
        if code < 0 {
            return Err(self.input.corrupt(format!("negative node code {code}")));
        }
        let mut code = code as usize;
        let bpd = self.bytes_per_dim;
        let split_dim = code % self.num_index_dims;
        self.split_dims[level] = split_dim;
        code /= self.num_index_dims;
        let prefix = code % (1 + bpd);
        let suffix = bpd - prefix;

        let (parents, rest) = self.split_values_stack.split_at_mut(level);
        let current = &mut rest[0];
        current.copy_from_slice(&parents[level - 1]);
        if suffix > 0 {
            let mut first_diff_byte_delta = (code / (1 + bpd)) as i32;
            if self.negative_deltas[level * self.num_index_dims + split_dim] {
                first_diff_byte_delta = -first_diff_byte_delta;
            }
            let offset = split_dim * bpd + prefix;
            current[offset] = (current[offset] as i32 + first_diff_byte_delta) as u8;
            self.input
                .read_bytes(&mut current[offset + 1..offset + suffix])?;
        }
        // Otherwise the split value equals the last split on this dim.

        let left_num_bytes = if self.cursor.node_id * 2 < self.cursor.leaf_node_offset {
            self.input.read_vint_len()? as u64
        } else {
            0
        };
        let position = self.input.position()?;
        self.left_node_positions[level] = position;
        self.right_node_positions[level] = position + left_num_bytes;
        Ok(())
    }

    fn push(&mut self, left: bool) -> Result<()> {
        debug_assert!(!self.is_leaf_node());
        let parent_level = self.cursor.level;
        let split_dim = self.split_dims[parent_level];
        let node_position = if left {
            self.left_node_positions[parent_level]
        } else {
            self.right_node_positions[parent_level]
        };
        if left {
            self.cursor.push_left();
        } else {
            self.cursor.push_right();
        }
        let level = self.cursor.level;
        self.copy_negative_deltas_from_parent(level);
        self.negative_deltas[level * self.num_index_dims + split_dim] = left;
        self.input.seek(node_position)?;
        self.read_node_data(left)
    }
}

impl Clone for PackedIndexTree {
    /// Snapshot of the current node only; ancestors are not restorable.
    fn clone(&self) -> Self {
        let num_leaves = self.cursor.leaf_node_offset;
        let mut tree = Self::empty(
            self.input.get_ref().get_ref().clone(),
            num_leaves,
            self.num_index_dims,
            self.bytes_per_dim,
        );
        let level = self.cursor.level;
        let n = self.num_index_dims;
        tree.cursor = self.cursor;
        tree.leaf_block_fp_stack[level] = self.leaf_block_fp_stack[level];
        tree.left_node_positions[level] = self.left_node_positions[level];
        tree.right_node_positions[level] = self.right_node_positions[level];
        tree.split_dims[level] = self.split_dims[level];
        tree.split_values_stack[level].copy_from_slice(&self.split_values_stack[level]);
        tree.negative_deltas[level * n..(level + 1) * n]
            .copy_from_slice(&self.negative_deltas[level * n..(level + 1) * n]);
        tree
    }
}

impl IndexTreeNavigation for PackedIndexTree {
    fn cursor(&self) -> &NodeCursor {
        &self.cursor
    }

    fn push_left(&mut self) -> Result<()> {
        self.push(true)
    }

    fn push_right(&mut self) -> Result<()> {
        self.push(false)
    }

    fn pop(&mut self) {
        self.cursor.pop();
    }

    fn split_dim(&self) -> usize {
        debug_assert!(!self.is_leaf_node());
        self.split_dims[self.cursor.level]
    }

    fn split_dim_value(&self) -> &[u8] {
        debug_assert!(!self.is_leaf_node());
        let offset = self.split_dim() * self.bytes_per_dim;
        &self.split_values_stack[self.cursor.level][offset..offset + self.bytes_per_dim]
    }

    fn leaf_block_fp(&self) -> u64 {
        debug_assert!(self.is_leaf_node(), "node {} is not a leaf", self.cursor.node_id);
        self.leaf_block_fp_stack[self.cursor.level]
    }
}

/// Either index layout, chosen by the tree's format version.
#[derive(Debug, Clone)]
pub enum IndexTree {
    Legacy(LegacyIndexTree),
    Packed(PackedIndexTree),
}

impl IndexTreeNavigation for IndexTree {
    fn cursor(&self) -> &NodeCursor {
        match self {
            IndexTree::Legacy(tree) => tree.cursor(),
            IndexTree::Packed(tree) => tree.cursor(),
        }
    }

    fn push_left(&mut self) -> Result<()> {
        match self {
            IndexTree::Legacy(tree) => tree.push_left(),
            IndexTree::Packed(tree) => tree.push_left(),
        }
    }

    fn push_right(&mut self) -> Result<()> {
        match self {
            IndexTree::Legacy(tree) => tree.push_right(),
            IndexTree::Packed(tree) => tree.push_right(),
        }
    }

    fn pop(&mut self) {
        match self {
            IndexTree::Legacy(tree) => tree.pop(),
            IndexTree::Packed(tree) => tree.pop(),
        }
    }

    fn split_dim(&self) -> usize {
        match self {
            IndexTree::Legacy(tree) => tree.split_dim(),
            IndexTree::Packed(tree) => tree.split_dim(),
        }
    }

    fn split_dim_value(&self) -> &[u8] {
        match self {
            IndexTree::Legacy(tree) => tree.split_dim_value(),
            IndexTree::Packed(tree) => tree.split_dim_value(),
        }
    }

    fn leaf_block_fp(&self) -> u64 {
        match self {
            IndexTree::Legacy(tree) => tree.leaf_block_fp(),
            IndexTree::Packed(tree) => tree.leaf_block_fp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num_leaves_slow(node: usize, offset: usize) -> usize {
        if node >= 2 * offset {
            0
        } else if node >= offset {
            1
        } else {
            num_leaves_slow(node * 2, offset) + num_leaves_slow(node * 2 + 1, offset)
        }
    }

    #[test]
    fn test_num_leaves_matches_recursive_count() {
        for num_leaves in 1..70 {
            for node_id in 1..num_leaves * 2 {
                let cursor = NodeCursor {
                    node_id,
                    level: 1,
                    leaf_node_offset: num_leaves,
                };
                assert_eq!(
                    cursor.num_leaves(),
                    num_leaves_slow(node_id, num_leaves),
                    "num_leaves={num_leaves} node={node_id}"
                );
            }
        }
    }

    #[test]
    fn test_phantom_leaf_does_not_exist() {
        // Three leaves: node 3 is a leaf, nodes 4 and 5 sit one level deeper.
        let mut cursor = NodeCursor::new(3);
        cursor.push_right();
        assert!(cursor.is_leaf_node());
        assert!(cursor.node_exists());
        cursor.pop();
        cursor.push_left();
        assert!(!cursor.is_leaf_node());
        cursor.push_right();
        assert!(cursor.node_exists());
        let mut beyond = NodeCursor::new(3);
        beyond.node_id = 6;
        assert!(!beyond.node_exists());
    }

    #[test]
    fn test_legacy_tree_lookups() {
        // Two leaves, multi-dim entries: [dim byte, value byte] per node id.
        let index = Arc::new(LegacyIndex {
            split_packed_values: vec![0, 0, 1, 42],
            leaf_block_fps: vec![100, 200],
            bytes_per_index_entry: 2,
            bytes_per_dim: 1,
            num_index_dims: 2,
            version: VERSION_IMPLICIT_SPLIT_DIM_1D,
        });
        let mut tree = LegacyIndexTree::new(index);
        assert_eq!(tree.split_dim(), 1);
        assert_eq!(tree.split_dim_value(), &[42]);
        tree.push_left().unwrap();
        assert_eq!(tree.leaf_block_fp(), 100);
        tree.pop();
        tree.push_right().unwrap();
        assert_eq!(tree.leaf_block_fp(), 200);
        tree.pop();
        assert_eq!(tree.split_dim_value(), &[42]);
    }

    #[test]
    fn test_packed_single_leaf() {
        // Root is the only leaf: just the vlong file pointer.
        let tree = PackedIndexTree::new(Arc::from(vec![0x7Fu8]), 1, 1, 4).unwrap();
        assert!(tree.is_leaf_node());
        assert_eq!(tree.leaf_block_fp(), 127);
        assert_eq!(tree.num_leaves(), 1);
    }

    #[test]
    fn test_packed_two_leaves() {
        // Root: fp delta 10, code for dim 0 / prefix 0 / first byte delta 5,
        // one suffix byte, then the right leaf's fp delta 20.
        let bpd = 2;
        let code = (5 * (1 + bpd)) as u8;
        let bytes = vec![10u8, code, 0x33, 20];
        let mut tree = PackedIndexTree::new(Arc::from(bytes), 2, 1, bpd).unwrap();
        assert_eq!(tree.split_dim(), 0);
        assert_eq!(tree.split_dim_value(), &[5, 0x33]);

        let snapshot = tree.clone();
        tree.push_left().unwrap();
        assert_eq!(tree.leaf_block_fp(), 10);
        tree.pop();
        tree.push_right().unwrap();
        assert_eq!(tree.leaf_block_fp(), 30);
        tree.pop();
        assert_eq!(tree.split_dim_value(), &[5, 0x33]);

        let mut snapshot = snapshot;
        snapshot.push_right().unwrap();
        assert_eq!(snapshot.leaf_block_fp(), 30);
    }
}
