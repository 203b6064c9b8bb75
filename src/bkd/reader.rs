//! Read-only access to a BKD tree.

use std::sync::Arc;

use crate::bkd::doc_ids;
use crate::bkd::index_tree::{
    IndexTree, IndexTreeNavigation, LegacyIndex, LegacyIndexTree, PackedIndexTree,
};
use crate::bkd::{
    BkdConfig, CODEC_NAME, IntersectVisitor, Relation, VERSION_COMPRESSED_DOC_IDS,
    VERSION_COMPRESSED_VALUES, VERSION_CURRENT, VERSION_IMPLICIT_SPLIT_DIM_1D,
    VERSION_LEAF_STORES_BOUNDS, VERSION_PACKED_INDEX, VERSION_SELECTIVE_INDEXING, VERSION_START,
    compare_dim, tree_depth,
};
use crate::codec::codec_util;
use crate::error::Result;
use crate::storage::StorageInput;
use crate::storage::structured::StructReader;

/// Reorder leaf file pointers of an unbalanced 1-D tree from file order into
/// node order. Leaves then straddle the two bottom levels: the deeper ones
/// come first on disk but have the larger node ids.
pub(crate) fn rotate_leaf_block_fps(leaf_block_fps: &mut [u64]) {
    let num_leaves = leaf_block_fps.len();
    if num_leaves <= 1 {
        return;
    }
    let mut level_count = 2;
    loop {
        if num_leaves >= level_count && num_leaves <= 2 * level_count {
            let last_level = 2 * (num_leaves - level_count);
            if last_level != 0 {
                leaf_block_fps.rotate_left(last_level);
            }
            return;
        }
        level_count *= 2;
    }
}

#[derive(Debug)]
enum TreeIndex {
    Packed(Arc<[u8]>),
    Legacy(Arc<LegacyIndex>),
}

/// A BKD tree opened from the header at the current position of its input.
///
/// Leaf blocks are read through clones of the input, so one reader can serve
/// concurrent intersections.
#[derive(Debug)]
pub struct BkdReader {
    config: BkdConfig,
    version: i32,
    num_leaves: usize,
    min_packed_value: Vec<u8>,
    max_packed_value: Vec<u8>,
    point_count: u64,
    doc_count: u32,
    index: TreeIndex,
    data: Box<dyn StorageInput>,
}

/// Per-level cell bounds. Level `l + 1` is derived from level `l` when
/// descending, so popping never needs to undo anything.
#[derive(Debug)]
struct CellStack {
    min: Vec<Vec<u8>>,
    max: Vec<Vec<u8>>,
    split_values: Vec<Vec<u8>>,
}

impl CellStack {
    fn new(depth: usize, min: &[u8], max: &[u8], bytes_per_dim: usize) -> Self {
        let mut stack = CellStack {
            min: vec![vec![0; min.len()]; depth + 1],
            max: vec![vec![0; max.len()]; depth + 1],
            split_values: vec![vec![0; bytes_per_dim]; depth + 1],
        };
        stack.min[1].copy_from_slice(min);
        stack.max[1].copy_from_slice(max);
        stack
    }

    fn save_split(&mut self, level: usize, value: &[u8]) {
        self.split_values[level].copy_from_slice(value);
    }

    /// Derive the child cell at `level + 1`: the left child's max, or the
    /// right child's min, takes the saved split value on `split_dim`.
    fn narrow(&mut self, level: usize, split_dim: usize, left: bool) {
        let bpd = self.split_values[level].len();
        let (parent, child) = self.min.split_at_mut(level + 1);
        child[0].copy_from_slice(&parent[level]);
        let (parent, child) = self.max.split_at_mut(level + 1);
        child[0].copy_from_slice(&parent[level]);

        let bound = if left {
            &mut self.max[level + 1]
        } else {
            &mut self.min[level + 1]
        };
        bound[split_dim * bpd..(split_dim + 1) * bpd].copy_from_slice(&self.split_values[level]);
    }

    fn compare<V: IntersectVisitor + ?Sized>(&self, level: usize, visitor: &V) -> Relation {
        visitor.compare(&self.min[level], &self.max[level])
    }
}

struct IntersectState {
    input: StructReader<Box<dyn StorageInput>>,
    index: IndexTree,
    cells: CellStack,
    doc_ids: Vec<u32>,
    common_prefix_lengths: Vec<usize>,
    scratch_data: Vec<u8>,
    scratch_min: Vec<u8>,
    scratch_max: Vec<u8>,
}

impl BkdReader {
    pub fn open(mut input: StructReader<Box<dyn StorageInput>>) -> Result<Self> {
        let version =
            codec_util::check_header(&mut input, CODEC_NAME, VERSION_START, VERSION_CURRENT)?;
        let num_data_dims = input.read_vint_len()?;
        let num_index_dims = if version >= VERSION_SELECTIVE_INDEXING {
            input.read_vint_len()?
        } else {
            num_data_dims
        };
        let max_points_in_leaf_node = input.read_vint_len()?;
        let bytes_per_dim = input.read_vint_len()?;
        let config = match BkdConfig::new(
            num_data_dims,
            num_index_dims,
            bytes_per_dim,
            max_points_in_leaf_node,
        ) {
            Ok(config) => config,
            Err(e) => return Err(input.corrupt(e.to_string())),
        };
        let bytes_per_index_entry =
            if num_data_dims == 1 && version >= VERSION_IMPLICIT_SPLIT_DIM_1D {
                bytes_per_dim
            } else {
                bytes_per_dim + 1
            };

        let num_leaves = input.read_vint_len()?;
        if num_leaves == 0 {
            return Err(input.corrupt("tree has no leaves"));
        }

        let packed_index_bytes_length = config.packed_index_bytes_length();
        let min_packed_value = input.read_vec(packed_index_bytes_length)?;
        let max_packed_value = input.read_vec(packed_index_bytes_length)?;
        for dim in 0..num_index_dims {
            if compare_dim(&min_packed_value, &max_packed_value, dim, bytes_per_dim).is_gt() {
                return Err(input.corrupt(format!(
                    "min_packed_value {min_packed_value:?} is > max_packed_value {max_packed_value:?} for dim={dim}"
                )));
            }
        }

        let point_count = input.read_vlong()? as u64;
        let doc_count = input.read_vint_len()? as u32;

        let index = if version >= VERSION_PACKED_INDEX {
            let num_bytes = input.read_vint_len()?;
            TreeIndex::Packed(Arc::from(input.read_vec(num_bytes)?))
        } else {
            let index_len = bytes_per_index_entry as u64 * num_leaves as u64;
            if index_len > input.length()? {
                return Err(input.corrupt(format!("legacy index of {index_len} bytes")));
            }
            let split_packed_values = input.read_vec(index_len as usize)?;

            let mut leaf_block_fps = Vec::with_capacity(num_leaves);
            let mut last_fp = 0u64;
            for _ in 0..num_leaves {
                last_fp += input.read_vlong()? as u64;
                leaf_block_fps.push(last_fp);
            }
            if num_data_dims == 1 {
                rotate_leaf_block_fps(&mut leaf_block_fps);
            }

            let legacy = LegacyIndex {
                split_packed_values,
                leaf_block_fps,
                bytes_per_index_entry,
                bytes_per_dim,
                num_index_dims,
                version,
            };
            for node_id in 1..num_leaves {
                let split_dim = legacy.split_dim(node_id);
                if split_dim >= num_index_dims {
                    return Err(input.corrupt(format!(
                        "node {node_id} splits on dim {split_dim} of {num_index_dims}"
                    )));
                }
            }
            TreeIndex::Legacy(Arc::new(legacy))
        };

        Ok(BkdReader {
            config,
            version,
            num_leaves,
            min_packed_value,
            max_packed_value,
            point_count,
            doc_count,
            index,
            data: input.into_inner(),
        })
    }

    /// A fresh navigator positioned at the root.
    pub fn index_tree(&self) -> Result<IndexTree> {
        Ok(match &self.index {
            TreeIndex::Packed(bytes) => IndexTree::Packed(PackedIndexTree::new(
                bytes.clone(),
                self.num_leaves,
                self.config.num_index_dims,
                self.config.bytes_per_dim,
            )?),
            TreeIndex::Legacy(legacy) => IndexTree::Legacy(LegacyIndexTree::new(legacy.clone())),
        })
    }

    /// Visit every point inside the visitor's query.
    pub fn intersect<V: IntersectVisitor + ?Sized>(&self, visitor: &mut V) -> Result<()> {
        let mut state = IntersectState {
            input: StructReader::new(self.data.clone_input()?, self.data.name()),
            index: self.index_tree()?,
            cells: self.cell_stack(),
            doc_ids: Vec::with_capacity(self.config.max_points_in_leaf_node),
            common_prefix_lengths: vec![0; self.config.num_data_dims],
            scratch_data: vec![0; self.config.packed_bytes_length()],
            scratch_min: vec![0; self.config.packed_index_bytes_length()],
            scratch_max: vec![0; self.config.packed_index_bytes_length()],
        };
        self.intersect_node(&mut state, visitor)
    }

    /// Estimate how many points match without reading any leaf. Crossing
    /// leaves are assumed to be half matched.
    pub fn estimate_point_count<V: IntersectVisitor + ?Sized>(&self, visitor: &V) -> Result<u64> {
        let mut index = self.index_tree()?;
        let mut cells = self.cell_stack();
        self.estimate_node(&mut index, &mut cells, visitor)
    }

    fn cell_stack(&self) -> CellStack {
        CellStack::new(
            tree_depth(self.num_leaves),
            &self.min_packed_value,
            &self.max_packed_value,
            self.config.bytes_per_dim,
        )
    }

    fn intersect_node<V: IntersectVisitor + ?Sized>(
        &self,
        state: &mut IntersectState,
        visitor: &mut V,
    ) -> Result<()> {
        let level = state.index.level();
        match state.cells.compare(level, &*visitor) {
            Relation::CellOutsideQuery => Ok(()),
            Relation::CellInsideQuery => self.add_all(state, visitor, false),
            Relation::CellCrossesQuery if state.index.is_leaf_node() => {
                // An unbalanced tree's leftmost node may have a single child.
                if state.index.node_exists() {
                    let fp = state.index.leaf_block_fp();
                    let count = self.read_doc_ids(&mut state.input, fp, &mut state.doc_ids)?;
                    self.visit_doc_values(state, visitor, count)?;
                }
                Ok(())
            }
            Relation::CellCrossesQuery => {
                let split_dim = state.index.split_dim();
                state.cells.save_split(level, state.index.split_dim_value());

                state.cells.narrow(level, split_dim, true);
                state.index.push_left()?;
                self.intersect_node(state, visitor)?;
                state.index.pop();

                state.cells.narrow(level, split_dim, false);
                state.index.push_right()?;
                self.intersect_node(state, visitor)?;
                state.index.pop();
                Ok(())
            }
        }
    }

    fn estimate_node<V: IntersectVisitor + ?Sized>(
        &self,
        index: &mut IndexTree,
        cells: &mut CellStack,
        visitor: &V,
    ) -> Result<u64> {
        let level = index.level();
        let max_points = self.config.max_points_in_leaf_node as u64;
        match cells.compare(level, visitor) {
            Relation::CellOutsideQuery => Ok(0),
            Relation::CellInsideQuery => Ok(max_points * index.num_leaves() as u64),
            Relation::CellCrossesQuery if index.is_leaf_node() => Ok(max_points.div_ceil(2)),
            Relation::CellCrossesQuery => {
                let split_dim = index.split_dim();
                cells.save_split(level, index.split_dim_value());

                cells.narrow(level, split_dim, true);
                index.push_left()?;
                let left = self.estimate_node(index, cells, visitor)?;
                index.pop();

                cells.narrow(level, split_dim, false);
                index.push_right()?;
                let right = self.estimate_node(index, cells, visitor)?;
                index.pop();
                Ok(left + right)
            }
        }
    }

    fn add_all<V: IntersectVisitor + ?Sized>(
        &self,
        state: &mut IntersectState,
        visitor: &mut V,
        mut grown: bool,
    ) -> Result<()> {
        if !grown {
            let max_point_count =
                self.config.max_points_in_leaf_node as u64 * state.index.num_leaves() as u64;
            // More than 2B points in total cannot be sized up front.
            if max_point_count <= i32::MAX as u64 {
                visitor.grow(max_point_count as usize);
                grown = true;
            }
        }

        if state.index.is_leaf_node() {
            if state.index.node_exists() {
                let fp = state.index.leaf_block_fp();
                let count = self.read_doc_ids(&mut state.input, fp, &mut state.doc_ids)?;
                for &doc in &state.doc_ids[..count] {
                    visitor.visit(doc)?;
                }
            }
            Ok(())
        } else {
            state.index.push_left()?;
            self.add_all(state, visitor, grown)?;
            state.index.pop();

            state.index.push_right()?;
            self.add_all(state, visitor, grown)?;
            state.index.pop();
            Ok(())
        }
    }

    fn read_doc_ids(
        &self,
        input: &mut StructReader<Box<dyn StorageInput>>,
        block_fp: u64,
        doc_ids: &mut Vec<u32>,
    ) -> Result<usize> {
        input.seek(block_fp)?;
        let count = input.read_vint_len()?;
        if count > self.config.max_points_in_leaf_node {
            return Err(input.corrupt(format!(
                "leaf holds {count} points, more than max_points_in_leaf_node={}",
                self.config.max_points_in_leaf_node
            )));
        }
        doc_ids.clear();
        if self.version < VERSION_COMPRESSED_DOC_IDS {
            doc_ids::read_ints32(input, count, doc_ids)?;
        } else {
            doc_ids::read_ints(input, count, doc_ids)?;
        }
        Ok(count)
    }

    fn visit_doc_values<V: IntersectVisitor + ?Sized>(
        &self,
        state: &mut IntersectState,
        visitor: &mut V,
        count: usize,
    ) -> Result<()> {
        let IntersectState {
            input,
            doc_ids,
            common_prefix_lengths,
            scratch_data,
            scratch_min,
            scratch_max,
            ..
        } = state;
        let bpd = self.config.bytes_per_dim;

        self.read_common_prefixes(input, common_prefix_lengths, scratch_data)?;

        if self.config.num_index_dims != 1 && self.version >= VERSION_LEAF_STORES_BOUNDS {
            let len = self.config.packed_index_bytes_length();
            scratch_min.copy_from_slice(&scratch_data[..len]);
            scratch_max.copy_from_slice(&scratch_data[..len]);
            for dim in 0..self.config.num_index_dims {
                let prefix = common_prefix_lengths[dim];
                input.read_bytes(&mut scratch_min[dim * bpd + prefix..(dim + 1) * bpd])?;
                input.read_bytes(&mut scratch_max[dim * bpd + prefix..(dim + 1) * bpd])?;
            }

            // The leaf's actual bounds can be much tighter than its cell.
            match visitor.compare(&scratch_min[..], &scratch_max[..]) {
                Relation::CellOutsideQuery => return Ok(()),
                Relation::CellInsideQuery => {
                    visitor.grow(count);
                    for &doc in &doc_ids[..count] {
                        visitor.visit(doc)?;
                    }
                    return Ok(());
                }
                Relation::CellCrossesQuery => visitor.grow(count),
            }
        } else {
            visitor.grow(count);
        }

        let compressed_dim = if self.version < VERSION_COMPRESSED_VALUES {
            None
        } else {
            let dim = input.read_u8()? as i8;
            if dim < -1 || dim as i32 >= self.config.num_data_dims as i32 {
                return Err(input.corrupt(format!("Got compressedDim={dim}")));
            }
            (dim >= 0).then_some(dim as usize)
        };

        match compressed_dim {
            None => {
                for &doc in &doc_ids[..count] {
                    self.read_suffixes(input, &common_prefix_lengths[..], scratch_data)?;
                    visitor.visit_value(doc, &scratch_data[..])?;
                }
            }
            Some(compressed_dim) => {
                // One byte of this dim is run-length coded; the rest are verbatim.
                let compressed_byte_offset =
                    compressed_dim * bpd + common_prefix_lengths[compressed_dim];
                common_prefix_lengths[compressed_dim] += 1;
                let mut i = 0;
                while i < count {
                    scratch_data[compressed_byte_offset] = input.read_u8()?;
                    let run_len = input.read_u8()? as usize;
                    if i + run_len > count {
                        break;
                    }
                    for &doc in &doc_ids[i..i + run_len] {
                        self.read_suffixes(input, &common_prefix_lengths[..], scratch_data)?;
                        visitor.visit_value(doc, &scratch_data[..])?;
                    }
                    i += run_len;
                }
                if i != count {
                    return Err(input.corrupt(format!(
                        "Sub blocks do not add up to the expected count: {count} != {i}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn read_common_prefixes(
        &self,
        input: &mut StructReader<Box<dyn StorageInput>>,
        common_prefix_lengths: &mut [usize],
        scratch_data: &mut [u8],
    ) -> Result<()> {
        let bpd = self.config.bytes_per_dim;
        for (dim, prefix_len) in common_prefix_lengths.iter_mut().enumerate() {
            let prefix = input.read_vint_len()?;
            if prefix > bpd {
                return Err(input.corrupt(format!("common prefix {prefix} > bytes_per_dim {bpd}")));
            }
            *prefix_len = prefix;
            input.read_bytes(&mut scratch_data[dim * bpd..dim * bpd + prefix])?;
        }
        Ok(())
    }

    fn read_suffixes(
        &self,
        input: &mut StructReader<Box<dyn StorageInput>>,
        common_prefix_lengths: &[usize],
        scratch_data: &mut [u8],
    ) -> Result<()> {
        let bpd = self.config.bytes_per_dim;
        for (dim, &prefix) in common_prefix_lengths.iter().enumerate() {
            input.read_bytes(&mut scratch_data[dim * bpd + prefix..(dim + 1) * bpd])?;
        }
        Ok(())
    }

    /// File pointer of the first leaf block on disk.
    pub fn min_leaf_block_fp(&self) -> Result<u64> {
        match &self.index {
            TreeIndex::Packed(bytes) => {
                let mut input =
                    StructReader::new(std::io::Cursor::new(bytes.clone()), "packed index");
                Ok(input.read_vlong()? as u64)
            }
            TreeIndex::Legacy(legacy) => {
                Ok(legacy.leaf_block_fps.iter().copied().min().unwrap_or(0))
            }
        }
    }

    pub fn config(&self) -> &BkdConfig {
        &self.config
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn min_packed_value(&self) -> &[u8] {
        &self.min_packed_value
    }

    pub fn max_packed_value(&self) -> &[u8] {
        &self.max_packed_value
    }

    pub fn num_data_dims(&self) -> usize {
        self.config.num_data_dims
    }

    pub fn num_index_dims(&self) -> usize {
        self.config.num_index_dims
    }

    pub fn bytes_per_dim(&self) -> usize {
        self.config.bytes_per_dim
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// Total number of points.
    pub fn size(&self) -> u64 {
        self.point_count
    }

    /// Number of distinct docs with at least one point.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Heap held by the in-memory index.
    pub fn ram_bytes_used(&self) -> usize {
        match &self.index {
            TreeIndex::Packed(bytes) => bytes.len(),
            TreeIndex::Legacy(legacy) => legacy.ram_bytes_used(),
        }
    }
}
