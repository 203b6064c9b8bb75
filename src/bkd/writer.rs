//! Building BKD trees from buffered points.
//!
//! [`BkdWriter`] keeps every added point in memory, then recursively splits
//! them into a balanced tree whose leaf count is a power of two. The leaf
//! block and index encoders in this module are shared with
//! [`OneDimensionBkdWriter`](super::OneDimensionBkdWriter).

use std::cmp::Ordering;
use std::io::Write;

use crate::bkd::doc_ids;
use crate::bkd::reader::rotate_leaf_block_fps;
use crate::bkd::{
    BkdConfig, CODEC_NAME, VERSION_COMPRESSED_DOC_IDS, VERSION_COMPRESSED_VALUES, VERSION_CURRENT,
    VERSION_IMPLICIT_SPLIT_DIM_1D, VERSION_LEAF_STORES_BOUNDS, VERSION_PACKED_INDEX,
    VERSION_SELECTIVE_INDEXING, VERSION_START, compare_dim,
};
use crate::codec::codec_util;
use crate::error::{Result, SegmergeError};
use crate::storage::structured::StructWriter;
use crate::util::bits::FixedBitSet;

// With more than two index dims, bounds are recomputed exactly every this
// many splits so the split choice does not drift.
const SPLITS_BEFORE_EXACT_BOUNDS: usize = 4;

/// Tree-wide values written after the leaf blocks.
pub(super) struct TreeSummary<'a> {
    pub config: &'a BkdConfig,
    pub version: i32,
    pub min_packed_value: &'a [u8],
    pub max_packed_value: &'a [u8],
    pub point_count: u64,
    pub doc_count: usize,
}

pub(super) fn check_version(config: &BkdConfig, version: i32) -> Result<()> {
    if !(VERSION_START..=VERSION_CURRENT).contains(&version) {
        return Err(SegmergeError::invalid_argument(format!(
            "BKD version must be in {VERSION_START}..={VERSION_CURRENT}, got {version}"
        )));
    }
    if version < VERSION_SELECTIVE_INDEXING && config.num_index_dims != config.num_data_dims {
        return Err(SegmergeError::invalid_argument(format!(
            "BKD version {version} cannot index {} of {} dims",
            config.num_index_dims, config.num_data_dims
        )));
    }
    Ok(())
}

pub(super) fn check_max_leaf_node_count(config: &BkdConfig, num_leaves: usize) -> Result<()> {
    if (1 + config.bytes_per_dim) as u64 * num_leaves as u64 > (i32::MAX - 64) as u64 {
        return Err(SegmergeError::illegal_state(format!(
            "too many nodes; increase max_points_in_leaf_node (currently {}) and reindex",
            config.max_points_in_leaf_node
        )));
    }
    Ok(())
}

/// Write one leaf block: count, doc ids, per-dim common prefixes, then the
/// suffixes of every value.
///
/// `values` must be sorted on `sorted_dim` when values are run-length coded.
/// `prefix_source` supplies the common prefix bytes and must be a full
/// packed value.
#[allow(clippy::too_many_arguments)]
pub(super) fn write_leaf_block<W: Write>(
    out: &mut StructWriter<W>,
    config: &BkdConfig,
    version: i32,
    doc_ids: &[u32],
    values: &[&[u8]],
    prefix_source: &[u8],
    common_prefix_lengths: &mut [usize],
    sorted_dim: usize,
) -> Result<()> {
    debug_assert_eq!(doc_ids.len(), values.len());
    let bpd = config.bytes_per_dim;

    out.write_vint(doc_ids.len() as i32)?;
    if version < VERSION_COMPRESSED_DOC_IDS {
        doc_ids::write_doc_ids32(out, doc_ids)?;
    } else {
        doc_ids::write_doc_ids(out, doc_ids)?;
    }

    for (dim, &prefix) in common_prefix_lengths.iter().enumerate() {
        out.write_vint(prefix as i32)?;
        out.write_bytes(&prefix_source[dim * bpd..dim * bpd + prefix])?;
    }

    if config.num_index_dims != 1 && version >= VERSION_LEAF_STORES_BOUNDS {
        write_actual_bounds(out, config, common_prefix_lengths, values)?;
    }

    if version < VERSION_COMPRESSED_VALUES {
        for value in values {
            write_suffixes(out, config, common_prefix_lengths, value)?;
        }
        return Ok(());
    }

    let prefix_len_sum: usize = common_prefix_lengths.iter().sum();
    if prefix_len_sum == config.packed_bytes_length() {
        // Every value in the block is equal.
        out.write_u8(0xFF)?;
        return Ok(());
    }

    debug_assert!(common_prefix_lengths[sorted_dim] < bpd);
    out.write_u8(sorted_dim as u8)?;
    let compressed_byte_offset = sorted_dim * bpd + common_prefix_lengths[sorted_dim];
    common_prefix_lengths[sorted_dim] += 1;
    let mut i = 0;
    while i < values.len() {
        let end = values.len().min(i + 0xFF);
        let prefix_byte = values[i][compressed_byte_offset];
        let run_len = values[i..end]
            .iter()
            .take_while(|v| v[compressed_byte_offset] == prefix_byte)
            .count();
        out.write_u8(prefix_byte)?;
        out.write_u8(run_len as u8)?;
        for value in &values[i..i + run_len] {
            write_suffixes(out, config, common_prefix_lengths, value)?;
        }
        i += run_len;
    }
    Ok(())
}

fn write_suffixes<W: Write>(
    out: &mut StructWriter<W>,
    config: &BkdConfig,
    common_prefix_lengths: &[usize],
    value: &[u8],
) -> Result<()> {
    let bpd = config.bytes_per_dim;
    for (dim, &prefix) in common_prefix_lengths.iter().enumerate() {
        out.write_bytes(&value[dim * bpd + prefix..(dim + 1) * bpd])?;
    }
    Ok(())
}

fn write_actual_bounds<W: Write>(
    out: &mut StructWriter<W>,
    config: &BkdConfig,
    common_prefix_lengths: &[usize],
    values: &[&[u8]],
) -> Result<()> {
    let bpd = config.bytes_per_dim;
    for dim in 0..config.num_index_dims {
        let prefix = common_prefix_lengths[dim];
        if prefix == bpd {
            continue;
        }
        let range = dim * bpd + prefix..(dim + 1) * bpd;
        let mut min = &values[0][range.clone()];
        let mut max = min;
        for value in &values[1..] {
            let candidate = &value[range.clone()];
            if candidate < min {
                min = candidate;
            } else if candidate > max {
                max = candidate;
            }
        }
        out.write_bytes(min)?;
        out.write_bytes(max)?;
    }
    Ok(())
}

/// Write the tree header and index after the leaf blocks.
///
/// `leaf_block_fps` are in file order. `split_packed_values` holds
/// `1 + bytes_per_dim` bytes per node id, the split dim byte first; entry 0
/// is unused.
pub(super) fn write_index<W: Write>(
    out: &mut StructWriter<W>,
    summary: &TreeSummary<'_>,
    leaf_block_fps: &[u64],
    split_packed_values: &[u8],
) -> Result<()> {
    let config = summary.config;
    let version = summary.version;
    codec_util::write_header(out, CODEC_NAME, version)?;
    out.write_vint(config.num_data_dims as i32)?;
    if version >= VERSION_SELECTIVE_INDEXING {
        out.write_vint(config.num_index_dims as i32)?;
    }
    out.write_vint(config.max_points_in_leaf_node as i32)?;
    out.write_vint(config.bytes_per_dim as i32)?;

    debug_assert!(!leaf_block_fps.is_empty());
    out.write_vint(leaf_block_fps.len() as i32)?;
    out.write_bytes(summary.min_packed_value)?;
    out.write_bytes(summary.max_packed_value)?;
    out.write_vlong(summary.point_count as i64)?;
    out.write_vint(summary.doc_count as i32)?;

    if version >= VERSION_PACKED_INDEX {
        let packed_index = pack_index(config, leaf_block_fps, split_packed_values)?;
        out.write_vint(packed_index.len() as i32)?;
        out.write_bytes(&packed_index)
    } else {
        let entry_len = 1 + config.bytes_per_dim;
        if config.num_data_dims == 1 && version >= VERSION_IMPLICIT_SPLIT_DIM_1D {
            // The split dim of a 1-D tree is always 0; drop it.
            for entry in split_packed_values.chunks(entry_len) {
                out.write_bytes(&entry[1..])?;
            }
        } else {
            out.write_bytes(split_packed_values)?;
        }
        let mut last_fp = 0;
        for &fp in leaf_block_fps {
            out.write_vlong((fp - last_fp) as i64)?;
            last_fp = fp;
        }
        Ok(())
    }
}

/// Encode the index as a pre-order walk where each inner node stores its
/// split value prefix-coded against the last split on the same dim.
fn pack_index(
    config: &BkdConfig,
    leaf_block_fps: &[u64],
    split_packed_values: &[u8],
) -> Result<Vec<u8>> {
    let mut leaf_block_fps = leaf_block_fps.to_vec();
    if config.num_data_dims == 1 {
        rotate_leaf_block_fps(&mut leaf_block_fps);
    }
    let mut packer = IndexPacker {
        bytes_per_dim: config.bytes_per_dim,
        num_index_dims: config.num_index_dims,
        leaf_block_fps,
        split_packed_values,
        buffer: StructWriter::new(Vec::new()),
        blocks: Vec::new(),
        last_split_values: vec![0; config.packed_index_bytes_length()],
        negative_deltas: vec![false; config.num_index_dims],
    };
    let total_size = packer.recurse(0, 1, false)?;
    let index = packer.blocks.concat();
    debug_assert_eq!(index.len(), total_size);
    Ok(index)
}

struct IndexPacker<'a> {
    bytes_per_dim: usize,
    num_index_dims: usize,
    leaf_block_fps: Vec<u64>,
    split_packed_values: &'a [u8],
    buffer: StructWriter<Vec<u8>>,
    blocks: Vec<Vec<u8>>,
    last_split_values: Vec<u8>,
    negative_deltas: Vec<bool>,
}

impl IndexPacker<'_> {
    fn append_block(&mut self) -> usize {
        let bytes = std::mem::replace(&mut self.buffer, StructWriter::new(Vec::new())).into_inner();
        let len = bytes.len();
        self.blocks.push(bytes);
        len
    }

    fn left_most_leaf_block_fp(&self, mut node_id: usize) -> u64 {
        let num_leaves = self.leaf_block_fps.len();
        while node_id < num_leaves {
            node_id *= 2;
        }
        self.leaf_block_fps[node_id - num_leaves]
    }

    fn recurse(&mut self, min_block_fp: u64, node_id: usize, is_left: bool) -> Result<usize> {
        let num_leaves = self.leaf_block_fps.len();
        let bpd = self.bytes_per_dim;

        if node_id >= num_leaves {
            let leaf_id = node_id - num_leaves;
            // An unbalanced tree's leftmost node may have a single child.
            if leaf_id >= num_leaves {
                return Ok(0);
            }
            let delta = self.leaf_block_fps[leaf_id] - min_block_fp;
            if is_left {
                debug_assert_eq!(delta, 0);
                return Ok(0);
            }
            self.buffer.write_vlong(delta as i64)?;
            return Ok(self.append_block());
        }

        let left_block_fp = if is_left {
            // The left subtree's leftmost leaf is the parent's minimum.
            min_block_fp
        } else {
            let fp = self.left_most_leaf_block_fp(node_id);
            self.buffer.write_vlong((fp - min_block_fp) as i64)?;
            fp
        };

        let mut address = node_id * (1 + bpd);
        let split_dim = self.split_packed_values[address] as usize;
        address += 1;
        let split_value = &self.split_packed_values[address..address + bpd];
        let last = &self.last_split_values[split_dim * bpd..(split_dim + 1) * bpd];

        let prefix = split_value
            .iter()
            .zip(last)
            .take_while(|(a, b)| a == b)
            .count();
        let first_diff_byte_delta = if prefix < bpd {
            let mut delta = split_value[prefix] as i32 - last[prefix] as i32;
            if self.negative_deltas[split_dim] {
                delta = -delta;
            }
            if delta <= 0 {
                return Err(SegmergeError::illegal_state(format!(
                    "split values of node {node_id} are out of order on dim {split_dim}"
                )));
            }
            delta as usize
        } else {
            0
        };

        let code = (first_diff_byte_delta * (1 + bpd) + prefix) * self.num_index_dims + split_dim;
        self.buffer.write_vint(code as i32)?;
        let suffix = bpd - prefix;
        if suffix > 1 {
            self.buffer.write_bytes(&split_value[prefix + 1..])?;
        }

        // Children prefix-code against this split value.
        let dest = split_dim * bpd + prefix;
        let saved_split_value = self.last_split_values[dest..dest + suffix].to_vec();
        self.last_split_values[dest..dest + suffix].copy_from_slice(&split_value[prefix..]);
        let num_bytes = self.append_block();

        // Placeholder for the left subtree's byte length, so a reader can
        // seek straight to the right subtree.
        let placeholder = self.blocks.len();
        self.blocks.push(Vec::new());

        let saved_negative_delta = self.negative_deltas[split_dim];
        self.negative_deltas[split_dim] = true;
        let left_num_bytes = self.recurse(left_block_fp, 2 * node_id, true)?;

        if node_id * 2 < num_leaves {
            self.buffer.write_vint(left_num_bytes as i32)?;
        } else {
            debug_assert_eq!(left_num_bytes, 0);
        }
        let left_len_bytes =
            std::mem::replace(&mut self.buffer, StructWriter::new(Vec::new())).into_inner();
        let num_bytes2 = left_len_bytes.len();
        self.blocks[placeholder] = left_len_bytes;

        self.negative_deltas[split_dim] = false;
        let right_num_bytes = self.recurse(left_block_fp, 2 * node_id + 1, false)?;
        self.negative_deltas[split_dim] = saved_negative_delta;

        self.last_split_values[dest..dest + suffix].copy_from_slice(&saved_split_value);

        Ok(num_bytes + num_bytes2 + left_num_bytes + right_num_bytes)
    }
}

/// In-memory builder for trees of any dimensionality.
///
/// Points are buffered by [`add`](BkdWriter::add) and written, leaves first
/// and index last, by [`finish`](BkdWriter::finish).
#[derive(Debug)]
pub struct BkdWriter {
    config: BkdConfig,
    version: i32,
    max_doc: u32,
    packed_values: Vec<u8>,
    doc_ids: Vec<u32>,
    docs_seen: FixedBitSet,
    min_packed_value: Vec<u8>,
    max_packed_value: Vec<u8>,
}

impl BkdWriter {
    pub fn new(config: BkdConfig, max_doc: u32) -> Result<Self> {
        config.validate()?;
        check_version(&config, VERSION_CURRENT)?;
        Ok(BkdWriter {
            version: VERSION_CURRENT,
            max_doc,
            packed_values: Vec::new(),
            doc_ids: Vec::new(),
            docs_seen: FixedBitSet::new(max_doc as usize),
            min_packed_value: vec![0xFF; config.packed_index_bytes_length()],
            max_packed_value: vec![0; config.packed_index_bytes_length()],
            config,
        })
    }

    /// Write an older format version instead of the current one.
    pub fn with_version(mut self, version: i32) -> Result<Self> {
        check_version(&self.config, version)?;
        self.version = version;
        Ok(self)
    }

    pub fn config(&self) -> &BkdConfig {
        &self.config
    }

    pub fn point_count(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn add(&mut self, packed_value: &[u8], doc_id: u32) -> Result<()> {
        let packed_bytes_length = self.config.packed_bytes_length();
        if packed_value.len() != packed_bytes_length {
            return Err(SegmergeError::invalid_argument(format!(
                "packed_value should be length={packed_bytes_length} (got: {})",
                packed_value.len()
            )));
        }
        if doc_id >= self.max_doc {
            return Err(SegmergeError::invalid_argument(format!(
                "doc_id {doc_id} out of bounds for max_doc {}",
                self.max_doc
            )));
        }
        let bpd = self.config.bytes_per_dim;
        for dim in 0..self.config.num_index_dims {
            let range = dim * bpd..(dim + 1) * bpd;
            if packed_value[range.clone()] < self.min_packed_value[range.clone()] {
                self.min_packed_value[range.clone()].copy_from_slice(&packed_value[range.clone()]);
            }
            if packed_value[range.clone()] > self.max_packed_value[range.clone()] {
                self.max_packed_value[range.clone()].copy_from_slice(&packed_value[range]);
            }
        }
        self.packed_values.extend_from_slice(packed_value);
        self.doc_ids.push(doc_id);
        self.docs_seen.set(doc_id as usize);
        Ok(())
    }

    fn value(&self, ord: u32) -> &[u8] {
        let len = self.config.packed_bytes_length();
        let start = ord as usize * len;
        &self.packed_values[start..start + len]
    }

    fn compare_on_dim(&self, dim: usize, a: u32, b: u32) -> Ordering {
        compare_dim(self.value(a), self.value(b), dim, self.config.bytes_per_dim)
            .then_with(|| self.doc_ids[a as usize].cmp(&self.doc_ids[b as usize]))
    }

    /// Write all buffered points and return the file pointer of the index,
    /// or `None` when no point was added.
    pub fn finish<W: Write>(self, out: &mut StructWriter<W>) -> Result<Option<u64>> {
        let point_count = self.doc_ids.len();
        if point_count == 0 {
            return Ok(None);
        }

        let mut count_per_leaf = point_count;
        let mut num_leaves = 1;
        while count_per_leaf > self.config.max_points_in_leaf_node {
            count_per_leaf = count_per_leaf.div_ceil(2);
            num_leaves *= 2;
        }
        check_max_leaf_node_count(&self.config, num_leaves)?;

        let mut split_packed_values = vec![0u8; num_leaves * (1 + self.config.bytes_per_dim)];
        let mut leaf_block_fps = vec![0u64; num_leaves];
        let mut ords: Vec<u32> = (0..point_count as u32).collect();
        let mut parent_splits = vec![0usize; self.config.num_index_dims];
        let mut tree = TreeBuild {
            num_leaves,
            split_packed_values: &mut split_packed_values,
            leaf_block_fps: &mut leaf_block_fps,
            parent_splits: &mut parent_splits,
        };
        self.build(
            out,
            &mut tree,
            1,
            &mut ords,
            self.min_packed_value.clone(),
            self.max_packed_value.clone(),
        )?;

        let index_fp = out.file_pointer();
        let summary = TreeSummary {
            config: &self.config,
            version: self.version,
            min_packed_value: &self.min_packed_value,
            max_packed_value: &self.max_packed_value,
            point_count: point_count as u64,
            doc_count: self.docs_seen.cardinality(),
        };
        write_index(out, &summary, &leaf_block_fps, &split_packed_values)?;
        log::debug!(
            target: "BKD",
            "wrote {point_count} points in {num_leaves} leaves (dims={}/{}, version={})",
            self.config.num_data_dims,
            self.config.num_index_dims,
            self.version
        );
        Ok(Some(index_fp))
    }

    fn build<W: Write>(
        &self,
        out: &mut StructWriter<W>,
        tree: &mut TreeBuild<'_>,
        node_id: usize,
        ords: &mut [u32],
        mut min_packed_value: Vec<u8>,
        mut max_packed_value: Vec<u8>,
    ) -> Result<()> {
        if node_id >= tree.num_leaves {
            tree.leaf_block_fps[node_id - tree.num_leaves] = out.file_pointer();
            return self.write_leaf(out, ords);
        }

        let bpd = self.config.bytes_per_dim;
        let split_dim = if self.config.num_index_dims == 1 {
            0
        } else {
            if node_id > 1
                && self.config.num_index_dims > 2
                && tree.parent_splits.iter().sum::<usize>() % SPLITS_BEFORE_EXACT_BOUNDS == 0
                && !ords.is_empty()
            {
                self.compute_bounds(ords, &mut min_packed_value, &mut max_packed_value);
            }
            self.split(&min_packed_value, &max_packed_value, tree.parent_splits)
        };

        let mid = ords.len().div_ceil(2);
        if mid < ords.len() {
            ords.select_nth_unstable_by(mid, |&a, &b| self.compare_on_dim(split_dim, a, b));
        }
        let dim_range = split_dim * bpd..(split_dim + 1) * bpd;
        let split_value = match ords.get(mid).or(ords.last()) {
            Some(&ord) => self.value(ord)[dim_range.clone()].to_vec(),
            // Empty cell: any value inside it will do.
            None => min_packed_value[dim_range.clone()].to_vec(),
        };

        let address = node_id * (1 + bpd);
        tree.split_packed_values[address] = split_dim as u8;
        tree.split_packed_values[address + 1..address + 1 + bpd].copy_from_slice(&split_value);

        let (left, right) = ords.split_at_mut(mid);
        let mut left_max = max_packed_value.clone();
        left_max[dim_range.clone()].copy_from_slice(&split_value);
        let mut right_min = min_packed_value.clone();
        right_min[dim_range].copy_from_slice(&split_value);

        tree.parent_splits[split_dim] += 1;
        self.build(out, tree, 2 * node_id, left, min_packed_value, left_max)?;
        self.build(out, tree, 2 * node_id + 1, right, right_min, max_packed_value)?;
        tree.parent_splits[split_dim] -= 1;
        Ok(())
    }

    fn compute_bounds(&self, ords: &[u32], min: &mut [u8], max: &mut [u8]) {
        let bpd = self.config.bytes_per_dim;
        let first = self.value(ords[0]);
        let len = self.config.packed_index_bytes_length();
        min.copy_from_slice(&first[..len]);
        max.copy_from_slice(&first[..len]);
        for &ord in &ords[1..] {
            let value = self.value(ord);
            for dim in 0..self.config.num_index_dims {
                let range = dim * bpd..(dim + 1) * bpd;
                if value[range.clone()] < min[range.clone()] {
                    min[range.clone()].copy_from_slice(&value[range.clone()]);
                } else if value[range.clone()] > max[range.clone()] {
                    max[range.clone()].copy_from_slice(&value[range]);
                }
            }
        }
    }

    /// Pick the split dim: one that has been split less than half as often
    /// as the most split dim, else the dim with the widest span.
    fn split(&self, min: &[u8], max: &[u8], parent_splits: &[usize]) -> usize {
        let bpd = self.config.bytes_per_dim;
        let max_num_splits = parent_splits.iter().copied().max().unwrap_or(0);
        for dim in 0..self.config.num_index_dims {
            if parent_splits[dim] < max_num_splits / 2
                && compare_dim(min, max, dim, bpd) != Ordering::Equal
            {
                return dim;
            }
        }

        let mut split_dim = 0;
        let mut widest: Option<Vec<u8>> = None;
        for dim in 0..self.config.num_index_dims {
            let span = subtract(&max[dim * bpd..(dim + 1) * bpd], &min[dim * bpd..(dim + 1) * bpd]);
            if widest.as_ref().is_none_or(|w| span > *w) {
                widest = Some(span);
                split_dim = dim;
            }
        }
        split_dim
    }

    fn write_leaf<W: Write>(&self, out: &mut StructWriter<W>, ords: &mut [u32]) -> Result<()> {
        let bpd = self.config.bytes_per_dim;
        let num_data_dims = self.config.num_data_dims;

        if ords.is_empty() {
            let mut common_prefix_lengths = vec![bpd; num_data_dims];
            let zeros = vec![0u8; self.config.packed_bytes_length()];
            return write_leaf_block(
                out,
                &self.config,
                self.version,
                &[],
                &[],
                &zeros,
                &mut common_prefix_lengths,
                0,
            );
        }

        let mut common_prefix_lengths = vec![bpd; num_data_dims];
        let first = self.value(ords[0]);
        for &ord in &ords[1..] {
            let value = self.value(ord);
            for (dim, prefix) in common_prefix_lengths.iter_mut().enumerate() {
                let offset = dim * bpd;
                if let Some(j) = (0..*prefix).find(|&j| first[offset + j] != value[offset + j]) {
                    *prefix = j;
                }
            }
        }

        // Run-length code the dim with the fewest distinct bytes right after
        // its common prefix.
        let mut sorted_dim = 0;
        let mut sorted_dim_cardinality = usize::MAX;
        for (dim, &prefix) in common_prefix_lengths.iter().enumerate() {
            if prefix == bpd {
                continue;
            }
            let mut used_bytes = FixedBitSet::new(256);
            for &ord in ords.iter() {
                used_bytes.set(self.value(ord)[dim * bpd + prefix] as usize);
            }
            let cardinality = used_bytes.cardinality();
            if cardinality < sorted_dim_cardinality {
                sorted_dim = dim;
                sorted_dim_cardinality = cardinality;
            }
        }
        ords.sort_unstable_by(|&a, &b| self.compare_on_dim(sorted_dim, a, b));

        let docs: Vec<u32> = ords.iter().map(|&ord| self.doc_ids[ord as usize]).collect();
        let values: Vec<&[u8]> = ords.iter().map(|&ord| self.value(ord)).collect();
        write_leaf_block(
            out,
            &self.config,
            self.version,
            &docs,
            &values,
            values[0],
            &mut common_prefix_lengths,
            sorted_dim,
        )
    }
}

struct TreeBuild<'a> {
    num_leaves: usize,
    split_packed_values: &'a mut [u8],
    leaf_block_fps: &'a mut [u64],
    parent_splits: &'a mut [usize],
}

/// Big-endian `a - b` for equal-length unsigned values with `a >= b`.
fn subtract(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut result = vec![0u8; a.len()];
    let mut borrow = 0i32;
    for i in (0..a.len()).rev() {
        let mut diff = a[i] as i32 - b[i] as i32 - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        result[i] = diff as u8;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkd::{BkdReader, PointCollector, PointRangeVisitor};
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::storage::structured::StructReader;
    use crate::storage::{IOContext, Storage};

    fn write_tree(
        storage: &MemoryStorage,
        name: &str,
        writer: BkdWriter,
    ) -> Option<u64> {
        let output = storage.create_output(name, &IOContext::DEFAULT).unwrap();
        let mut out = StructWriter::new(output);
        let fp = writer.finish(&mut out).unwrap();
        out.close().unwrap();
        fp
    }

    fn open_tree(storage: &MemoryStorage, name: &str, fp: u64) -> BkdReader {
        let input = storage.open_input(name, &IOContext::READ).unwrap();
        let mut input = StructReader::new(input, name);
        input.seek(fp).unwrap();
        BkdReader::open(input).unwrap()
    }

    #[test]
    fn test_subtract_borrows() {
        assert_eq!(subtract(&[1, 0], &[0, 1]), vec![0, 255]);
        assert_eq!(subtract(&[9, 9], &[2, 3]), vec![7, 6]);
    }

    #[test]
    fn test_empty_writer_writes_nothing() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let writer = BkdWriter::new(BkdConfig::one_dimension(4).unwrap(), 10).unwrap();
        assert_eq!(write_tree(&storage, "empty.dim", writer), None);
    }

    #[test]
    fn test_rejects_bad_points() {
        let mut writer = BkdWriter::new(BkdConfig::new(2, 2, 2, 16).unwrap(), 5).unwrap();
        assert!(writer.add(&[1, 2, 3], 0).is_err());
        assert!(writer.add(&[1, 2, 3, 4], 5).is_err());
        assert!(writer.add(&[1, 2, 3, 4], 4).is_ok());
    }

    #[test]
    fn test_old_versions_need_all_dims_indexed() {
        let writer = BkdWriter::new(BkdConfig::new(3, 2, 4, 16).unwrap(), 5).unwrap();
        assert!(writer.with_version(VERSION_LEAF_STORES_BOUNDS).is_err());
        let writer = BkdWriter::new(BkdConfig::new(3, 2, 4, 16).unwrap(), 5).unwrap();
        assert!(writer.with_version(7).is_err());
    }

    #[test]
    fn test_tiny_leaves_and_empty_cells() {
        // Three points with one point per leaf produces four leaves, one empty.
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let config = BkdConfig::new(1, 1, 1, 1).unwrap();
        let mut writer = BkdWriter::new(config, 3).unwrap();
        for (doc, v) in [(0u32, 5u8), (1, 7), (2, 9)] {
            writer.add(&[v], doc).unwrap();
        }
        let fp = write_tree(&storage, "tiny.dim", writer).unwrap();
        let reader = open_tree(&storage, "tiny.dim", fp);
        assert_eq!(reader.num_leaves(), 4);

        let mut all = PointCollector::default();
        reader.intersect(&mut all).unwrap();
        let mut docs: Vec<u32> = all.points.iter().map(|(doc, _)| *doc).collect();
        docs.sort_unstable();
        assert_eq!(docs, vec![0, 1, 2]);

        let mut visitor = PointRangeVisitor::new(vec![7], vec![7], 1).unwrap();
        reader.intersect(&mut visitor).unwrap();
        assert_eq!(visitor.docs(), &[1]);
    }

    #[test]
    fn test_multi_dim_leaf_bounds_skip_blocks() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let config = BkdConfig::new(2, 2, 1, 4).unwrap();
        let mut writer = BkdWriter::new(config, 64).unwrap();
        for doc in 0..64u32 {
            writer.add(&[doc as u8, (63 - doc) as u8], doc).unwrap();
        }
        let fp = write_tree(&storage, "bounds.dim", writer).unwrap();
        let reader = open_tree(&storage, "bounds.dim", fp);
        assert_eq!(reader.size(), 64);
        assert_eq!(reader.doc_count(), 64);
        assert_eq!(reader.min_packed_value(), &[0, 0]);
        assert_eq!(reader.max_packed_value(), &[63, 63]);

        let mut visitor = PointRangeVisitor::new(vec![10, 0], vec![20, 50], 1).unwrap();
        reader.intersect(&mut visitor).unwrap();
        let mut docs = visitor.into_docs();
        docs.sort_unstable();
        assert_eq!(docs, (13..=20).collect::<Vec<_>>());
    }
}
