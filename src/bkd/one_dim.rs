//! Streaming writer for sorted one-dimensional points.
//!
//! Merges already produce 1-D points in order, so leaves can be written as
//! soon as they fill up instead of buffering the whole field. Every leaf but
//! the last is full, which leaves the tree unbalanced whenever the leaf
//! count is not a power of two.

use std::io::Write;

use crate::bkd::BkdConfig;
use crate::bkd::writer::{
    TreeSummary, check_max_leaf_node_count, check_version, write_index, write_leaf_block,
};
use crate::error::{Result, SegmergeError};
use crate::storage::structured::StructWriter;
use crate::util::bits::FixedBitSet;

pub struct OneDimensionBkdWriter<'a, W: Write> {
    out: &'a mut StructWriter<W>,
    config: BkdConfig,
    version: i32,
    max_doc: u32,
    leaf_values: Vec<u8>,
    leaf_docs: Vec<u32>,
    last_packed_value: Vec<u8>,
    /// Start value of every leaf but the first.
    leaf_block_start_values: Vec<Vec<u8>>,
    leaf_block_fps: Vec<u64>,
    docs_seen: FixedBitSet,
    min_packed_value: Vec<u8>,
    max_packed_value: Vec<u8>,
    value_count: u64,
}

impl<'a, W: Write> OneDimensionBkdWriter<'a, W> {
    pub fn new(
        out: &'a mut StructWriter<W>,
        config: BkdConfig,
        max_doc: u32,
        version: i32,
    ) -> Result<Self> {
        config.validate()?;
        check_version(&config, version)?;
        if config.num_data_dims != 1 || config.num_index_dims != 1 {
            return Err(SegmergeError::invalid_argument(format!(
                "one dimension writer needs 1 dim, got {}/{}",
                config.num_data_dims, config.num_index_dims
            )));
        }
        let bpd = config.bytes_per_dim;
        Ok(OneDimensionBkdWriter {
            out,
            version,
            max_doc,
            leaf_values: Vec::with_capacity(config.max_points_in_leaf_node * bpd),
            leaf_docs: Vec::with_capacity(config.max_points_in_leaf_node),
            last_packed_value: vec![0; bpd],
            leaf_block_start_values: Vec::new(),
            leaf_block_fps: Vec::new(),
            docs_seen: FixedBitSet::new(max_doc as usize),
            min_packed_value: vec![0; bpd],
            max_packed_value: vec![0; bpd],
            value_count: 0,
            config,
        })
    }

    /// Add the next point. Values must arrive in non-decreasing order.
    pub fn add(&mut self, packed_value: &[u8], doc_id: u32) -> Result<()> {
        let bpd = self.config.bytes_per_dim;
        if packed_value.len() != bpd {
            return Err(SegmergeError::invalid_argument(format!(
                "packed_value should be length={bpd} (got: {})",
                packed_value.len()
            )));
        }
        if doc_id >= self.max_doc {
            return Err(SegmergeError::invalid_argument(format!(
                "doc_id {doc_id} out of bounds for max_doc {}",
                self.max_doc
            )));
        }
        let has_previous = self.value_count > 0 || !self.leaf_docs.is_empty();
        if has_previous && packed_value < self.last_packed_value.as_slice() {
            return Err(SegmergeError::invalid_argument(format!(
                "points are out of order: {packed_value:?} after {:?}",
                self.last_packed_value
            )));
        }
        self.last_packed_value.copy_from_slice(packed_value);

        self.leaf_values.extend_from_slice(packed_value);
        self.leaf_docs.push(doc_id);
        self.docs_seen.set(doc_id as usize);
        if self.leaf_docs.len() == self.config.max_points_in_leaf_node {
            self.write_leaf_block()?;
        }
        Ok(())
    }

    fn write_leaf_block(&mut self) -> Result<()> {
        let bpd = self.config.bytes_per_dim;
        let count = self.leaf_docs.len();
        debug_assert!(count > 0);
        let first = &self.leaf_values[..bpd];
        let last = &self.leaf_values[(count - 1) * bpd..];
        if self.value_count == 0 {
            self.min_packed_value.copy_from_slice(first);
        }
        self.max_packed_value.copy_from_slice(last);
        self.value_count += count as u64;

        if !self.leaf_block_fps.is_empty() {
            self.leaf_block_start_values.push(first.to_vec());
        }
        self.leaf_block_fps.push(self.out.file_pointer());
        check_max_leaf_node_count(&self.config, self.leaf_block_fps.len())?;

        // Sorted input: the first and last values bound the prefix.
        let prefix = first.iter().zip(last).take_while(|(a, b)| a == b).count();
        let mut common_prefix_lengths = [prefix];
        let values: Vec<&[u8]> = self.leaf_values.chunks(bpd).collect();
        write_leaf_block(
            self.out,
            &self.config,
            self.version,
            &self.leaf_docs,
            &values,
            first,
            &mut common_prefix_lengths,
            0,
        )?;

        self.leaf_values.clear();
        self.leaf_docs.clear();
        Ok(())
    }

    /// Flush the last partial leaf and write the index. Returns the index
    /// file pointer, or `None` when no point was added.
    pub fn finish(mut self) -> Result<Option<u64>> {
        if !self.leaf_docs.is_empty() {
            self.write_leaf_block()?;
        }
        if self.value_count == 0 {
            return Ok(None);
        }

        let bpd = self.config.bytes_per_dim;
        let num_leaves = self.leaf_block_fps.len();
        let mut index = vec![0u8; num_leaves * (1 + bpd)];
        self.rotate_to_tree(1, 0, num_leaves - 1, &mut index);

        let index_fp = self.out.file_pointer();
        let summary = TreeSummary {
            config: &self.config,
            version: self.version,
            min_packed_value: &self.min_packed_value,
            max_packed_value: &self.max_packed_value,
            point_count: self.value_count,
            doc_count: self.docs_seen.cardinality(),
        };
        write_index(self.out, &summary, &self.leaf_block_fps, &index)?;
        log::debug!(
            target: "BKD",
            "wrote {} sorted points in {num_leaves} leaves (version={})",
            self.value_count,
            self.version
        );
        Ok(Some(index_fp))
    }

    /// Lay the sorted leaf start values out as a complete binary tree whose
    /// last level fills from the left.
    fn rotate_to_tree(&self, node_id: usize, offset: usize, count: usize, index: &mut [u8]) {
        let bpd = self.config.bytes_per_dim;
        let address = node_id * (1 + bpd) + 1;
        if count == 1 {
            index[address..address + bpd].copy_from_slice(&self.leaf_block_start_values[offset]);
        } else if count > 1 {
            let mut count_at_level = 1;
            let mut total_count = 0;
            loop {
                let count_left = count - total_count;
                if count_left <= count_at_level {
                    let last_left_count = (count_at_level / 2).min(count_left);
                    let left_half = (total_count - 1) / 2 + last_left_count;
                    let root_offset = offset + left_half;
                    index[address..address + bpd]
                        .copy_from_slice(&self.leaf_block_start_values[root_offset]);
                    self.rotate_to_tree(2 * node_id, offset, left_half, index);
                    self.rotate_to_tree(
                        2 * node_id + 1,
                        root_offset + 1,
                        count - left_half - 1,
                        index,
                    );
                    return;
                }
                total_count += count_at_level;
                count_at_level *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkd::{
        BkdReader, IndexTreeNavigation, PointCollector, PointRangeVisitor, VERSION_CURRENT,
        VERSION_IMPLICIT_SPLIT_DIM_1D, VERSION_START,
    };
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::storage::structured::StructReader;
    use crate::storage::{IOContext, Storage};

    fn build(storage: &MemoryStorage, name: &str, version: i32, values: &[u32]) -> BkdReader {
        let config = BkdConfig::new(1, 1, 4, 2).unwrap();
        let output = storage.create_output(name, &IOContext::DEFAULT).unwrap();
        let mut out = StructWriter::new(output);
        let mut writer =
            OneDimensionBkdWriter::new(&mut out, config, values.len() as u32, version).unwrap();
        for (doc, value) in values.iter().enumerate() {
            writer.add(&value.to_be_bytes(), doc as u32).unwrap();
        }
        let fp = writer.finish().unwrap().unwrap();
        out.close().unwrap();

        let input = storage.open_input(name, &IOContext::READ).unwrap();
        let mut input = StructReader::new(input, name);
        input.seek(fp).unwrap();
        BkdReader::open(input).unwrap()
    }

    fn leaf_fps<T: IndexTreeNavigation>(tree: &mut T, out: &mut Vec<(usize, u64)>) {
        if tree.is_leaf_node() {
            if tree.node_exists() {
                out.push((tree.node_id(), tree.leaf_block_fp()));
            }
            return;
        }
        tree.push_left().unwrap();
        leaf_fps(tree, out);
        tree.pop();
        tree.push_right().unwrap();
        leaf_fps(tree, out);
        tree.pop();
    }

    #[test]
    fn test_rejects_out_of_order_points() {
        let mut out = StructWriter::new(Vec::new());
        let config = BkdConfig::one_dimension(4).unwrap();
        let mut writer = OneDimensionBkdWriter::new(&mut out, config, 10, VERSION_CURRENT).unwrap();
        writer.add(&5u32.to_be_bytes(), 0).unwrap();
        writer.add(&5u32.to_be_bytes(), 1).unwrap();
        assert!(writer.add(&4u32.to_be_bytes(), 2).is_err());
    }

    #[test]
    fn test_rejects_multi_dim_config() {
        let mut out = StructWriter::new(Vec::new());
        let config = BkdConfig::new(2, 1, 4, 16).unwrap();
        assert!(OneDimensionBkdWriter::new(&mut out, config, 10, VERSION_CURRENT).is_err());
    }

    #[test]
    fn test_empty_returns_none() {
        let mut out = StructWriter::new(Vec::new());
        let config = BkdConfig::one_dimension(4).unwrap();
        let writer = OneDimensionBkdWriter::new(&mut out, config, 10, VERSION_CURRENT).unwrap();
        assert_eq!(writer.finish().unwrap(), None);
        assert!(out.get_ref().is_empty());
    }

    #[test]
    fn test_legacy_and_packed_indexes_agree_on_unbalanced_tree() {
        // Nine points, two per leaf: five leaves, two of them one level deeper.
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let values: Vec<u32> = (0..9).map(|i| i * 10).collect();
        let legacy = build(&storage, "legacy.dim", VERSION_IMPLICIT_SPLIT_DIM_1D, &values);
        let packed = build(&storage, "packed.dim", VERSION_CURRENT, &values);
        assert_eq!(legacy.num_leaves(), 5);

        let mut legacy_fps = Vec::new();
        leaf_fps(&mut legacy.index_tree().unwrap(), &mut legacy_fps);
        let mut packed_fps = Vec::new();
        leaf_fps(&mut packed.index_tree().unwrap(), &mut packed_fps);
        assert_eq!(legacy_fps.len(), 5);
        assert_eq!(legacy_fps, packed_fps);

        // In-order traversal visits leaves in file order.
        let fps: Vec<u64> = legacy_fps.iter().map(|(_, fp)| *fp).collect();
        assert!(fps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_full_box_and_single_point_queries() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let values: Vec<u32> = vec![1, 3, 3, 8, 13, 21, 34, 55, 89, 144, 233];
        for (name, version) in [
            ("v0.dim", VERSION_START),
            ("v3.dim", VERSION_IMPLICIT_SPLIT_DIM_1D),
            ("v6.dim", VERSION_CURRENT),
        ] {
            let reader = build(&storage, name, version, &values);
            assert_eq!(reader.size(), values.len() as u64);
            assert_eq!(reader.min_packed_value(), &1u32.to_be_bytes());
            assert_eq!(reader.max_packed_value(), &233u32.to_be_bytes());

            let mut all = PointRangeVisitor::new(
                reader.min_packed_value().to_vec(),
                reader.max_packed_value().to_vec(),
                4,
            )
            .unwrap();
            reader.intersect(&mut all).unwrap();
            let mut docs = all.into_docs();
            docs.sort_unstable();
            assert_eq!(docs, (0..values.len() as u32).collect::<Vec<_>>(), "{name}");

            let mut three =
                PointRangeVisitor::new(3u32.to_be_bytes().to_vec(), 3u32.to_be_bytes().to_vec(), 4)
                    .unwrap();
            reader.intersect(&mut three).unwrap();
            let mut docs = three.into_docs();
            docs.sort_unstable();
            assert_eq!(docs, vec![1, 2], "{name}");

            let mut missing =
                PointRangeVisitor::new(4u32.to_be_bytes().to_vec(), 7u32.to_be_bytes().to_vec(), 4)
                    .unwrap();
            reader.intersect(&mut missing).unwrap();
            assert!(missing.docs().is_empty(), "{name}");

            let mut collector = PointCollector::default();
            reader.intersect(&mut collector).unwrap();
            let mut points: Vec<u32> = collector
                .points
                .iter()
                .map(|(_, v)| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
                .collect();
            points.sort_unstable();
            assert_eq!(points, values, "{name}");
        }
    }
}
