//! Points (`.dim` trees, `.dii` field index).
//!
//! `.dim` holds one BKD tree per field, leaves first and index last.
//! `.dii` maps each field number to the file pointer of its tree index.

use std::sync::Arc;

use ahash::AHashMap;

use crate::bkd::{BkdConfig, BkdReader, BkdWriter, OneDimensionBkdWriter};
use crate::codec::{PointsFormat, PointsReader, PointsWriter, SegmentReadState, SegmentWriteState, codec_util};
use crate::error::{Result, SegmergeError};
use crate::index::field_infos::FieldInfo;
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{StorageInput, StorageOutput};

pub const DATA_EXTENSION: &str = "dim";
pub const INDEX_EXTENSION: &str = "dii";
pub const DATA_CODEC: &str = "Segmerge10PointsData";
pub const INDEX_CODEC: &str = "Segmerge10PointsIndex";
pub const VERSION_START: i32 = 0;
pub const VERSION_CURRENT: i32 = VERSION_START;

#[derive(Debug, Clone, Copy)]
pub struct Segmerge10PointsFormat {
    max_points_in_leaf_node: usize,
    /// BKD version the trees are written with.
    version: i32,
}

impl Segmerge10PointsFormat {
    pub fn new(max_points_in_leaf_node: usize, version: i32) -> Self {
        Segmerge10PointsFormat {
            max_points_in_leaf_node,
            version,
        }
    }
}

impl PointsFormat for Segmerge10PointsFormat {
    fn fields_reader(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn PointsReader>> {
        Ok(Arc::new(Segmerge10PointsReader::open(state)?))
    }

    fn fields_writer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn PointsWriter>> {
        let id = &state.segment_info.id;
        let mut data = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(DATA_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut data, DATA_CODEC, VERSION_CURRENT, id, "")?;
        Ok(Box::new(Segmerge10PointsWriter {
            data,
            index: StructWriter::new(
                state
                    .storage
                    .create_output(&state.file_name(INDEX_EXTENSION), &state.context)?,
            ),
            segment_id: *id,
            max_doc: state.segment_info.max_doc,
            max_points_in_leaf_node: self.max_points_in_leaf_node,
            version: self.version,
            index_fps: Vec::new(),
        }))
    }
}

pub struct Segmerge10PointsWriter {
    data: StructWriter<Box<dyn StorageOutput>>,
    index: StructWriter<Box<dyn StorageOutput>>,
    segment_id: [u8; codec_util::ID_LENGTH],
    max_doc: u32,
    max_points_in_leaf_node: usize,
    version: i32,
    index_fps: Vec<(u32, u64)>,
}

impl PointsWriter for Segmerge10PointsWriter {
    fn write_field(&mut self, info: &FieldInfo, mut points: Vec<(Vec<u8>, u32)>) -> Result<()> {
        if !info.has_points() {
            return Err(SegmergeError::invalid_argument(format!(
                "field \"{}\" does not index points",
                info.name
            )));
        }
        let config = BkdConfig::new(
            info.point_data_dims,
            info.point_index_dims,
            info.point_num_bytes,
            self.max_points_in_leaf_node,
        )?;
        let num_points = points.len();
        let index_fp = if config.num_data_dims == 1 {
            points.sort_unstable();
            let mut writer =
                OneDimensionBkdWriter::new(&mut self.data, config, self.max_doc, self.version)?;
            for (value, doc) in &points {
                writer.add(value, *doc)?;
            }
            writer.finish()?
        } else {
            let mut writer = BkdWriter::new(config, self.max_doc)?.with_version(self.version)?;
            for (value, doc) in &points {
                writer.add(value, *doc)?;
            }
            writer.finish(&mut self.data)?
        };
        if let Some(fp) = index_fp {
            log::debug!(
                target: "BKD",
                "wrote {num_points} points of field {} ({} dims) at fp {fp}",
                info.name,
                config.num_data_dims
            );
            self.index_fps.push((info.number, fp));
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        codec_util::write_footer(&mut self.data)?;
        let id = self.segment_id;
        codec_util::write_index_header(&mut self.index, INDEX_CODEC, VERSION_CURRENT, &id, "")?;
        self.index.write_vint(self.index_fps.len() as i32)?;
        for (number, fp) in std::mem::take(&mut self.index_fps) {
            self.index.write_vint(number as i32)?;
            self.index.write_vlong(fp as i64)?;
        }
        codec_util::write_footer(&mut self.index)?;
        let this = *self;
        this.data.close()?;
        this.index.close()
    }
}

#[derive(Debug)]
pub struct Segmerge10PointsReader {
    trees: AHashMap<String, BkdReader>,
    data: Box<dyn StorageInput>,
}

impl Segmerge10PointsReader {
    pub fn open(state: &SegmentReadState<'_>) -> Result<Self> {
        let id = &state.segment_info.id;
        let index_name = state.file_name(INDEX_EXTENSION);
        let mut index =
            StructReader::new(state.storage.open_input(&index_name, &state.context)?, index_name);
        codec_util::check_index_header(&mut index, INDEX_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        let count = index.read_vint_len()?;
        let mut fps = Vec::with_capacity(count);
        for _ in 0..count {
            let number = index.read_vint()? as u32;
            let fp = index.read_vlong()? as u64;
            let name = match state.field_infos.field_info_by_number(number) {
                Some(info) if info.has_points() => info.name.clone(),
                _ => return Err(index.corrupt(format!("invalid points field number: {number}"))),
            };
            fps.push((name, fp));
        }
        codec_util::check_footer(&mut index)?;

        let data_name = state.file_name(DATA_EXTENSION);
        let data_input = state.storage.open_input(&data_name, &state.context)?;
        let mut data = StructReader::new(data_input.clone_input()?, data_name.clone());
        codec_util::check_index_header(&mut data, DATA_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        codec_util::retrieve_checksum(&mut data)?;

        let mut trees = AHashMap::with_capacity(fps.len());
        for (name, fp) in fps {
            let mut tree_input = StructReader::new(data_input.clone_input()?, data_name.clone());
            tree_input.seek(fp)?;
            trees.insert(name, BkdReader::open(tree_input)?);
        }
        Ok(Segmerge10PointsReader {
            trees,
            data: data_input,
        })
    }
}

impl PointsReader for Segmerge10PointsReader {
    fn tree(&self, field: &str) -> Option<&BkdReader> {
        self.trees.get(field)
    }

    fn check_integrity(&self) -> Result<()> {
        let input = self.data.clone_input()?;
        let name = input.name().to_string();
        codec_util::checksum_entire_file(&mut StructReader::new(input, name)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkd::PointRangeVisitor;
    use crate::index::field_infos::FieldInfos;
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::IOContext;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::util::numeric::int_to_sortable_bytes;

    fn infos() -> FieldInfos {
        let mut age = FieldInfo::new("age", 0);
        age.set_point_dimensions(1, 1, 4).unwrap();
        let mut loc = FieldInfo::new("loc", 1);
        loc.set_point_dimensions(2, 2, 4).unwrap();
        let empty = {
            let mut f = FieldInfo::new("empty", 2);
            f.set_point_dimensions(1, 1, 4).unwrap();
            f
        };
        FieldInfos::new(vec![age, loc, empty]).unwrap()
    }

    fn packed(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|&v| int_to_sortable_bytes(v)).collect()
    }

    #[test]
    fn test_write_and_intersect_fields() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let info = SegmentInfo::new("_6", 100, "Segmerge10");
        let infos = infos();
        let format = Segmerge10PointsFormat::new(8, crate::bkd::VERSION_CURRENT);

        let write_state = SegmentWriteState::new(&storage, &info, &infos, IOContext::DEFAULT);
        let mut writer = format.fields_writer(&write_state).unwrap();
        let ages = (0..100u32).rev().map(|d| (packed(&[d as i32 - 50]), d)).collect();
        writer.write_field(infos.field_info("age").unwrap(), ages).unwrap();
        let locs = (0..100u32)
            .map(|d| (packed(&[(d % 10) as i32, (d / 10) as i32]), d))
            .collect();
        writer.write_field(infos.field_info("loc").unwrap(), locs).unwrap();
        writer
            .write_field(infos.field_info("empty").unwrap(), Vec::new())
            .unwrap();
        writer.finish().unwrap();

        let read_state = SegmentReadState::new(&storage, &info, &infos, IOContext::READ);
        let reader = format.fields_reader(&read_state).unwrap();
        assert!(reader.tree("empty").is_none());

        let age = reader.tree("age").unwrap();
        assert_eq!(age.size(), 100);
        let mut visitor = PointRangeVisitor::new(packed(&[-5]), packed(&[4]), 4).unwrap();
        age.intersect(&mut visitor).unwrap();
        let mut docs = visitor.into_docs();
        docs.sort_unstable();
        assert_eq!(docs, (45..55).collect::<Vec<u32>>());

        let loc = reader.tree("loc").unwrap();
        let mut visitor = PointRangeVisitor::new(packed(&[2, 3]), packed(&[3, 3]), 4).unwrap();
        loc.intersect(&mut visitor).unwrap();
        let mut docs = visitor.into_docs();
        docs.sort_unstable();
        assert_eq!(docs, vec![32, 33]);
        reader.check_integrity().unwrap();
    }

    #[test]
    fn test_field_without_points_rejected() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let info = SegmentInfo::new("_6", 1, "Segmerge10");
        let infos = FieldInfos::new(vec![FieldInfo::new("plain", 0)]).unwrap();
        let write_state = SegmentWriteState::new(&storage, &info, &infos, IOContext::DEFAULT);
        let mut writer = Segmerge10PointsFormat::new(8, crate::bkd::VERSION_CURRENT)
            .fields_writer(&write_state)
            .unwrap();
        let err = writer
            .write_field(infos.field_info("plain").unwrap(), vec![(vec![0; 4], 0)])
            .unwrap_err();
        assert!(matches!(err, SegmergeError::InvalidArgument(_)));
    }
}
