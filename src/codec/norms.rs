//! Norms (`.nvm` metadata, `.nvd` data), laid out like numeric doc values.

use std::sync::Arc;

use ahash::AHashMap;

use crate::codec::doc_values::{NumericDocValues, read_numeric, write_numeric};
use crate::codec::{
    NormsConsumer, NormsFormat, NormsProducer, SegmentReadState, SegmentWriteState, codec_util,
};
use crate::error::{Result, SegmergeError};
use crate::index::field_infos::FieldInfo;
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{StorageInput, StorageOutput};

pub const DATA_EXTENSION: &str = "nvd";
pub const META_EXTENSION: &str = "nvm";
pub const DATA_CODEC: &str = "Segmerge10NormsData";
pub const META_CODEC: &str = "Segmerge10NormsMetadata";
pub const VERSION_START: i32 = 0;
pub const VERSION_CURRENT: i32 = VERSION_START;

#[derive(Debug, Clone, Copy)]
pub struct Segmerge10NormsFormat {
    block_size: usize,
}

impl Segmerge10NormsFormat {
    pub fn new(block_size: usize) -> Self {
        Segmerge10NormsFormat { block_size }
    }
}

impl NormsFormat for Segmerge10NormsFormat {
    fn norms_producer(&self, state: &SegmentReadState<'_>) -> Result<Arc<dyn NormsProducer>> {
        Ok(Arc::new(Segmerge10NormsProducer::open(state)?))
    }

    fn norms_consumer(&self, state: &SegmentWriteState<'_>) -> Result<Box<dyn NormsConsumer>> {
        let id = &state.segment_info.id;
        let mut data = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(DATA_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut data, DATA_CODEC, VERSION_CURRENT, id, "")?;
        let mut meta = StructWriter::new(
            state
                .storage
                .create_output(&state.file_name(META_EXTENSION), &state.context)?,
        );
        codec_util::write_index_header(&mut meta, META_CODEC, VERSION_CURRENT, id, "")?;
        Ok(Box::new(Segmerge10NormsConsumer {
            data,
            meta,
            block_size: self.block_size,
            max_doc: state.segment_info.max_doc as usize,
        }))
    }
}

pub struct Segmerge10NormsConsumer {
    data: StructWriter<Box<dyn StorageOutput>>,
    meta: StructWriter<Box<dyn StorageOutput>>,
    block_size: usize,
    max_doc: usize,
}

impl NormsConsumer for Segmerge10NormsConsumer {
    fn add_norms_field(&mut self, info: &FieldInfo, values: &[Option<i64>]) -> Result<()> {
        if !info.has_norms() {
            return Err(SegmergeError::invalid_argument(format!(
                "field \"{}\" does not have norms",
                info.name
            )));
        }
        if values.len() != self.max_doc {
            return Err(SegmergeError::invalid_argument(format!(
                "field \"{}\" has {} norms for {} docs",
                info.name,
                values.len(),
                self.max_doc
            )));
        }
        self.meta.write_vint(info.number as i32)?;
        write_numeric(&mut self.data, &mut self.meta, values, self.block_size)
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.meta.write_vint(-1)?;
        codec_util::write_footer(&mut self.meta)?;
        codec_util::write_footer(&mut self.data)?;
        let this = *self;
        this.meta.close()?;
        this.data.close()
    }
}

#[derive(Debug)]
pub struct Segmerge10NormsProducer {
    norms: AHashMap<String, NumericDocValues>,
    data: Box<dyn StorageInput>,
}

impl Segmerge10NormsProducer {
    pub fn open(state: &SegmentReadState<'_>) -> Result<Self> {
        let id = &state.segment_info.id;
        let meta_name = state.file_name(META_EXTENSION);
        let mut meta =
            StructReader::new(state.storage.open_input(&meta_name, &state.context)?, meta_name);
        codec_util::check_index_header(&mut meta, META_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;

        let data_name = state.file_name(DATA_EXTENSION);
        let data_input = state.storage.open_input(&data_name, &state.context)?;
        let mut data = StructReader::new(data_input.clone_input()?, data_name);
        codec_util::check_index_header(&mut data, DATA_CODEC, VERSION_START, VERSION_CURRENT, id, "")?;
        codec_util::retrieve_checksum(&mut data)?;

        let mut norms = AHashMap::new();
        loop {
            let number = meta.read_vint()?;
            if number == -1 {
                break;
            }
            let name = match state.field_infos.field_info_by_number(number as u32) {
                Some(info) if info.has_norms() => info.name.clone(),
                _ => return Err(meta.corrupt(format!("invalid norms field number: {number}"))),
            };
            norms.insert(name, read_numeric(&mut meta, &mut data)?);
        }
        codec_util::check_footer(&mut meta)?;
        Ok(Segmerge10NormsProducer {
            norms,
            data: data_input,
        })
    }
}

impl NormsProducer for Segmerge10NormsProducer {
    fn norms(&self, field: &str) -> Option<&NumericDocValues> {
        self.norms.get(field)
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
    use crate::index::field_infos::{FieldInfos, IndexOptions};
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::IOContext;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_norms_round_trip_and_omitted_field_rejected() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let info = SegmentInfo::new("_5", 3, "Segmerge10");
        let mut body = FieldInfo::new("body", 0);
        body.index_options = IndexOptions::DocsAndFreqsAndPositions;
        let mut id = FieldInfo::new("id", 1);
        id.index_options = IndexOptions::Docs;
        id.omit_norms = true;
        let infos = FieldInfos::new(vec![body, id]).unwrap();

        let write_state = SegmentWriteState::new(&storage, &info, &infos, IOContext::DEFAULT);
        let mut consumer = Segmerge10NormsFormat::new(64).norms_consumer(&write_state).unwrap();
        assert!(
            consumer
                .add_norms_field(infos.field_info("id").unwrap(), &[Some(1); 3])
                .is_err()
        );
        consumer
            .add_norms_field(infos.field_info("body").unwrap(), &[Some(4), None, Some(12)])
            .unwrap();
        consumer.finish().unwrap();

        let read_state = SegmentReadState::new(&storage, &info, &infos, IOContext::READ);
        let producer = Segmerge10NormsFormat::new(64).norms_producer(&read_state).unwrap();
        let norms = producer.norms("body").unwrap();
        assert_eq!(norms.get(0), Some(4));
        assert_eq!(norms.get(1), None);
        assert_eq!(norms.get(2), Some(12));
        assert!(producer.norms("id").is_none());
        producer.check_integrity().unwrap();
    }
}
