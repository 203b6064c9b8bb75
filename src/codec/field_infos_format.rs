//! Field infos file (`.fnm`).
//!
//! After the index header: vint field count, then per field the name, vint
//! number, a flags byte (term vectors, omit norms), the index options byte,
//! the doc values type byte, the doc values generation as a long, the
//! attribute map, and the point shape (vint data dims, then index dims and
//! bytes per dim when data dims is non-zero).

use crate::codec::{FieldInfosFormat, codec_util};
use crate::error::Result;
use crate::index::field_infos::{DocValuesType, FieldInfo, FieldInfos, IndexOptions};
use crate::index::segment_info::{SegmentInfo, segment_file_name};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{IOContext, Storage};

pub const EXTENSION: &str = "fnm";
pub const CODEC_NAME: &str = "Segmerge10FieldInfos";
pub const FORMAT_START: i32 = 0;
pub const FORMAT_SOFT_DELETES: i32 = 1;
pub const FORMAT_SELECTIVE_INDEXING: i32 = 2;
pub const FORMAT_CURRENT: i32 = FORMAT_SELECTIVE_INDEXING;

const STORE_TERMVECTOR: u8 = 0x1;
const OMIT_NORMS: u8 = 0x2;

#[derive(Debug, Clone, Copy, Default)]
pub struct Segmerge10FieldInfosFormat;

impl FieldInfosFormat for Segmerge10FieldInfosFormat {
    fn read(
        &self,
        storage: &dyn Storage,
        segment_info: &SegmentInfo,
        context: &IOContext,
    ) -> Result<FieldInfos> {
        let file_name = segment_file_name(&segment_info.name, "", EXTENSION);
        let mut input = StructReader::new(storage.open_input(&file_name, context)?, file_name);
        let version = codec_util::check_index_header(
            &mut input,
            CODEC_NAME,
            FORMAT_START,
            FORMAT_CURRENT,
            &segment_info.id,
            "",
        )?;

        let num_fields = input.read_vint_len()?;
        let mut infos = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let name = input.read_string()?;
            let number = input.read_vint()?;
            if number < 0 {
                return Err(input.corrupt(format!(
                    "invalid field number for field: {name}, fieldNumber={number}"
                )));
            }
            let bits = input.read_u8()?;
            let index_options = IndexOptions::from_byte(input.read_u8()?)
                .ok_or_else(|| input.corrupt(format!("invalid index options for field {name}")))?;
            let doc_values_type = DocValuesType::from_byte(input.read_u8()?)
                .ok_or_else(|| input.corrupt(format!("invalid doc values type for field {name}")))?;
            let dv_gen = input.read_i64()?;
            let attributes = input.read_map_of_strings()?;

            let point_data_dims = input.read_vint_len()?;
            let (point_index_dims, point_num_bytes) = if point_data_dims != 0 {
                let index_dims = if version >= FORMAT_SELECTIVE_INDEXING {
                    input.read_vint_len()?
                } else {
                    point_data_dims
                };
                (index_dims, input.read_vint_len()?)
            } else {
                (0, 0)
            };

            infos.push(FieldInfo {
                name,
                number: number as u32,
                index_options,
                doc_values_type,
                dv_gen,
                store_term_vectors: bits & STORE_TERMVECTOR != 0,
                omit_norms: bits & OMIT_NORMS != 0,
                point_data_dims,
                point_index_dims,
                point_num_bytes,
                attributes,
            });
        }
        codec_util::check_footer(&mut input)?;
        FieldInfos::new(infos)
    }

    fn write(
        &self,
        storage: &dyn Storage,
        segment_info: &SegmentInfo,
        field_infos: &FieldInfos,
        context: &IOContext,
    ) -> Result<()> {
        let file_name = segment_file_name(&segment_info.name, "", EXTENSION);
        let mut out = StructWriter::new(storage.create_output(&file_name, context)?);
        codec_util::write_index_header(&mut out, CODEC_NAME, FORMAT_CURRENT, &segment_info.id, "")?;
        out.write_vint(field_infos.len() as i32)?;
        for info in field_infos.iter() {
            out.write_string(&info.name)?;
            out.write_vint(info.number as i32)?;
            let mut bits = 0u8;
            if info.store_term_vectors {
                bits |= STORE_TERMVECTOR;
            }
            if info.omit_norms {
                bits |= OMIT_NORMS;
            }
            out.write_u8(bits)?;
            out.write_u8(info.index_options.to_byte())?;
            out.write_u8(info.doc_values_type.to_byte())?;
            out.write_i64(info.dv_gen)?;
            out.write_map_of_strings(&info.attributes)?;
            out.write_vint(info.point_data_dims as i32)?;
            if info.point_data_dims != 0 {
                out.write_vint(info.point_index_dims as i32)?;
                out.write_vint(info.point_num_bytes as i32)?;
            }
        }
        codec_util::write_footer(&mut out)?;
        out.close()
    }
}
