//! Per-field metadata and the index-wide field numbering.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmergeError};

/// What the postings of a field record, in increasing order of detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexOptions {
    None,
    Docs,
    DocsAndFreqs,
    DocsAndFreqsAndPositions,
}

impl IndexOptions {
    pub fn has_freqs(self) -> bool {
        self >= IndexOptions::DocsAndFreqs
    }

    pub fn has_positions(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositions
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            IndexOptions::None => 0,
            IndexOptions::Docs => 1,
            IndexOptions::DocsAndFreqs => 2,
            IndexOptions::DocsAndFreqsAndPositions => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => IndexOptions::None,
            1 => IndexOptions::Docs,
            2 => IndexOptions::DocsAndFreqs,
            3 => IndexOptions::DocsAndFreqsAndPositions,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocValuesType {
    None,
    Numeric,
    Binary,
    Sorted,
}

impl DocValuesType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            DocValuesType::None => 0,
            DocValuesType::Numeric => 1,
            DocValuesType::Binary => 2,
            DocValuesType::Sorted => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => DocValuesType::None,
            1 => DocValuesType::Numeric,
            2 => DocValuesType::Binary,
            3 => DocValuesType::Sorted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    pub index_options: IndexOptions,
    pub doc_values_type: DocValuesType,
    /// Generation of doc values updates, -1 when never updated.
    pub dv_gen: i64,
    pub store_term_vectors: bool,
    pub omit_norms: bool,
    pub point_data_dims: usize,
    pub point_index_dims: usize,
    pub point_num_bytes: usize,
    pub attributes: BTreeMap<String, String>,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, number: u32) -> Self {
        FieldInfo {
            name: name.into(),
            number,
            index_options: IndexOptions::None,
            doc_values_type: DocValuesType::None,
            dv_gen: -1,
            store_term_vectors: false,
            omit_norms: false,
            point_data_dims: 0,
            point_index_dims: 0,
            point_num_bytes: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.index_options != IndexOptions::None
    }

    pub fn has_norms(&self) -> bool {
        self.is_indexed() && !self.omit_norms
    }

    pub fn has_doc_values(&self) -> bool {
        self.doc_values_type != DocValuesType::None
    }

    pub fn has_points(&self) -> bool {
        self.point_data_dims != 0
    }

    /// Fold in another sighting of the same field. Index options only
    /// downgrade, norms once omitted stay omitted, and term vectors once
    /// stored stay stored.
    pub fn update_indexing(
        &mut self,
        index_options: IndexOptions,
        store_term_vectors: bool,
        omit_norms: bool,
    ) {
        if self.index_options != index_options {
            if self.index_options == IndexOptions::None {
                self.index_options = index_options;
            } else if index_options != IndexOptions::None {
                self.index_options = self.index_options.min(index_options);
            }
        }
        // Unindexed sightings say nothing about norms or vectors.
        if self.index_options != IndexOptions::None {
            self.store_term_vectors |= store_term_vectors;
            if index_options != IndexOptions::None && self.omit_norms != omit_norms {
                self.omit_norms = true;
            }
        }
    }

    pub fn set_doc_values_type(&mut self, doc_values_type: DocValuesType) -> Result<()> {
        if self.doc_values_type != doc_values_type {
            if self.doc_values_type == DocValuesType::None {
                self.doc_values_type = doc_values_type;
            } else if doc_values_type != DocValuesType::None {
                return Err(SegmergeError::invalid_argument(format!(
                    "cannot change DocValues type from {:?} to {doc_values_type:?} for field \"{}\"",
                    self.doc_values_type, self.name
                )));
            }
        }
        Ok(())
    }

    pub fn set_point_dimensions(
        &mut self,
        data_dims: usize,
        index_dims: usize,
        num_bytes: usize,
    ) -> Result<()> {
        if data_dims == 0 {
            return Ok(());
        }
        if self.point_data_dims == 0 {
            self.point_data_dims = data_dims;
            self.point_index_dims = index_dims;
            self.point_num_bytes = num_bytes;
            return Ok(());
        }
        if (self.point_data_dims, self.point_index_dims, self.point_num_bytes)
            != (data_dims, index_dims, num_bytes)
        {
            return Err(SegmergeError::invalid_argument(format!(
                "cannot change point dimensions from {}/{}x{} to {data_dims}/{index_dims}x{num_bytes} for field=\"{}\"",
                self.point_data_dims, self.point_index_dims, self.point_num_bytes, self.name
            )));
        }
        Ok(())
    }

    /// Merge every property of `other` into this field.
    pub fn update(&mut self, other: &FieldInfo) -> Result<()> {
        self.update_indexing(other.index_options, other.store_term_vectors, other.omit_norms);
        self.set_doc_values_type(other.doc_values_type)?;
        self.set_point_dimensions(
            other.point_data_dims,
            other.point_index_dims,
            other.point_num_bytes,
        )?;
        self.dv_gen = self.dv_gen.max(other.dv_gen);
        for (k, v) in &other.attributes {
            self.attributes.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(())
    }
}

/// Immutable field metadata of one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldInfos {
    by_number: BTreeMap<u32, FieldInfo>,
    by_name: AHashMap<String, u32>,
}

impl FieldInfos {
    pub fn new(infos: Vec<FieldInfo>) -> Result<Self> {
        let mut by_number = BTreeMap::new();
        let mut by_name = AHashMap::new();
        for info in infos {
            if by_name.insert(info.name.clone(), info.number).is_some() {
                return Err(SegmergeError::invalid_argument(format!(
                    "duplicate field name: {}",
                    info.name
                )));
            }
            if let Some(previous) = by_number.insert(info.number, info) {
                return Err(SegmergeError::invalid_argument(format!(
                    "duplicate field number: {}",
                    previous.number
                )));
            }
        }
        Ok(FieldInfos { by_number, by_name })
    }

    pub fn field_info(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).and_then(|n| self.by_number.get(n))
    }

    pub fn field_info_by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.by_number.get(&number)
    }

    /// Fields in number order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_number.values()
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }

    pub fn has_postings(&self) -> bool {
        self.iter().any(FieldInfo::is_indexed)
    }

    pub fn has_freq(&self) -> bool {
        self.iter().any(|f| f.index_options.has_freqs())
    }

    pub fn has_prox(&self) -> bool {
        self.iter().any(|f| f.index_options.has_positions())
    }

    pub fn has_vectors(&self) -> bool {
        self.iter().any(|f| f.store_term_vectors)
    }

    pub fn has_norms(&self) -> bool {
        self.iter().any(FieldInfo::has_norms)
    }

    pub fn has_doc_values(&self) -> bool {
        self.iter().any(FieldInfo::has_doc_values)
    }

    pub fn has_point_values(&self) -> bool {
        self.iter().any(FieldInfo::has_points)
    }
}

#[derive(Debug, Default)]
struct FieldNumbersInner {
    name_to_number: AHashMap<String, u32>,
    number_to_name: AHashMap<u32, String>,
    doc_values_type: AHashMap<String, DocValuesType>,
    dimensions: AHashMap<String, (usize, usize, usize)>,
    lowest_unassigned: u32,
}

/// Index-wide field name to number map, shared by every segment so that a
/// field keeps its number across flushes and merges.
#[derive(Debug, Default)]
pub struct FieldNumbers {
    inner: Mutex<FieldNumbersInner>,
}

impl FieldNumbers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number for `name`, assigning `preferred` if it is still free or the
    /// lowest free number otherwise. Checks the field's doc values type and
    /// point shape against earlier sightings.
    pub fn add_or_get(
        &self,
        name: &str,
        preferred: Option<u32>,
        doc_values_type: DocValuesType,
        dimensions: (usize, usize, usize),
    ) -> Result<u32> {
        let mut inner = self.inner.lock();
        if doc_values_type != DocValuesType::None {
            match inner.doc_values_type.get(name) {
                Some(&current) if current != DocValuesType::None && current != doc_values_type => {
                    return Err(SegmergeError::invalid_argument(format!(
                        "cannot change DocValues type from {current:?} to {doc_values_type:?} for field \"{name}\""
                    )));
                }
                _ => {
                    inner.doc_values_type.insert(name.to_string(), doc_values_type);
                }
            }
        }
        if dimensions.0 != 0 {
            match inner.dimensions.get(name) {
                Some(&current) if current != dimensions => {
                    return Err(SegmergeError::invalid_argument(format!(
                        "cannot change point dimensions from {current:?} to {dimensions:?} for field=\"{name}\""
                    )));
                }
                _ => {
                    inner.dimensions.insert(name.to_string(), dimensions);
                }
            }
        }

        if let Some(&number) = inner.name_to_number.get(name) {
            return Ok(number);
        }
        let number = match preferred {
            Some(p) if !inner.number_to_name.contains_key(&p) => p,
            _ => {
                while inner.number_to_name.contains_key(&inner.lowest_unassigned) {
                    inner.lowest_unassigned += 1;
                }
                inner.lowest_unassigned
            }
        };
        inner.number_to_name.insert(number, name.to_string());
        inner.name_to_number.insert(name.to_string(), number);
        Ok(number)
    }

    pub fn number(&self, name: &str) -> Option<u32> {
        self.inner.lock().name_to_number.get(name).copied()
    }

    pub fn clear(&self) {
        *self.inner.lock() = FieldNumbersInner::default();
    }
}

/// Accumulates field infos for a segment being written.
#[derive(Debug)]
pub struct FieldInfosBuilder {
    global: Arc<FieldNumbers>,
    by_name: BTreeMap<String, FieldInfo>,
}

impl FieldInfosBuilder {
    pub fn new(global: Arc<FieldNumbers>) -> Self {
        FieldInfosBuilder {
            global,
            by_name: BTreeMap::new(),
        }
    }

    /// The builder's entry for `name`, creating it with a global number.
    pub fn get_or_add(&mut self, name: &str) -> Result<&mut FieldInfo> {
        if !self.by_name.contains_key(name) {
            let number =
                self.global
                    .add_or_get(name, None, DocValuesType::None, (0, 0, 0))?;
            self.by_name
                .insert(name.to_string(), FieldInfo::new(name, number));
        }
        self.by_name
            .get_mut(name)
            .ok_or_else(|| SegmergeError::illegal_state(format!("field {name} vanished")))
    }

    /// Merge in a field seen in another segment.
    pub fn add(&mut self, info: &FieldInfo) -> Result<()> {
        let dims = (info.point_data_dims, info.point_index_dims, info.point_num_bytes);
        let number =
            self.global
                .add_or_get(&info.name, Some(info.number), info.doc_values_type, dims)?;
        match self.by_name.get_mut(&info.name) {
            Some(existing) => existing.update(info)?,
            None => {
                let mut copy = info.clone();
                copy.number = number;
                self.by_name.insert(info.name.clone(), copy);
            }
        }
        Ok(())
    }

    /// Record doc values and point shape of a field with the global map.
    pub fn register(&self, info: &FieldInfo) -> Result<()> {
        let dims = (info.point_data_dims, info.point_index_dims, info.point_num_bytes);
        self.global
            .add_or_get(&info.name, Some(info.number), info.doc_values_type, dims)
            .map(|_| ())
    }

    pub fn finish(self) -> Result<FieldInfos> {
        FieldInfos::new(self.by_name.into_values().collect())
    }
}
