//! Index sorting.
//!
//! An [`IndexSort`] orders the documents of a segment by one or more doc
//! values fields. Flushed segments are sorted on their own with a
//! [`Sorter`]; merges interleave already sorted segments with
//! [`MultiSorter`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::codec::DocValuesProducer;
use crate::error::{Result, SegmergeError};
use crate::index::doc_map::DocMap;
use crate::util::bit_util::unsigned_bits_required;
use crate::util::bits::{Bits, FixedBitSet};
use crate::util::packed::{self, Mutable};

/// Type of the doc values a sort field reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortFieldType {
    /// Numeric doc values holding an int.
    Int,
    /// Numeric doc values holding a long.
    Long,
    /// Numeric doc values holding the raw bits of an `f32`.
    Float,
    /// Numeric doc values holding the raw bits of an `f64`.
    Double,
    /// Sorted doc values, compared as unsigned bytes.
    String,
}

impl SortFieldType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, SortFieldType::String)
    }
}

/// Where documents without a value go.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValue {
    First,
    Last,
    /// Sort as if the document held this value.
    Long(i64),
    /// Sort as if the document held this value.
    Double(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub field_type: SortFieldType,
    #[serde(default)]
    pub reverse: bool,
    /// Numeric fields default to a missing value of zero, strings to first.
    #[serde(default)]
    pub missing: Option<MissingValue>,
}

impl SortField {
    pub fn new(field: impl Into<String>, field_type: SortFieldType) -> Self {
        SortField {
            field: field.into(),
            field_type,
            reverse: false,
            missing: None,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn with_missing(mut self, missing: MissingValue) -> Self {
        self.missing = Some(missing);
        self
    }

    /// Missing value in the raw doc values encoding of this field, if one
    /// is substituted.
    fn missing_raw(&self) -> Option<i64> {
        match (self.missing, self.field_type) {
            (None, t) if t.is_numeric() => Some(0),
            (Some(MissingValue::Long(v)), SortFieldType::Float) => {
                Some((v as f32).to_bits() as i32 as i64)
            }
            (Some(MissingValue::Long(v)), SortFieldType::Double) => Some((v as f64).to_bits() as i64),
            (Some(MissingValue::Long(v)), _) => Some(v),
            (Some(MissingValue::Double(v)), SortFieldType::Float) => {
                Some((v as f32).to_bits() as i32 as i64)
            }
            (Some(MissingValue::Double(v)), SortFieldType::Double) => Some(v.to_bits() as i64),
            (Some(MissingValue::Double(v)), _) => Some(v as i64),
            _ => None,
        }
    }

    fn missing_last(&self) -> bool {
        matches!(self.missing, Some(MissingValue::Last))
    }

    fn compare_raw(&self, a: i64, b: i64) -> Ordering {
        match self.field_type {
            SortFieldType::Float => {
                f32::from_bits(a as u32).total_cmp(&f32::from_bits(b as u32))
            }
            SortFieldType::Double => f64::from_bits(a as u64).total_cmp(&f64::from_bits(b as u64)),
            _ => a.cmp(&b),
        }
    }

    fn compare(&self, a: &SortColumn, a_doc: u32, b: &SortColumn, b_doc: u32) -> Ordering {
        let order = match (a, b) {
            (SortColumn::Numeric(a), SortColumn::Numeric(b)) => {
                let missing = self.missing_raw();
                match (a[a_doc as usize].or(missing), b[b_doc as usize].or(missing)) {
                    (Some(x), Some(y)) => self.compare_raw(x, y),
                    (x, y) => compare_missing(x.is_none(), y.is_none(), self.missing_last()),
                }
            }
            (SortColumn::Bytes(a), SortColumn::Bytes(b)) => {
                match (&a[a_doc as usize], &b[b_doc as usize]) {
                    (Some(x), Some(y)) => x.cmp(y),
                    (x, y) => compare_missing(x.is_none(), y.is_none(), self.missing_last()),
                }
            }
            _ => Ordering::Equal,
        };
        if self.reverse { order.reverse() } else { order }
    }
}

fn compare_missing(a_missing: bool, b_missing: bool, missing_last: bool) -> Ordering {
    let order = match (a_missing, b_missing) {
        (true, true) | (false, false) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
    };
    if missing_last { order.reverse() } else { order }
}

/// Sort order of the documents in a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSort {
    pub fields: Vec<SortField>,
}

impl IndexSort {
    pub fn new(fields: Vec<SortField>) -> Self {
        IndexSort { fields }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(SegmergeError::invalid_argument("index sort needs at least one field"));
        }
        for field in &self.fields {
            if field.field_type == SortFieldType::String
                && matches!(field.missing, Some(MissingValue::Long(_) | MissingValue::Double(_)))
            {
                return Err(SegmergeError::invalid_argument(format!(
                    "string sort field \"{}\" only accepts first or last as missing value",
                    field.field
                )));
            }
        }
        Ok(())
    }

    /// Compare doc `a_doc` of one leaf with doc `b_doc` of another. Ties
    /// are left to the caller.
    pub fn compare(
        &self,
        a: &LeafSortKeys,
        a_doc: u32,
        b: &LeafSortKeys,
        b_doc: u32,
    ) -> Ordering {
        for (i, field) in self.fields.iter().enumerate() {
            let order = field.compare(&a.columns[i], a_doc, &b.columns[i], b_doc);
            if order != Ordering::Equal {
                return order;
            }
        }
        Ordering::Equal
    }
}

/// Per-document values of one sort field.
#[derive(Debug, Clone, PartialEq)]
pub enum SortColumn {
    Numeric(Vec<Option<i64>>),
    Bytes(Vec<Option<Vec<u8>>>),
}

/// Sort values of every document of one segment, one column per sort field.
#[derive(Debug, Clone)]
pub struct LeafSortKeys {
    columns: Vec<SortColumn>,
    max_doc: u32,
}

impl LeafSortKeys {
    pub fn from_columns(columns: Vec<SortColumn>, max_doc: u32) -> Self {
        LeafSortKeys { columns, max_doc }
    }

    /// Read the sort columns from a segment's doc values. Fields the segment
    /// has no values for come back all missing.
    pub fn load(
        sort: &IndexSort,
        doc_values: Option<&dyn DocValuesProducer>,
        max_doc: u32,
    ) -> Result<Self> {
        let mut columns = Vec::with_capacity(sort.fields.len());
        for field in &sort.fields {
            let column = if field.field_type.is_numeric() {
                let values = doc_values.and_then(|dv| dv.numeric(&field.field));
                SortColumn::Numeric(
                    (0..max_doc)
                        .map(|doc| values.and_then(|v| v.get(doc)))
                        .collect(),
                )
            } else {
                let values = doc_values.and_then(|dv| dv.sorted(&field.field));
                SortColumn::Bytes(
                    (0..max_doc)
                        .map(|doc| values.and_then(|v| v.get(doc)).map(<[u8]>::to_vec))
                        .collect(),
                )
            };
            columns.push(column);
        }
        Ok(LeafSortKeys { columns, max_doc })
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }
}

/// Permutation of one segment's docs into sorted order.
#[derive(Debug, Clone)]
pub struct LeafDocMap {
    old_to_new: Mutable,
    new_to_old: Mutable,
}

impl LeafDocMap {
    pub fn from_new_to_old(new_to_old: &[u32]) -> Self {
        let size = new_to_old.len();
        let bits = unsigned_bits_required(size.saturating_sub(1) as u64);
        let mut forward = packed::get_mutable(size, bits);
        let mut backward = packed::get_mutable(size, bits);
        for (new_doc, &old_doc) in new_to_old.iter().enumerate() {
            backward.set(new_doc, old_doc as u64);
            forward.set(old_doc as usize, new_doc as u64);
        }
        LeafDocMap {
            old_to_new: forward,
            new_to_old: backward,
        }
    }

    pub fn old_to_new(&self, doc: u32) -> u32 {
        self.old_to_new.get(doc as usize) as u32
    }

    pub fn new_to_old(&self, doc: u32) -> u32 {
        self.new_to_old.get(doc as usize) as u32
    }

    pub fn size(&self) -> usize {
        self.new_to_old.size()
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.old_to_new.ram_bytes_used() + self.new_to_old.ram_bytes_used()
    }
}

/// Sorts the documents of a single segment.
#[derive(Debug)]
pub struct Sorter<'a> {
    sort: &'a IndexSort,
}

impl<'a> Sorter<'a> {
    pub fn new(sort: &'a IndexSort) -> Self {
        Sorter { sort }
    }

    /// The doc map that sorts this leaf, or `None` when it is already in
    /// order.
    pub fn sort(&self, keys: &LeafSortKeys) -> Option<LeafDocMap> {
        let max_doc = keys.max_doc();
        let in_order = (1..max_doc)
            .all(|doc| self.sort.compare(keys, doc - 1, keys, doc) != Ordering::Greater);
        if in_order {
            return None;
        }
        let mut new_to_old: Vec<u32> = (0..max_doc).collect();
        // Stable: ties keep their original order.
        new_to_old.sort_by(|&a, &b| self.sort.compare(keys, a, keys, b));
        Some(LeafDocMap::from_new_to_old(&new_to_old))
    }
}

/// One sorted segment taking part in a merge. Docs are addressed in sorted
/// ("view") order; `doc_map` translates them back to the segment's own ids,
/// which index `keys` and `live_docs`.
#[derive(Debug, Clone, Copy)]
pub struct SortedLeaf<'a> {
    pub keys: &'a LeafSortKeys,
    pub doc_map: Option<&'a LeafDocMap>,
    pub live_docs: Option<&'a FixedBitSet>,
}

impl SortedLeaf<'_> {
    fn original(&self, view_doc: u32) -> u32 {
        match self.doc_map {
            Some(map) => map.new_to_old(view_doc),
            None => view_doc,
        }
    }

    fn next_live(&self, from: u32) -> Option<u32> {
        (from..self.keys.max_doc()).find(|&view_doc| match self.live_docs {
            Some(live) => live.get(self.original(view_doc) as usize),
            None => true,
        })
    }
}

struct LeafCursor<'a> {
    sort: &'a IndexSort,
    leaf: SortedLeaf<'a>,
    index: usize,
    view_doc: u32,
}

impl LeafCursor<'_> {
    fn order(&self, other: &Self) -> Ordering {
        self.sort
            .compare(
                self.leaf.keys,
                self.leaf.original(self.view_doc),
                other.leaf.keys,
                other.leaf.original(other.view_doc),
            )
            .then(self.index.cmp(&other.index))
            .then(self.view_doc.cmp(&other.view_doc))
    }
}

impl PartialEq for LeafCursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.order(other) == Ordering::Equal
    }
}

impl Eq for LeafCursor<'_> {}

impl PartialOrd for LeafCursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LeafCursor<'_> {
    // Reversed so the max-heap pops the smallest doc first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.order(self)
    }
}

/// K-way merge of sorted segments.
pub struct MultiSorter;

impl MultiSorter {
    /// Doc maps from each leaf's sorted view to merged doc ids, or `None`
    /// when plain concatenation already yields the sort order.
    pub fn sort(sort: &IndexSort, leaves: &[SortedLeaf<'_>]) -> Option<Vec<DocMap>> {
        let total: u64 = leaves.iter().map(|l| l.keys.max_doc() as u64).sum();
        let bits = unsigned_bits_required(total);
        let mut mappings: Vec<Mutable> = leaves
            .iter()
            .map(|l| packed::get_mutable(l.keys.max_doc() as usize, bits))
            .collect();

        let mut queue = BinaryHeap::with_capacity(leaves.len());
        for (index, leaf) in leaves.iter().enumerate() {
            if let Some(view_doc) = leaf.next_live(0) {
                queue.push(LeafCursor {
                    sort,
                    leaf: *leaf,
                    index,
                    view_doc,
                });
            }
        }

        let mut merged_doc = 0u64;
        let mut last: Option<(usize, u32)> = None;
        let mut in_order = true;
        while let Some(mut top) = queue.pop() {
            let position = (top.index, top.view_doc);
            if let Some(previous) = last {
                in_order &= previous < position;
            }
            last = Some(position);
            // Stored shifted by one; zero marks a deleted doc.
            mappings[top.index].set(top.view_doc as usize, merged_doc + 1);
            merged_doc += 1;
            if let Some(next) = top.leaf.next_live(top.view_doc + 1) {
                top.view_doc = next;
                queue.push(top);
            }
        }

        if in_order {
            return None;
        }
        Some(
            mappings
                .into_iter()
                .map(|mapping| DocMap::Explicit { mapping })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_keys(values: &[Option<i64>]) -> LeafSortKeys {
        LeafSortKeys::from_columns(
            vec![SortColumn::Numeric(values.to_vec())],
            values.len() as u32,
        )
    }

    fn long_sort() -> IndexSort {
        IndexSort::new(vec![SortField::new("rank", SortFieldType::Long)])
    }

    #[test]
    fn test_sorter_detects_sorted_leaf() {
        let sort = long_sort();
        let keys = long_keys(&[Some(1), Some(1), Some(4)]);
        assert!(Sorter::new(&sort).sort(&keys).is_none());
    }

    #[test]
    fn test_sorter_builds_permutation() {
        let sort = long_sort();
        let keys = long_keys(&[Some(30), Some(10), None, Some(20)]);
        let map = Sorter::new(&sort).sort(&keys).unwrap();
        // Missing sorts as zero.
        let order: Vec<u32> = (0..4).map(|d| map.new_to_old(d)).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
        for old in 0..4 {
            assert_eq!(map.new_to_old(map.old_to_new(old)), old);
        }
    }

    #[test]
    fn test_reverse_and_missing_last() {
        let sort = IndexSort::new(vec![
            SortField::new("rank", SortFieldType::Long)
                .reversed()
                .with_missing(MissingValue::Last),
        ]);
        let keys = long_keys(&[Some(1), None, Some(5)]);
        let map = Sorter::new(&sort).sort(&keys).unwrap();
        // Reverse flips the missing placement too.
        let order: Vec<u32> = (0..3).map(|d| map.new_to_old(d)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_float_and_string_columns() {
        let float_sort = IndexSort::new(vec![SortField::new("f", SortFieldType::Float)]);
        let raw = |v: f32| Some(v.to_bits() as i32 as i64);
        let keys = long_keys(&[raw(2.5), raw(-1.0), raw(0.5)]);
        let map = Sorter::new(&float_sort).sort(&keys).unwrap();
        assert_eq!(map.new_to_old(0), 1);
        assert_eq!(map.new_to_old(2), 0);

        let string_sort = IndexSort::new(vec![SortField::new("s", SortFieldType::String)]);
        let keys = LeafSortKeys::from_columns(
            vec![SortColumn::Bytes(vec![
                Some(b"b".to_vec()),
                None,
                Some(b"a".to_vec()),
            ])],
            3,
        );
        let map = Sorter::new(&string_sort).sort(&keys).unwrap();
        let order: Vec<u32> = (0..3).map(|d| map.new_to_old(d)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_multi_sorter_interleaves() {
        let sort = long_sort();
        let a = long_keys(&[Some(1), Some(3), Some(5)]);
        let b = long_keys(&[Some(2), Some(4)]);
        let leaves = [
            SortedLeaf {
                keys: &a,
                doc_map: None,
                live_docs: None,
            },
            SortedLeaf {
                keys: &b,
                doc_map: None,
                live_docs: None,
            },
        ];
        let maps = MultiSorter::sort(&sort, &leaves).unwrap();
        let a_docs: Vec<Option<u32>> = (0..3).map(|d| maps[0].get(d)).collect();
        let b_docs: Vec<Option<u32>> = (0..2).map(|d| maps[1].get(d)).collect();
        assert_eq!(a_docs, vec![Some(0), Some(2), Some(4)]);
        assert_eq!(b_docs, vec![Some(1), Some(3)]);
    }

    #[test]
    fn test_multi_sorter_skips_deleted_and_detects_concatenation() {
        let sort = long_sort();
        let a = long_keys(&[Some(1), Some(2)]);
        let b = long_keys(&[Some(0), Some(3)]);
        let mut live = FixedBitSet::new_all_set(2);
        live.clear(0);
        let leaves = [
            SortedLeaf {
                keys: &a,
                doc_map: None,
                live_docs: None,
            },
            SortedLeaf {
                keys: &b,
                doc_map: None,
                live_docs: Some(&live),
            },
        ];
        // With b's first doc deleted the leaves are already in order.
        assert!(MultiSorter::sort(&sort, &leaves).is_none());
    }

    #[test]
    fn test_ties_break_on_segment_order() {
        let sort = long_sort();
        let a = long_keys(&[Some(7), Some(9)]);
        let b = long_keys(&[Some(7)]);
        let leaves = [
            SortedLeaf {
                keys: &a,
                doc_map: None,
                live_docs: None,
            },
            SortedLeaf {
                keys: &b,
                doc_map: None,
                live_docs: None,
            },
        ];
        let maps = MultiSorter::sort(&sort, &leaves).unwrap();
        assert_eq!(maps[0].get(0), Some(0));
        assert_eq!(maps[1].get(0), Some(1));
        assert_eq!(maps[0].get(1), Some(2));
    }
}
