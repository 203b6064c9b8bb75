//! Input documents.
//!
//! A [`Document`] is an ordered list of named fields. The same name may
//! appear more than once; text values are then indexed one after another
//! and points become separate points of the same doc.

use serde::{Deserialize, Serialize};

use crate::util::numeric::{int_to_sortable_bytes, long_to_sortable_bytes};

/// A value kept verbatim in the stored fields file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    String(String),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl StoredValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StoredValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            StoredValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            StoredValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StoredValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for StoredValue {
    fn from(value: &str) -> Self {
        StoredValue::String(value.to_string())
    }
}

impl From<String> for StoredValue {
    fn from(value: String) -> Self {
        StoredValue::String(value)
    }
}

impl From<i64> for StoredValue {
    fn from(value: i64) -> Self {
        StoredValue::Long(value)
    }
}

impl From<f64> for StoredValue {
    fn from(value: f64) -> Self {
        StoredValue::Double(value)
    }
}

impl From<Vec<u8>> for StoredValue {
    fn from(value: Vec<u8>) -> Self {
        StoredValue::Bytes(value)
    }
}

/// How one field of a document is indexed.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Split on whitespace and lowercased; indexed with freqs and positions
    /// and normed by token count.
    Text {
        text: String,
        stored: bool,
        term_vectors: bool,
    },
    /// One untokenized term, docs only, no norms.
    Keyword { value: String, stored: bool },
    Stored(StoredValue),
    NumericDocValues(i64),
    BinaryDocValues(Vec<u8>),
    SortedDocValues(Vec<u8>),
    /// A packed point of `num_dims * bytes_per_dim` bytes.
    Point {
        num_dims: usize,
        bytes_per_dim: usize,
        packed: Vec<u8>,
    },
}

impl FieldValue {
    pub fn is_doc_value(&self) -> bool {
        matches!(
            self,
            FieldValue::NumericDocValues(_)
                | FieldValue::BinaryDocValues(_)
                | FieldValue::SortedDocValues(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value,
        });
        self
    }

    /// Indexed and stored text.
    pub fn add_text(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.add_field(
            name,
            FieldValue::Text {
                text: text.into(),
                stored: true,
                term_vectors: false,
            },
        )
    }

    /// Indexed and stored text that also records term vectors.
    pub fn add_text_with_vectors(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.add_field(
            name,
            FieldValue::Text {
                text: text.into(),
                stored: true,
                term_vectors: true,
            },
        )
    }

    pub fn add_keyword(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_field(
            name,
            FieldValue::Keyword {
                value: value.into(),
                stored: true,
            },
        )
    }

    pub fn add_stored(self, name: impl Into<String>, value: impl Into<StoredValue>) -> Self {
        self.add_field(name, FieldValue::Stored(value.into()))
    }

    pub fn add_numeric_doc_value(self, name: impl Into<String>, value: i64) -> Self {
        self.add_field(name, FieldValue::NumericDocValues(value))
    }

    pub fn add_binary_doc_value(self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.add_field(name, FieldValue::BinaryDocValues(value.into()))
    }

    pub fn add_sorted_doc_value(self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.add_field(name, FieldValue::SortedDocValues(value.into()))
    }

    /// A point of sortable-encoded ints, one per dimension.
    pub fn add_int_point(self, name: impl Into<String>, values: &[i32]) -> Self {
        let packed = values.iter().flat_map(|&v| int_to_sortable_bytes(v)).collect();
        self.add_field(
            name,
            FieldValue::Point {
                num_dims: values.len(),
                bytes_per_dim: 4,
                packed,
            },
        )
    }

    /// A point of sortable-encoded longs, one per dimension.
    pub fn add_long_point(self, name: impl Into<String>, values: &[i64]) -> Self {
        let packed = values.iter().flat_map(|&v| long_to_sortable_bytes(v)).collect();
        self.add_field(
            name,
            FieldValue::Point {
                num_dims: values.len(),
                bytes_per_dim: 8,
                packed,
            },
        )
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First field with this name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// The doc value under `name`, skipping stored or indexed fields that
    /// share the name.
    pub fn doc_value(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .filter(|f| f.name == name)
            .map(|f| &f.value)
            .find(|v| v.is_doc_value())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A document read back from the stored fields file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredDocument {
    pub fields: Vec<(String, StoredValue)>,
}

impl StoredDocument {
    pub fn get(&self, name: &str) -> Option<&StoredValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StoredValue> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_field_order() {
        let doc = Document::new()
            .add_text("body", "hello world")
            .add_keyword("id", "7")
            .add_numeric_doc_value("rank", 3)
            .add_int_point("pos", &[1, -1]);
        assert_eq!(doc.len(), 4);
        let names: Vec<&str> = doc.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["body", "id", "rank", "pos"]);
        match doc.get("pos") {
            Some(FieldValue::Point {
                num_dims,
                bytes_per_dim,
                packed,
            }) => {
                assert_eq!((*num_dims, *bytes_per_dim, packed.len()), (2, 4, 8));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stored_value_accessors() {
        assert_eq!(StoredValue::from("a").as_str(), Some("a"));
        assert_eq!(StoredValue::from(5i64).as_long(), Some(5));
        assert_eq!(StoredValue::from(5i64).as_str(), None);
        assert_eq!(StoredValue::from(vec![1u8]).as_bytes(), Some(&[1u8][..]));
    }

    #[test]
    fn test_doc_value_skips_stored_field_of_same_name() {
        let doc = Document::new()
            .add_stored("rank", 3i64)
            .add_numeric_doc_value("rank", 3);
        assert!(matches!(doc.get("rank"), Some(FieldValue::Stored(_))));
        assert_eq!(doc.doc_value("rank"), Some(&FieldValue::NumericDocValues(3)));
        assert_eq!(doc.doc_value("missing"), None);
    }
}
