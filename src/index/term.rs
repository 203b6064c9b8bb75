use std::fmt;

use serde::{Deserialize, Serialize};

/// A term: the field it belongs to and its bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub bytes: Vec<u8>,
}

impl Term {
    pub fn new<F: Into<String>, B: Into<Vec<u8>>>(field: F, bytes: B) -> Self {
        Term {
            field: field.into(),
            bytes: bytes.into(),
        }
    }

    /// Heap held by this term, used for delete accounting.
    pub fn ram_bytes_used(&self) -> usize {
        std::mem::size_of::<Self>() + self.field.len() + self.bytes.len()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, String::from_utf8_lossy(&self.bytes))
    }
}
