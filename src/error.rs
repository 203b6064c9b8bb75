//! Error types for the segmerge crate.

use std::io;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SegmergeError>;

/// The main error type.
#[derive(Error, Debug)]
pub enum SegmergeError {
    /// I/O errors from the storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Structural problem in an index file.
    #[error("corrupt index: {message} (resource={resource}, offset={offset:?})")]
    CorruptIndex {
        message: String,
        resource: String,
        offset: Option<u64>,
    },

    /// The file was written by a format generation older than supported.
    #[error(
        "index format too old: {resource}: version {version} is not supported (needs between {min} and {max})"
    )]
    IndexFormatTooOld {
        resource: String,
        version: i32,
        min: i32,
        max: i32,
    },

    /// The file was written by a format generation newer than supported.
    #[error(
        "index format too new: {resource}: version {version} is not supported (needs between {min} and {max})"
    )]
    IndexFormatTooNew {
        resource: String,
        version: i32,
        min: i32,
        max: i32,
    },

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A named resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A merge was aborted because something it waited on failed.
    #[error("merge aborted: {0}")]
    MergeAborted(String),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl SegmergeError {
    /// Create a corrupt-index error for `resource` at an optional byte offset.
    pub fn corrupt<S: Into<String>, R: Into<String>>(
        msg: S,
        resource: R,
        offset: Option<u64>,
    ) -> Self {
        SegmergeError::CorruptIndex {
            message: msg.into(),
            resource: resource.into(),
            offset,
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        SegmergeError::InvalidArgument(msg.into())
    }

    /// Create an illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        SegmergeError::IllegalState(msg.into())
    }

    /// Create a not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        SegmergeError::NotFound(msg.into())
    }

    /// Create a merge aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        SegmergeError::MergeAborted(msg.into())
    }

    /// Create a generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        SegmergeError::Other(msg.into())
    }

    /// True for errors that indicate on-disk corruption or an unsupported format.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            SegmergeError::CorruptIndex { .. }
                | SegmergeError::IndexFormatTooOld { .. }
                | SegmergeError::IndexFormatTooNew { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_display_names_resource() {
        let err = SegmergeError::corrupt("bad vint", "_0.dim", Some(42));
        let msg = err.to_string();
        assert!(msg.contains("bad vint"));
        assert!(msg.contains("_0.dim"));
        assert!(msg.contains("42"));
        assert!(err.is_format_error());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: SegmergeError = io_err.into();
        assert!(matches!(err, SegmergeError::Io(_)));
        assert!(!err.is_format_error());
    }
}
