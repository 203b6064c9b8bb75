//! # Segmerge
//!
//! Segment merging for a multi-version inverted index.
//!
//! ## Features
//!
//! - Packed-integer codecs: direct, block-packed and monotonic readers
//! - Block k-d trees for multi-dimensional point values
//! - Index sorting with per-segment doc id remapping
//! - Buffered delete packets applied concurrently to pooled segments
//! - A segment merger that drives every codec format in a fixed order
pub mod bkd;
pub mod codec;
mod error;
pub mod index;
pub mod storage;
pub mod util;

// Re-exports for the public API
pub use codec::{Codec, Segmerge10Codec};
pub use error::{Result, SegmergeError};
pub use index::buffered_updates::{BufferedUpdatesStream, FrozenBufferedUpdates};
pub use index::config::MergeConfig;
pub use index::doc_map::DocMap;
pub use index::document::{Document, StoredDocument, StoredValue};
pub use index::merge_executor::MergeExecutor;
pub use index::merge_state::MergeState;
pub use index::reader_pool::ReaderPool;
pub use index::segment_info::{SegmentCommitInfo, SegmentInfo};
pub use index::segment_merger::SegmentMerger;
pub use index::segment_reader::SegmentReader;
pub use index::segment_writer::SegmentWriter;
pub use index::sort::{IndexSort, SortField};
pub use index::term::Term;
pub use storage::{Storage, StorageConfig, StorageFactory};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
