//! Segments, their deletes and the machinery that merges them.
//!
//! A segment is written once by a [`segment_writer::SegmentWriter`] and
//! never modified afterwards, except for its live docs. Deletes arrive as
//! frozen packets on a [`buffered_updates::BufferedUpdatesStream`] and are
//! resolved against the segments of a [`reader_pool::ReaderPool`]. Merges
//! combine several segments into one through a
//! [`segment_merger::SegmentMerger`], renumbering documents via the
//! per-segment [`doc_map::DocMap`]s of a [`merge_state::MergeState`].

pub mod buffered_updates;
pub mod config;
pub mod doc_id_merger;
pub mod doc_map;
pub mod document;
pub mod field_infos;
pub mod merge_executor;
pub mod merge_state;
pub mod reader_pool;
pub mod segment_info;
pub mod segment_merger;
pub mod segment_reader;
pub mod segment_writer;
pub mod sort;
pub mod term;
