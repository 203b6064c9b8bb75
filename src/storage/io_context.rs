//! Purpose tags attached to every file open.

use serde::{Deserialize, Serialize};

/// Describes the merge an output or input is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInfo {
    pub total_max_doc: u32,
    pub estimated_merge_bytes: u64,
    pub is_external: bool,
    /// -1 when the merge is not a forced merge.
    pub merge_max_num_segments: i32,
}

/// Describes the flush an output is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushInfo {
    pub num_docs: u32,
    pub estimated_segment_size: u64,
}

/// Why a file is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IOContext {
    Default,
    Read { once: bool },
    Flush(FlushInfo),
    Merge(MergeInfo),
}

impl IOContext {
    pub const DEFAULT: IOContext = IOContext::Default;
    pub const READ: IOContext = IOContext::Read { once: false };
    pub const READ_ONCE: IOContext = IOContext::Read { once: true };

    pub fn merge(info: MergeInfo) -> Self {
        IOContext::Merge(info)
    }

    pub fn flush(info: FlushInfo) -> Self {
        IOContext::Flush(info)
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, IOContext::Merge(_))
    }

    pub fn merge_info(&self) -> Option<&MergeInfo> {
        match self {
            IOContext::Merge(info) => Some(info),
            _ => None,
        }
    }
}

impl Default for IOContext {
    fn default() -> Self {
        IOContext::Default
    }
}
