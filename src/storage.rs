//! Storage abstraction for segment files.
//!
//! The merge subsystem never touches the filesystem directly. Every file is
//! opened through a [`Storage`] implementation together with an
//! [`IOContext`] purpose tag, and read or written through the structured
//! encoders in [`structured`].

use std::fmt::Debug;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod file;
pub mod io_context;
pub mod memory;
pub mod structured;
pub mod tracking;

pub use io_context::{FlushInfo, IOContext, MergeInfo};
pub use tracking::TrackingStorage;

use file::{FileStorage, FileStorageConfig};
use memory::{MemoryStorage, MemoryStorageConfig};

/// A random-access, read-only view of one file.
///
/// Inputs are cheap to clone. Each clone owns an independent cursor, so
/// concurrent readers of the same immutable file never synchronize.
pub trait StorageInput: Read + Seek + Send + Sync + Debug {
    /// Total length of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Clone this input with its own cursor, positioned where this one is.
    fn clone_input(&self) -> Result<Box<dyn StorageInput>>;

    /// Name of the underlying file, used in error messages.
    fn name(&self) -> &str;
}

/// A sequential, write-once output file.
pub trait StorageOutput: Write + Send + Debug {
    /// Name of the file being written.
    fn name(&self) -> &str;

    /// Flush buffered bytes and make them durable.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Flush and release the underlying handle.
    fn close(&mut self) -> Result<()>;
}

/// A flat namespace of files.
pub trait Storage: Send + Sync + Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str, context: &IOContext) -> Result<Box<dyn StorageInput>>;

    /// Create a new file, replacing any existing file of the same name.
    fn create_output(&self, name: &str, context: &IOContext) -> Result<Box<dyn StorageOutput>>;

    /// Whether a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all file names, sorted.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Length of a file in bytes.
    fn file_length(&self, name: &str) -> Result<u64>;
}

/// Configuration selecting a storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Heap-backed storage, mainly for tests and transient merges.
    Memory(MemoryStorageConfig),
    /// Directory-backed storage.
    File(FileStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(MemoryStorageConfig::default())
    }
}

/// Builds a [`Storage`] from a [`StorageConfig`].
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(config) => Ok(Arc::new(MemoryStorage::new(config))),
            StorageConfig::File(config) => Ok(Arc::new(FileStorage::new(config)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_memory() {
        let storage = StorageFactory::create(StorageConfig::default()).unwrap();
        let mut out = storage.create_output("a.bin", &IOContext::DEFAULT).unwrap();
        out.write_all(b"hello").unwrap();
        out.close().unwrap();
        assert!(storage.file_exists("a.bin"));
        assert_eq!(storage.file_length("a.bin").unwrap(), 5);
    }

    #[test]
    fn test_config_json_round_trip() {
        let json = r#"{"type":"memory","initial_capacity":8}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config, StorageConfig::Memory(ref c) if c.initial_capacity == 8));
    }
}
