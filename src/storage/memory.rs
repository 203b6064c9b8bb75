//! Heap-backed storage.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmergeError};
use crate::storage::{IOContext, Storage, StorageInput, StorageOutput};

type FileMap = Arc<RwLock<AHashMap<String, Arc<[u8]>>>>;

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStorageConfig {
    /// Initial byte capacity reserved for each new output.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 4096,
        }
    }
}

/// Storage that keeps every file in memory.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    files: FileMap,
    config: MemoryStorageConfig,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(RwLock::new(AHashMap::new())),
            config,
        }
    }

    /// Total bytes held across all files.
    pub fn total_bytes(&self) -> u64 {
        self.files.read().values().map(|f| f.len() as u64).sum()
    }

    /// Overwrite a single byte of an existing file. Test hook for corruption checks.
    pub fn corrupt_byte(&self, name: &str, offset: usize) -> Result<()> {
        let mut files = self.files.write();
        let data = files
            .get(name)
            .ok_or_else(|| SegmergeError::not_found(name))?;
        let mut bytes = data.to_vec();
        if offset >= bytes.len() {
            return Err(SegmergeError::invalid_argument(format!(
                "offset {offset} beyond length {} of {name}",
                bytes.len()
            )));
        }
        bytes[offset] ^= 0xFF;
        files.insert(name.to_string(), Arc::from(bytes));
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str, _context: &IOContext) -> Result<Box<dyn StorageInput>> {
        let files = self.files.read();
        let data = files
            .get(name)
            .cloned()
            .ok_or_else(|| SegmergeError::not_found(format!("file {name}")))?;
        Ok(Box::new(MemoryInput {
            name: name.to_string(),
            cursor: Cursor::new(data),
        }))
    }

    fn create_output(&self, name: &str, _context: &IOContext) -> Result<Box<dyn StorageOutput>> {
        self.files
            .write()
            .insert(name.to_string(), Arc::from(Vec::new()));
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::with_capacity(self.config.initial_capacity),
            files: Arc::clone(&self.files),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match self.files.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(SegmergeError::not_found(format!("file {name}"))),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.files
            .read()
            .get(name)
            .map(|f| f.len() as u64)
            .ok_or_else(|| SegmergeError::not_found(format!("file {name}")))
    }
}

#[derive(Debug)]
struct MemoryInput {
    name: String,
    cursor: Cursor<Arc<[u8]>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        let mut cursor = Cursor::new(Arc::clone(self.cursor.get_ref()));
        cursor.set_position(self.cursor.position());
        Ok(Box::new(MemoryInput {
            name: self.name.clone(),
            cursor,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl MemoryOutput {
    fn publish(&self) {
        self.files
            .write()
            .insert(self.name.clone(), Arc::from(self.buffer.as_slice()));
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other(format!("{} is closed", self.name)));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn flush_and_sync(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.publish();
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // An abandoned output still leaves its partial bytes behind.
        if !self.closed {
            self.publish();
        }
    }
}
