//! Directory-backed storage using memory-mapped reads.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmergeError};
use crate::storage::{IOContext, Storage, StorageInput, StorageOutput};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Directory that holds the segment files.
    pub path: PathBuf,

    /// Map inputs into memory instead of reading them eagerly.
    pub use_mmap: bool,

    /// Buffer size for outputs.
    pub buffer_size: usize,
}

impl FileStorageConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileStorageConfig {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        FileStorageConfig {
            path: PathBuf::from("./index"),
            use_mmap: true,
            buffer_size: 64 * 1024,
        }
    }
}

/// Storage rooted at a directory.
#[derive(Debug)]
pub struct FileStorage {
    config: FileStorageConfig,
}

impl FileStorage {
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Ok(FileStorage { config })
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(SegmergeError::invalid_argument(format!(
                "invalid file name: {name:?}"
            )));
        }
        Ok(self.config.path.join(name))
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str, _context: &IOContext) -> Result<Box<dyn StorageInput>> {
        let path = self.resolve(name)?;
        let mut file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SegmergeError::not_found(format!("file {name}")),
            _ => SegmergeError::Io(e),
        })?;
        let len = file.metadata()?.len();
        let bytes = if self.config.use_mmap && len > 0 {
            // SAFETY: segment files are write-once; nothing truncates them while mapped.
            let map = unsafe { Mmap::map(&file)? };
            FileBytes::Mapped(Arc::new(map))
        } else {
            let mut data = Vec::with_capacity(len as usize);
            file.read_to_end(&mut data)?;
            FileBytes::Owned(Arc::from(data))
        };
        Ok(Box::new(FileInput {
            name: name.to_string(),
            cursor: Cursor::new(bytes),
        }))
    }

    fn create_output(&self, name: &str, _context: &IOContext) -> Result<Box<dyn StorageOutput>> {
        let path = self.resolve(name)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(FileOutput {
            name: name.to_string(),
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        fs::remove_file(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SegmergeError::not_found(format!("file {name}")),
            _ => SegmergeError::Io(e),
        })
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        let path = self.resolve(name)?;
        Ok(fs::metadata(path)?.len())
    }
}

#[derive(Debug, Clone)]
enum FileBytes {
    Mapped(Arc<Mmap>),
    Owned(Arc<[u8]>),
}

impl AsRef<[u8]> for FileBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Owned(data) => data,
        }
    }
}

#[derive(Debug)]
struct FileInput {
    name: String,
    cursor: Cursor<FileBytes>,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().as_ref().len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        let mut cursor = Cursor::new(self.cursor.get_ref().clone());
        cursor.set_position(self.cursor.position());
        Ok(Box::new(FileInput {
            name: self.name.clone(),
            cursor,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
struct FileOutput {
    name: String,
    writer: Option<BufWriter<File>>,
}

impl FileOutput {
    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("output already closed"))
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl StorageOutput for FileOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn flush_and_sync(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
