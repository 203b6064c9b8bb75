//! Storage wrapper that remembers which files were created through it.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{IOContext, Storage, StorageInput, StorageOutput};

/// Records every file created through it, so a flush or merge can list the
/// files of the segment it wrote.
#[derive(Debug)]
pub struct TrackingStorage<'a> {
    inner: &'a dyn Storage,
    created: Mutex<BTreeSet<String>>,
}

impl<'a> TrackingStorage<'a> {
    pub fn new(inner: &'a dyn Storage) -> Self {
        TrackingStorage {
            inner,
            created: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn created_files(&self) -> BTreeSet<String> {
        self.created.lock().clone()
    }

    /// Delete everything created so far, ignoring files already gone.
    pub fn delete_created_files(&self) {
        for name in std::mem::take(&mut *self.created.lock()) {
            if let Err(e) = self.inner.delete_file(&name) {
                log::debug!("could not delete {name}: {e}");
            }
        }
    }
}

impl Storage for TrackingStorage<'_> {
    fn open_input(&self, name: &str, context: &IOContext) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(name, context)
    }

    fn create_output(&self, name: &str, context: &IOContext) -> Result<Box<dyn StorageOutput>> {
        let output = self.inner.create_output(name, context)?;
        self.created.lock().insert(name.to_string());
        Ok(output)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)?;
        self.created.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.inner.file_length(name)
    }
}
