//! In-memory key directory.
//!
//! Maps each live key to the location of its latest record. Point lookups
//! and updates take the lock briefly; the read path holds the read guard
//! across its disk read so a concurrent merge cannot delete the file under
//! it, and merge installation plus full snapshots take the write/read guard
//! for their whole critical section.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;

/// Location of the latest record for a key, uniquely identified by
/// `(file, pos)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Numeric data file name.
    pub file: u32,
    /// Byte offset of the record within the file.
    pub pos: u32,
    /// Full record length, header included.
    pub len: u32,
    /// Append timestamp, seconds since epoch.
    pub ts: u32,
}

/// Shared map guard types, exposed so callers can pin the index state
/// across a dependent disk read.
pub type ReadGuard<'a> = RwLockReadGuard<'a, HashMap<Vec<u8>, IndexEntry>>;
pub type WriteGuard<'a> = RwLockWriteGuard<'a, HashMap<Vec<u8>, IndexEntry>>;

#[derive(Default)]
pub struct KeyDir {
    map: RwLock<HashMap<Vec<u8>, IndexEntry>>,
}

impl KeyDir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        Ok(self.map.read()?.get(key).copied())
    }

    /// Installs an entry, returning the superseded one if any.
    pub fn put(&self, key: Vec<u8>, entry: IndexEntry) -> Result<Option<IndexEntry>> {
        Ok(self.map.write()?.insert(key, entry))
    }

    pub fn remove(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        Ok(self.map.write()?.remove(key))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.map.read()?.contains_key(key))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.map.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.map.read()?.is_empty())
    }

    /// Whether a record read from disk is still the live one for its key:
    /// the index holds the key and points at exactly this `(file, pos)`.
    pub fn has_entry(&self, key: &[u8], file: u32, pos: u32) -> Result<bool> {
        Ok(self
            .map
            .read()?
            .get(key)
            .is_some_and(|e| e.file == file && e.pos == pos))
    }

    /// Pins the index for a dependent read or a full snapshot.
    pub fn read_guard(&self) -> Result<ReadGuard<'_>> {
        Ok(self.map.read()?)
    }

    /// Exclusive access for merge installation and split renames.
    pub fn write_guard(&self) -> Result<WriteGuard<'_>> {
        Ok(self.map.write()?)
    }

    /// Snapshot of the current key set.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.map.read()?.keys().cloned().collect())
    }
}

/// Points every entry referencing `from` at `to` instead, preserving
/// positions. Operates on a held write guard so rotation can pair the
/// on-disk rename with the index update atomically against readers.
pub fn rename_file(guard: &mut WriteGuard<'_>, from: u32, to: u32) -> usize {
    let mut moved = 0;
    for entry in guard.values_mut() {
        if entry.file == from {
            entry.file = to;
            moved += 1;
        }
    }
    moved
}
