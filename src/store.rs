//! The store: public API over the data directory, the key directory, and
//! the merger.
//!
//! ## Write path
//!
//! `put` and `delete` hold the write lock across the append, the index
//! update, and the reclaim registration, so writes are linearizable and
//! the index always reflects append order. Rotation happens on the write
//! path when the active file would cross `max_file_size`.
//!
//! ## Read path
//!
//! `get` pins the index read guard across its pooled disk read. Merge
//! deletes files only while holding the index write lock, so a pinned
//! reader never observes a vanishing file.
//!
//! ## Merge
//!
//! `merge_if_needed` is the policy hook: callers decide when to check.
//! `force_merge` first rotates a non-empty active file so its records
//! become mergeable, then compacts every inactive file.

use crate::config::Config;
use crate::datadir::{self, DataDir, ACTIVE_FILE};
use crate::errinput;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::{self, IndexEntry, KeyDir};
use crate::merge::{self, Merger};
use crate::recovery;
use crate::codec::{self, MAX_KEY_SIZE, MAX_VALUE_SIZE};

use std::borrow::Cow;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const LOCK_FILE: &str = "firkin.lock";

/// An embedded append-only key-value store.
pub struct Store {
    config: Config,
    lock: Option<FileLock>,
    data: DataDir,
    index: KeyDir,
    merger: Merger,
    /// Serializes put/delete/rotation end to end.
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub keys: usize,
    pub data_files: usize,
    pub splits: u64,
    pub merges: u64,
    /// Epoch seconds of the last completed merge, 0 if never.
    pub last_merged: u64,
    pub reclaimable_entries: u64,
    pub reclaimable_bytes: u64,
    pub pool_hits: usize,
    pub pool_misses: usize,
}

impl Store {
    /// Open a store with default configuration
    pub fn open(dir: &str) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Open a store with custom configuration
    pub fn open_with_config(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let lock = FileLock::acquire(config.dir.join(LOCK_FILE))?;

        let recovered = recovery::recover(&config)?;
        let data = DataDir::open(&config.dir, config.max_readers)?;

        Ok(Self {
            config,
            lock: Some(lock),
            data,
            index: recovered.index,
            merger: recovered.merger,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Stores a value under a key, durably by the time this returns.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        if value.is_empty() {
            return errinput!("value must not be empty");
        }
        if value.len() > MAX_VALUE_SIZE {
            return errinput!("value exceeds {MAX_VALUE_SIZE} bytes");
        }

        let disk_key = self.disk_key(key);
        let _write = self.write_lock.lock()?;

        self.rotate_if_needed(record_len(disk_key.as_ref(), value))?;
        let (pos, len, ts) = self.data.append(disk_key.as_ref(), value)?;
        let entry = IndexEntry {
            file: ACTIVE_FILE,
            pos,
            len,
            ts,
        };
        if let Some(old) = self.index.put(key.to_vec(), entry)? {
            self.merger.add_reclaim(old.file, old.len);
        }
        Ok(())
    }

    /// Fetches the value for a key, or None if absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;

        // Pin the index so a concurrent merge cannot delete the file this
        // entry points into before the read lands.
        let guard = self.index.read_guard()?;
        let Some(entry) = guard.get(key) else {
            return Ok(None);
        };
        let record = self.data.read(entry)?;
        drop(guard);

        debug_assert_eq!(self.logical_key(&record.key), key);
        debug_assert!(!record.is_tombstone());
        Ok(Some(record.value))
    }

    /// Removes a key. Absent keys are a no-op; present keys get a
    /// tombstone appended before the index entry is dropped.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;

        let disk_key = self.disk_key(key);
        let _write = self.write_lock.lock()?;

        if self.index.get(key)?.is_none() {
            return Ok(());
        }

        self.rotate_if_needed(record_len(disk_key.as_ref(), b""))?;
        let (_, len, _) = self.data.append(disk_key.as_ref(), b"")?;
        if let Some(old) = self.index.remove(key)? {
            self.merger.add_reclaim(old.file, old.len);
        }
        // The tombstone itself is garbage once its file merges.
        self.merger.add_reclaim(ACTIVE_FILE, len);
        Ok(())
    }

    /// Snapshot of the current key set.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.index.keys()
    }

    /// Snapshot of the current values. Reads every live record.
    pub fn values(&self) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let guard = self.index.read_guard()?;
        let mut values = Vec::with_capacity(guard.len());
        for entry in guard.values() {
            values.push(self.data.read(entry)?.value);
        }
        Ok(values)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.index.contains(key)
    }

    /// Fsyncs the active file. Appends are flushed to the OS on return of
    /// `put`; this is the caller's stronger durability hook.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.data.sync()
    }

    /// Compacts inactive files whose reclaimable bytes exceed the
    /// threshold, if more than one qualifies. The caller decides when to
    /// invoke this.
    pub fn merge_if_needed(&self, threshold: u64) -> Result<()> {
        self.ensure_open()?;
        let Some(_guard) = self.merger.try_start() else {
            return Ok(()); // another merge in progress
        };
        let files: Vec<u32> = self
            .merger
            .candidates(threshold)
            .into_iter()
            .filter(|&file| file != ACTIVE_FILE)
            .collect();
        if files.len() < 2 {
            return Ok(());
        }
        merge::merge(
            &self.data,
            &self.index,
            &self.merger,
            &files,
            self.config.prefixed_keys,
        )
    }

    /// Compacts every inactive file. A non-empty active file is rotated
    /// first so its records participate.
    pub fn force_merge(&self) -> Result<()> {
        self.ensure_open()?;
        let Some(_guard) = self.merger.try_start() else {
            return Ok(());
        };

        {
            let _write = self.write_lock.lock()?;
            if self.data.active_len()? > 0 {
                self.rotate()?;
            }
        }

        let files: Vec<u32> = datadir::list_data_files(self.data.dir())?
            .into_iter()
            .filter(|&file| file != ACTIVE_FILE)
            .collect();
        if files.is_empty() {
            return Ok(());
        }
        merge::merge(
            &self.data,
            &self.index,
            &self.merger,
            &files,
            self.config.prefixed_keys,
        )
    }

    /// Point-in-time health snapshot.
    pub fn status(&self) -> Result<Status> {
        self.ensure_open()?;
        let (reclaimable_entries, reclaimable_bytes) = self.merger.totals();
        let (pool_hits, pool_misses) = self.data.pool_stats();
        Ok(Status {
            keys: self.index.len()?,
            data_files: datadir::list_data_files(self.data.dir())?.len(),
            splits: self.data.splits(),
            merges: self.merger.merges(),
            last_merged: self.merger.last_merged(),
            reclaimable_entries,
            reclaimable_bytes,
            pool_hits,
            pool_misses,
        })
    }

    /// Flushes and marks the store closed. Every subsequent operation
    /// fails with `Closed`. The directory lock is held until drop.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.data.close()
    }

    /// Closes the store and removes its directory.
    pub fn destroy(mut self) -> Result<()> {
        self.close()?;
        drop(self.lock.take());
        fs::remove_dir_all(&self.config.dir)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Rotates first when the active file would cross the size threshold.
    /// Called with the write lock held.
    fn rotate_if_needed(&self, incoming: u64) -> Result<()> {
        let len = self.data.active_len()?;
        if len > 0 && len + incoming > self.config.max_file_size {
            self.rotate()?;
        }
        Ok(())
    }

    /// Renames the active file to its inactive slot and repoints index
    /// entries and reclaim accounting, atomically against readers. Called
    /// with the write lock held.
    fn rotate(&self) -> Result<()> {
        let mut guard = self.index.write_guard()?;
        let name = self.data.split()?;
        let moved = index::rename_file(&mut guard, ACTIVE_FILE, name);
        self.merger.rename_reclaim(ACTIVE_FILE, name);
        drop(guard);

        tracing::info!(name = name, moved = moved, "rotated active file");
        Ok(())
    }

    fn disk_key<'a>(&self, key: &'a [u8]) -> Cow<'a, [u8]> {
        if self.config.prefixed_keys {
            Cow::Owned(codec::prefix_key(key))
        } else {
            Cow::Borrowed(key)
        }
    }

    fn logical_key<'a>(&self, disk_key: &'a [u8]) -> &'a [u8] {
        if self.config.prefixed_keys {
            codec::strip_prefix(disk_key)
        } else {
            disk_key
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.data.close();
        drop(self.lock.take());
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return errinput!("key must not be empty");
    }
    if key.len() > MAX_KEY_SIZE {
        return errinput!("key exceeds {MAX_KEY_SIZE} bytes");
    }
    Ok(())
}

fn record_len(disk_key: &[u8], value: &[u8]) -> u64 {
    (codec::HEADER_SIZE + disk_key.len() + value.len()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn open(temp_dir: &TempDir) -> Store {
        Store::open(temp_dir.path().to_str().unwrap()).expect("Failed to open store")
    }

    fn open_small(temp_dir: &TempDir, max_file_size: u64) -> Store {
        Store::open_with_config(Config::new(temp_dir.path()).max_file_size(max_file_size))
            .expect("Failed to open store")
    }

    /// Data and hint files present in a directory, by name.
    fn dir_files(temp_dir: &TempDir) -> HashSet<String> {
        std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|d| d.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != LOCK_FILE)
            .collect()
    }

    fn total_data_bytes(temp_dir: &TempDir) -> u64 {
        std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|d| d.unwrap())
            .filter(|d| {
                datadir::parse_data_name(&d.file_name().to_string_lossy()).is_some()
            })
            .map(|d| d.metadata().unwrap().len())
            .sum()
    }

    #[test]
    fn test_basic_put_get_delete() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open(&temp_dir);

        store.put(b"foo", b"bar").expect("Failed to put");
        store.put(b"baz", b"boo").expect("Failed to put");

        assert_eq!(store.get(b"foo").unwrap(), Some(b"bar".to_vec()));
        assert_eq!(store.get(b"baz").unwrap(), Some(b"boo".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);

        let keys: HashSet<Vec<u8>> = store.keys().unwrap().into_iter().collect();
        assert_eq!(
            keys,
            HashSet::from([b"foo".to_vec(), b"baz".to_vec()])
        );
        assert_eq!(store.values().unwrap().len(), 2);

        store.delete(b"foo").expect("Failed to delete");
        assert_eq!(store.get(b"foo").unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec![b"baz".to_vec()]);
    }

    #[test]
    fn test_last_writer_wins() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open(&temp_dir);

        store.put(b"k", b"v1").expect("put");
        store.put(b"k", b"v2").expect("put");
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.keys().unwrap().len(), 1);
    }

    #[test]
    fn test_input_validation() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open(&temp_dir);

        assert!(matches!(
            store.put(b"", b"v"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.put(b"k", b""),
            Err(Error::InvalidInput(_))
        ));
        let long_key = vec![0u8; MAX_KEY_SIZE + 1];
        assert!(matches!(
            store.put(&long_key, b"v"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(store.delete(b""), Err(Error::InvalidInput(_))));

        // Nothing was written.
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_delete_absent_key_is_noop() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open(&temp_dir);

        let before = total_data_bytes(&temp_dir);
        store.delete(b"ghost").expect("Delete of absent key failed");
        store.sync().expect("sync");
        assert_eq!(total_data_bytes(&temp_dir), before);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        {
            let store = open(&temp_dir);
            store.put(b"a", b"1").expect("put");
            store.put(b"b", b"2").expect("put");
            store.put(b"a", b"3").expect("put");
            store.delete(b"b").expect("delete");
            store.close().expect("close");
        }

        let store = open(&temp_dir);
        assert_eq!(store.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec![b"a".to_vec()]);
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open(&temp_dir);

        store.put(b"k", b"v").expect("put");
        store.close().expect("close");

        assert_eq!(store.put(b"k", b"v"), Err(Error::Closed));
        assert_eq!(store.get(b"k"), Err(Error::Closed));
        assert_eq!(store.delete(b"k"), Err(Error::Closed));
        assert_eq!(store.keys(), Err(Error::Closed));
        assert_eq!(store.force_merge(), Err(Error::Closed));

        // close is idempotent
        store.close().expect("Second close failed");
    }

    #[test]
    fn test_exclusive_directory_access() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store1 = open(&temp_dir);
        store1.put(b"k", b"v").expect("put");

        let result = Store::open(temp_dir.path().to_str().unwrap());
        assert!(
            matches!(result, Err(Error::Io(_))),
            "Second open of a locked directory should fail"
        );

        drop(store1);
        let store2 = open(&temp_dir);
        assert_eq!(store2.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_destroy_removes_directory() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("db");
        let store = Store::open(dir.to_str().unwrap()).expect("open");
        store.put(b"k", b"v").expect("put");
        store.destroy().expect("destroy");
        assert!(!dir.exists());
    }

    #[test]
    fn test_rotation_preserves_reads() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        // Tiny threshold: every put rotates the previous record out.
        let store = open_small(&temp_dir, 1);

        for i in 0..5u8 {
            store
                .put(format!("key{i}").as_bytes(), format!("val{i}").as_bytes())
                .expect("put");
        }

        for i in 0..5u8 {
            assert_eq!(
                store.get(format!("key{i}").as_bytes()).unwrap(),
                Some(format!("val{i}").into_bytes()),
                "key{i} lost after rotation"
            );
        }
        assert_eq!(store.status().unwrap().splits, 4);
    }

    #[test]
    fn test_overwrite_then_merge_leaves_target_hint_and_active() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        // 60 bytes: three 17-byte records fit, the fourth forces rotation.
        let store = open_small(&temp_dir, 60);

        store.put(b"k", b"v1").expect("put");
        store.put(b"k", b"v2").expect("put");
        store.put(b"k", b"v3").expect("put");
        store.put(b"k", b"v4").expect("put"); // rotates v1..v3 into "1"
        assert_eq!(store.status().unwrap().splits, 1);

        store.force_merge().expect("Merge failed");

        assert_eq!(store.get(b"k").unwrap(), Some(b"v4".to_vec()));
        assert_eq!(
            dir_files(&temp_dir),
            HashSet::from(["0".to_string(), "1".to_string(), "1h".to_string()])
        );

        // The merged target holds exactly the one live record.
        let target_len = std::fs::metadata(temp_dir.path().join("1")).unwrap().len();
        assert_eq!(target_len, (codec::HEADER_SIZE + 1 + 2) as u64);

        // And the state survives a reopen through the hint file.
        drop(store);
        let store = open(&temp_dir);
        assert_eq!(store.get(b"k").unwrap(), Some(b"v4".to_vec()));
    }

    #[test]
    fn test_merge_preserves_state_and_shrinks_disk() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_small(&temp_dir, 256);

        for i in 0..50u32 {
            let key = format!("key_{:03}", i % 10);
            let value = format!("value_{i:04}");
            store.put(key.as_bytes(), value.as_bytes()).expect("put");
        }
        store.delete(b"key_003").expect("delete");

        let keys_before: HashSet<Vec<u8>> = store.keys().unwrap().into_iter().collect();
        let bytes_before = total_data_bytes(&temp_dir);

        store.force_merge().expect("Merge failed");

        let keys_after: HashSet<Vec<u8>> = store.keys().unwrap().into_iter().collect();
        assert_eq!(keys_before, keys_after);
        for key in &keys_after {
            let expect_i = (40..50)
                .rev()
                .find(|i| format!("key_{:03}", i % 10).as_bytes() == key.as_slice())
                .expect("unexpected key");
            assert_eq!(
                store.get(key).unwrap(),
                Some(format!("value_{expect_i:04}").into_bytes())
            );
        }
        assert_eq!(store.get(b"key_003").unwrap(), None);

        let bytes_after = total_data_bytes(&temp_dir);
        assert!(
            bytes_after < bytes_before,
            "merge should shrink disk: {bytes_after} >= {bytes_before}"
        );

        let status = store.status().unwrap();
        assert_eq!(status.merges, 1);
        assert!(status.last_merged > 0);
    }

    #[test]
    fn test_tombstone_survives_until_merge() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        {
            let store = open(&temp_dir);
            store.put(b"k", b"v").expect("put");
            store.delete(b"k").expect("delete");
        }

        // The tombstone still persists the deletion across a reopen.
        {
            let store = open(&temp_dir);
            assert_eq!(store.get(b"k").unwrap(), None);
            store.force_merge().expect("Merge failed");
        }

        // After the merge no file carries any record for the key.
        let store = open(&temp_dir);
        assert_eq!(store.get(b"k").unwrap(), None);
        for file in datadir::list_data_files(temp_dir.path()).unwrap() {
            let path = datadir::file_path(temp_dir.path(), file);
            datadir::scan_file(&path, true, |_, record| {
                assert_ne!(record.key, b"k", "record for deleted key survived merge");
                Ok(())
            })
            .expect("scan");
        }
    }

    #[test]
    fn test_merge_if_needed_respects_threshold() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_small(&temp_dir, 64);

        // Two generations of overwrites spread over several files.
        for round in 0..4 {
            for i in 0..4u8 {
                let value = format!("value_{round}_{i}");
                store
                    .put(format!("key{i}").as_bytes(), value.as_bytes())
                    .expect("put");
            }
        }
        let files_before = store.status().unwrap().data_files;

        // A huge threshold merges nothing.
        store.merge_if_needed(1 << 30).expect("merge_if_needed");
        assert_eq!(store.status().unwrap().merges, 0);
        assert_eq!(store.status().unwrap().data_files, files_before);

        // A zero threshold compacts every file with any garbage.
        store.merge_if_needed(0).expect("merge_if_needed");
        let status = store.status().unwrap();
        assert_eq!(status.merges, 1);
        assert!(status.data_files < files_before);

        for i in 0..4u8 {
            assert_eq!(
                store.get(format!("key{i}").as_bytes()).unwrap(),
                Some(format!("value_3_{i}").into_bytes())
            );
        }
    }

    #[test]
    fn test_corruption_detected_on_get() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        {
            let store = open(&temp_dir);
            store.put(b"k", b"hello").expect("put");
        }

        // Flip one byte inside the persisted value.
        let path = datadir::file_path(temp_dir.path(), ACTIVE_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let flip_at = bytes.len() - 2;
        bytes[flip_at] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let store = open(&temp_dir);
        match store.get(b"k") {
            Err(Error::Corrupt(_)) => {}
            other => panic!("Expected Corrupt, got {other:?}"),
        }

        // The store remains usable for other keys.
        store.put(b"other", b"fine").expect("put after corruption");
        assert_eq!(store.get(b"other").unwrap(), Some(b"fine".to_vec()));
    }

    #[test]
    fn test_truncated_tail_recovery() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        {
            let store = open(&temp_dir);
            store.put(b"k", b"v").expect("put");
        }

        // Crash-simulate: cut the record down to 7 bytes.
        let path = datadir::file_path(temp_dir.path(), ACTIVE_FILE);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(7).unwrap();
        drop(file);

        let store = open(&temp_dir);
        assert_eq!(store.get(b"k").unwrap(), None);

        store.put(b"k", b"w").expect("Put after torn tail failed");
        assert_eq!(store.get(b"k").unwrap(), Some(b"w".to_vec()));

        // The rewritten file is fully well-formed again.
        drop(store);
        let store = open(&temp_dir);
        assert_eq!(store.get(b"k").unwrap(), Some(b"w".to_vec()));
    }

    #[test]
    fn test_concurrent_disjoint_writers() {
        const WRITERS: usize = 8;
        const PUTS_PER_WRITER: usize = 1000;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(open(&temp_dir));

        let mut handles = Vec::new();
        for writer in 0..WRITERS {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..PUTS_PER_WRITER {
                    let key = format!("w{writer}_key{i}");
                    let value = format!("w{writer}_val{i}");
                    store.put(key.as_bytes(), value.as_bytes()).expect("put");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("Writer thread panicked");
        }

        assert_eq!(store.keys().unwrap().len(), WRITERS * PUTS_PER_WRITER);
        for writer in 0..WRITERS {
            for i in (0..PUTS_PER_WRITER).step_by(97) {
                let key = format!("w{writer}_key{i}");
                assert_eq!(
                    store.get(key.as_bytes()).unwrap(),
                    Some(format!("w{writer}_val{i}").into_bytes())
                );
            }
        }
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_records() {
        const READERS: usize = 4;
        const ROUNDS: usize = 500;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(open_small(&temp_dir, 512));
        store.put(b"shared", b"round_00000").expect("put");

        let mut handles = Vec::new();
        for _ in 0..READERS {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let mut observed = 0usize;
                while observed < ROUNDS {
                    let value = store
                        .get(b"shared")
                        .expect("Concurrent get failed")
                        .expect("Key vanished under concurrent writes");
                    assert!(
                        value.starts_with(b"round_"),
                        "torn value observed: {value:?}"
                    );
                    observed += 1;
                }
            }));
        }

        // One writer keeps overwriting, forcing rotations and merges along
        // the way.
        for round in 0..ROUNDS {
            store
                .put(b"shared", format!("round_{round:05}").as_bytes())
                .expect("put");
            if round % 100 == 99 {
                store.merge_if_needed(0).expect("merge_if_needed");
            }
        }

        for handle in handles {
            handle.join().expect("Reader thread panicked");
        }
        assert_eq!(
            store.get(b"shared").unwrap(),
            Some(format!("round_{:05}", ROUNDS - 1).into_bytes())
        );
    }

    #[test]
    fn test_prefixed_keys_roundtrip_and_merge() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config::new(temp_dir.path())
            .max_file_size(64)
            .prefixed_keys(true);

        {
            let store = Store::open_with_config(config.clone()).expect("open");
            store.put(b"alpha", b"1").expect("put");
            store.put(b"beta", b"2").expect("put");
            store.put(b"alpha", b"3").expect("put");
            store.force_merge().expect("merge");

            // The API carries logical keys throughout.
            assert_eq!(store.get(b"alpha").unwrap(), Some(b"3".to_vec()));
            let keys: HashSet<Vec<u8>> = store.keys().unwrap().into_iter().collect();
            assert_eq!(keys, HashSet::from([b"alpha".to_vec(), b"beta".to_vec()]));
        }

        // On disk, keys carry their filter prefix.
        let mut disk_keys = Vec::new();
        for file in datadir::list_data_files(temp_dir.path()).unwrap() {
            let path = datadir::file_path(temp_dir.path(), file);
            datadir::scan_file(&path, true, |_, record| {
                disk_keys.push(record.key.clone());
                Ok(())
            })
            .expect("scan");
        }
        assert!(!disk_keys.is_empty());
        for disk_key in &disk_keys {
            let logical = codec::strip_prefix(disk_key);
            assert_eq!(disk_key[0], codec::key_prefix(logical));
        }

        // And recovery (hints included) strips them again.
        let store = Store::open_with_config(config).expect("reopen");
        assert_eq!(store.get(b"alpha").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(b"beta").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_status_counters() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = open(&temp_dir);

        let initial = store.status().unwrap();
        assert_eq!(initial.keys, 0);
        assert_eq!(initial.data_files, 1);
        assert_eq!(initial.splits, 0);
        assert_eq!(initial.merges, 0);
        assert_eq!(initial.last_merged, 0);

        store.put(b"k", b"v1").expect("put");
        store.put(b"k", b"v2").expect("put");
        let status = store.status().unwrap();
        assert_eq!(status.keys, 1);
        assert_eq!(status.reclaimable_entries, 1);
        assert!(status.reclaimable_bytes > 0);
    }
}
