//! Compaction.
//!
//! Overwrites and deletes leave dead records behind in inactive files. The
//! merger tracks how much of each file is reclaimable and, when asked,
//! rewrites the live records of a set of inactive files into a single
//! compacted file, accompanied by a hint file that lets recovery skip the
//! full scan.
//!
//! Merge safety against concurrent writes rests on four facts: writes go
//! only to the active file, which is never merged; the index swap holds the
//! index-wide write lock; the liveness check during the rewrite skips
//! records already superseded; and installation re-checks that the current
//! entry still points into the merged set, so a write that landed between
//! scan and install is never clobbered. Old files are deleted only inside
//! the install critical section, after the swap.

use crate::codec::{self, HintEntry, HEADER_SIZE};
use crate::datadir::{self, DataDir};
use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::index::{IndexEntry, KeyDir};

use itertools::Itertools as _;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-file reclaim accounting: how many dead records a file holds and how
/// many bytes they cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delta {
    pub entries: u64,
    pub bytes: u64,
}

/// Reclaim accounting plus merge counters.
pub struct Merger {
    reclaims: Mutex<HashMap<u32, Delta>>,
    merges: AtomicU64,
    last_merged: AtomicU64,
    running: AtomicBool,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

impl Merger {
    pub fn new() -> Self {
        Self {
            reclaims: Mutex::new(HashMap::new()),
            merges: AtomicU64::new(0),
            last_merged: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Registers a superseded or tombstoned record as reclaimable.
    pub fn add_reclaim(&self, file: u32, len: u32) {
        if let Ok(mut reclaims) = self.reclaims.lock() {
            let delta = reclaims.entry(file).or_default();
            delta.entries += 1;
            delta.bytes += len as u64;
        }
    }

    /// Drops accounting for files that were merged away.
    pub fn remove_reclaims(&self, files: &HashSet<u32>) {
        if let Ok(mut reclaims) = self.reclaims.lock() {
            reclaims.retain(|file, _| !files.contains(file));
        }
    }

    /// Moves a file's accounting to its new name after rotation.
    pub fn rename_reclaim(&self, from: u32, to: u32) {
        if let Ok(mut reclaims) = self.reclaims.lock() {
            if let Some(delta) = reclaims.remove(&from) {
                reclaims.insert(to, delta);
            }
        }
    }

    /// Files whose reclaimable bytes exceed the threshold, ascending.
    pub fn candidates(&self, threshold: u64) -> Vec<u32> {
        let Ok(reclaims) = self.reclaims.lock() else {
            return Vec::new();
        };
        reclaims
            .iter()
            .filter(|(_, delta)| delta.bytes > threshold)
            .map(|(file, _)| *file)
            .sorted()
            .collect()
    }

    /// Total reclaimable `(entries, bytes)` across all files.
    pub fn totals(&self) -> (u64, u64) {
        let Ok(reclaims) = self.reclaims.lock() else {
            return (0, 0);
        };
        reclaims
            .values()
            .fold((0, 0), |(e, b), d| (e + d.entries, b + d.bytes))
    }

    pub fn merges(&self) -> u64 {
        self.merges.load(Ordering::SeqCst)
    }

    /// Epoch seconds of the last completed merge, 0 if never.
    pub fn last_merged(&self) -> u64 {
        self.last_merged.load(Ordering::SeqCst)
    }

    fn mark_merged(&self) {
        self.merges.fetch_add(1, Ordering::SeqCst);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_merged.store(now, Ordering::SeqCst);
    }

    /// Claims the single merge slot. Returns None if a merge is already
    /// running.
    pub fn try_start(&self) -> Option<MergeGuard<'_>> {
        if !self.running.swap(true, Ordering::SeqCst) {
            Some(MergeGuard { merger: self })
        } else {
            None
        }
    }
}

pub struct MergeGuard<'a> {
    merger: &'a Merger,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        self.merger.running.store(false, Ordering::SeqCst);
    }
}

/// Rewrites the live records of `files` into the smallest-numbered one and
/// deletes the rest. `files` must be inactive, nonempty, and sorted
/// ascending; the caller holds the merge slot.
pub fn merge(
    data: &DataDir,
    index: &KeyDir,
    merger: &Merger,
    files: &[u32],
    prefixed_keys: bool,
) -> Result<()> {
    let Some(&target) = files.first() else {
        return Ok(());
    };
    let file_set: HashSet<u32> = files.iter().copied().collect();

    tracing::info!(merge_target = target, files = files.len(), "starting merge");

    // Rewrite phase: copy every still-live, non-tombstone record into the
    // temp file and remember where it landed. Runs without any engine-wide
    // lock; the install re-check below covers writes racing past us.
    let temp = datadir::temp_path(data.dir(), target);
    let mut writer = BufWriter::new(File::create(&temp)?);
    let mut sub: HashMap<Vec<u8>, IndexEntry> = HashMap::new();
    let mut offset = 0u32;

    for &file in files {
        let path = datadir::file_path(data.dir(), file);
        let outcome = datadir::scan_file(&path, true, |pos, record| {
            if record.is_tombstone() {
                return Ok(());
            }
            let logical = logical_key(&record.key, prefixed_keys);
            if !index.has_entry(logical, file, pos)? {
                return Ok(());
            }
            let buf = codec::encode_record(&record.key, &record.value, record.ts);
            writer.write_all(&buf)?;
            sub.insert(
                logical.to_vec(),
                IndexEntry {
                    file: target,
                    pos: offset,
                    len: buf.len() as u32,
                    ts: record.ts,
                },
            );
            offset += buf.len() as u32;
            Ok(())
        })?;
        // A source file that fails mid-scan may still hold live records
        // past the bad spot. Nothing has been mutated yet, so bail out
        // with the originals intact.
        if outcome.truncated {
            drop(writer);
            let _ = fs::remove_file(&temp);
            return errcorrupt!("data file {file} failed mid-scan, merge aborted");
        }
    }
    writer.flush()?;
    drop(writer);

    let mut hints = BufWriter::new(File::create(datadir::hint_path(data.dir(), target))?);

    // Install phase, under the index-wide write lock.
    let mut installed = 0usize;
    {
        let mut guard = index.write_guard()?;

        for (key, entry) in &sub {
            // A write or delete that landed after the scan supplied a newer
            // entry outside the merged set; leave it alone.
            let still_ours = guard.get(key).is_some_and(|cur| file_set.contains(&cur.file));
            if !still_ours {
                continue;
            }
            guard.insert(key.clone(), *entry);
            let disk_key_len = key.len() + usize::from(prefixed_keys);
            codec::write_hint(
                &mut hints,
                &HintEntry {
                    ts: entry.ts,
                    value_size: entry.len - (HEADER_SIZE + disk_key_len) as u32,
                    pos: entry.pos,
                    key: disk_key(key, prefixed_keys),
                },
            )?;
            installed += 1;
        }
        hints.flush()?;

        merger.remove_reclaims(&file_set);

        for &file in &files[1..] {
            data.remove(file)?;
            // A deleted original may carry a hint from an earlier merge;
            // left behind, it would shadow a future file reusing the name.
            let hint = datadir::hint_path(data.dir(), file);
            if hint.exists() {
                fs::remove_file(&hint)?;
            }
        }
        data.replace(target)?;
        merger.mark_merged();

        // Every entry still referencing the merged set must be one we just
        // installed into the target. Anything else is a concurrency bug.
        let mut dangling = 0usize;
        for (key, entry) in guard.iter() {
            if !file_set.contains(&entry.file) {
                continue;
            }
            let ours = entry.file == target && sub.get(key) == Some(entry);
            if !ours {
                dangling += 1;
            }
        }
        if dangling > 0 {
            tracing::error!(
                dangling = dangling,
                merge_target = target,
                "index entries reference merged-away files"
            );
            return Err(Error::InvalidState(format!(
                "{dangling} index entries reference merged-away files"
            )));
        }
    }

    tracing::info!(
        merge_target = target,
        files = files.len(),
        installed = installed,
        "completed merge"
    );
    Ok(())
}

fn logical_key(disk_key: &[u8], prefixed: bool) -> &[u8] {
    if prefixed {
        codec::strip_prefix(disk_key)
    } else {
        disk_key
    }
}

fn disk_key(logical: &[u8], prefixed: bool) -> Vec<u8> {
    if prefixed {
        codec::prefix_key(logical)
    } else {
        logical.to_vec()
    }
}
