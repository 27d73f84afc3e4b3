//! Startup recovery: rebuild the key directory and reclaim accounting
//! from the files on disk.
//!
//! Inactive files are processed in ascending numeric order, then the
//! active file, records in ascending position, so the last write wins. A
//! file's hint sidecar is preferred when present: it lists exactly the
//! live entries of a merged file, so the values never need to be read.
//! Torn tails are tolerated; the active file is truncated to its last
//! well-formed record so later appends never sit behind garbage bytes.

use crate::codec::{self, Record};
use crate::config::Config;
use crate::datadir::{self, ACTIVE_FILE};
use crate::error::Result;
use crate::index::{IndexEntry, KeyDir};
use crate::merge::Merger;

use std::fs::{self, OpenOptions};
use std::path::Path;

/// State rebuilt by [`recover`].
pub struct Recovered {
    pub index: KeyDir,
    pub merger: Merger,
}

/// Rebuilds the in-memory state for a store directory. The directory
/// exists and is exclusively locked by the caller.
pub(crate) fn recover(config: &Config) -> Result<Recovered> {
    let dir = &config.dir;

    remove_stale_temps(dir)?;

    let index = KeyDir::new();
    let merger = Merger::new();

    // Inactive files ascending, then the active file: rotation hands out
    // ascending names, and "0" always holds the newest writes, so this
    // order makes the last write win.
    let files = datadir::list_data_files(dir)?;
    let ordered = files
        .iter()
        .copied()
        .filter(|&file| file != ACTIVE_FILE)
        .chain(files.iter().copied().filter(|&file| file == ACTIVE_FILE));
    for file in ordered {
        let hint = datadir::hint_path(dir, file);
        if hint.exists() {
            recover_from_hints(&index, &merger, &hint, file, config.prefixed_keys)?;
        } else {
            recover_from_scan(&index, &merger, dir, file, config.prefixed_keys)?;
        }
    }

    tracing::info!(
        dir = %dir.display(),
        files = files.len(),
        keys = index.len()?,
        "recovery completed"
    );
    Ok(Recovered { index, merger })
}

fn recover_from_hints(
    index: &KeyDir,
    merger: &Merger,
    hint: &Path,
    file: u32,
    prefixed_keys: bool,
) -> Result<()> {
    datadir::scan_hint_file(hint, |entry| {
        let key = if prefixed_keys {
            codec::strip_prefix(&entry.key).to_vec()
        } else {
            entry.key.clone()
        };
        let len = entry.record_len();
        install(
            index,
            merger,
            key,
            IndexEntry {
                file,
                pos: entry.pos,
                len,
                ts: entry.ts,
            },
        )
    })
}

fn recover_from_scan(
    index: &KeyDir,
    merger: &Merger,
    dir: &Path,
    file: u32,
    prefixed_keys: bool,
) -> Result<()> {
    let path = datadir::file_path(dir, file);
    let outcome = datadir::scan_file(&path, false, |pos, record| {
        let Record { key, ts, .. } = &record;
        let logical = if prefixed_keys {
            codec::strip_prefix(key).to_vec()
        } else {
            key.clone()
        };
        let len = record.encoded_len();
        if record.is_tombstone() {
            // A hole-filling rotation can put newer records in a
            // lower-numbered file; the timestamp check keeps a stale
            // tombstone from deleting a newer write.
            let stale = index.get(&logical)?.is_some_and(|old| old.ts > *ts);
            if !stale {
                if let Some(old) = index.remove(&logical)? {
                    merger.add_reclaim(old.file, old.len);
                }
            }
            // The tombstone itself is garbage once its file merges.
            merger.add_reclaim(file, len);
            Ok(())
        } else {
            install(
                index,
                merger,
                logical,
                IndexEntry {
                    file,
                    pos,
                    len,
                    ts: *ts,
                },
            )
        }
    })?;

    if outcome.truncated && file == ACTIVE_FILE {
        tracing::warn!(
            path = %path.display(),
            valid_len = outcome.valid_len,
            "truncating torn tail of active file"
        );
        let handle = OpenOptions::new().write(true).open(&path)?;
        handle.set_len(outcome.valid_len)?;
    }
    Ok(())
}

/// Installs an entry last-write-wins: a strictly newer timestamp already
/// in the index survives (rotation reuses name holes, so scan order alone
/// is not age order); otherwise the incoming entry replaces it. The loser
/// is registered as reclaimable either way.
fn install(index: &KeyDir, merger: &Merger, key: Vec<u8>, entry: IndexEntry) -> Result<()> {
    if let Some(old) = index.get(&key)? {
        if old.ts > entry.ts {
            merger.add_reclaim(entry.file, entry.len);
            return Ok(());
        }
    }
    if let Some(old) = index.put(key, entry)? {
        merger.add_reclaim(old.file, old.len);
    }
    Ok(())
}

/// A crash mid-merge leaves a `<n>_` temp behind; the originals are still
/// intact, so the temp is simply dropped.
fn remove_stale_temps(dir: &Path) -> Result<()> {
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix('_') else {
            continue;
        };
        if datadir::parse_data_name(stem).is_some() {
            tracing::warn!(file = name, "removing stale merge temp");
            fs::remove_file(dirent.path())?;
        }
    }
    Ok(())
}
