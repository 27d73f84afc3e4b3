//! Data directory IO.
//!
//! Owns the active-file appender, the reader pool, and the file-naming
//! discipline. The directory holds:
//!
//! ```text
//! 0      active data file, the only file open for appends
//! <n>    inactive data files, n >= 1
//! <n>h   hint file for <n>, present only for files produced by a merge
//! <n>_   merge temp file, transient
//! ```
//!
//! Appends are serialized on the appender lock. Reads go through the pool
//! and may run concurrently with appends and each other.

use crate::codec::{self, Record};
use crate::error::{Error, Result};
use crate::index::IndexEntry;
use crate::pool::ReaderPool;

use itertools::Itertools as _;

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// The active data file is always named "0".
pub const ACTIVE_FILE: u32 = 0;

pub struct DataDir {
    dir: PathBuf,
    appender: Mutex<Appender>,
    pool: ReaderPool,
    splits: AtomicU64,
}

struct Appender {
    writer: BufWriter<File>,
    /// Next write offset, equal to the validated length of "0".
    offset: u64,
}

impl DataDir {
    /// Opens the directory's active file for appends, positioned at its
    /// end. The caller (recovery) has already validated and, if needed,
    /// truncated "0".
    pub fn open(dir: impl Into<PathBuf>, max_readers: usize) -> Result<Self> {
        let dir = dir.into();
        let path = file_path(&dir, ACTIVE_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let offset = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            dir,
            appender: Mutex::new(Appender {
                writer: BufWriter::new(file),
                offset,
            }),
            pool: ReaderPool::new(max_readers),
            splits: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one record to the active file and flushes it to the OS.
    /// Returns `(pos, length, timestamp)`; the file is always the active
    /// one.
    pub fn append(&self, disk_key: &[u8], value: &[u8]) -> Result<(u32, u32, u32)> {
        let ts = now_ts();
        let buf = codec::encode_record(disk_key, value, ts);

        let mut appender = self.appender.lock()?;
        let pos = appender.offset as u32;
        appender.writer.write_all(&buf)?;
        appender.writer.flush()?;
        appender.offset += buf.len() as u64;
        Ok((pos, buf.len() as u32, ts))
    }

    /// Current length of the active file.
    pub fn active_len(&self) -> Result<u64> {
        Ok(self.appender.lock()?.offset)
    }

    /// Fsyncs the active file.
    pub fn sync(&self) -> Result<()> {
        let mut appender = self.appender.lock()?;
        appender.writer.flush()?;
        appender.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rotates the active file: renames "0" to the next free integer name
    /// and opens a fresh empty "0". Returns the new inactive name.
    pub fn split(&self) -> Result<u32> {
        let mut appender = self.appender.lock()?;
        appender.writer.flush()?;

        let name = next_file_name(&list_data_files(&self.dir)?);
        let active = file_path(&self.dir, ACTIVE_FILE);
        let target = file_path(&self.dir, name);
        fs::rename(&active, &target)?;

        // Pooled "0" readers pin the renamed inode; drop them so readers
        // reopen the path they actually want.
        self.pool.invalidate(&active);
        self.pool.invalidate(&target);

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&active)?;
        *appender = Appender {
            writer: BufWriter::new(file),
            offset: 0,
        };
        self.splits.fetch_add(1, Ordering::SeqCst);
        Ok(name)
    }

    /// Reads and verifies the record an index entry points at.
    pub fn read(&self, entry: &IndexEntry) -> Result<Record> {
        let path = file_path(&self.dir, entry.file);
        let mut file = self.pool.acquire(&path)?;

        let result = read_at(&mut file, entry);
        if result.is_ok() {
            self.pool.release(&path, file);
        }
        result
    }

    /// Deletes a data file and drops its pooled readers.
    pub fn remove(&self, name: u32) -> Result<()> {
        let path = file_path(&self.dir, name);
        self.pool.invalidate(&path);
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Drops pooled readers for a file, e.g. before a rename over it.
    pub fn invalidate(&self, name: u32) {
        self.pool.invalidate(&file_path(&self.dir, name));
    }

    /// Replaces a data file with its completed merge temp: deletes the
    /// original, renames `<name>_` over it, and drops pooled readers.
    pub fn replace(&self, name: u32) -> Result<()> {
        let path = file_path(&self.dir, name);
        self.pool.invalidate(&path);
        fs::remove_file(&path)?;
        fs::rename(temp_path(&self.dir, name), &path)?;
        Ok(())
    }

    pub fn splits(&self) -> u64 {
        self.splits.load(Ordering::SeqCst)
    }

    pub fn pool_stats(&self) -> (usize, usize) {
        self.pool.stats()
    }

    /// Flushes the appender. Pooled handles close on drop.
    pub fn close(&self) -> Result<()> {
        self.appender.lock()?.writer.flush()?;
        Ok(())
    }
}

fn read_at(file: &mut File, entry: &IndexEntry) -> Result<Record> {
    file.seek(SeekFrom::Start(entry.pos as u64))?;
    let mut buf = vec![0u8; entry.len as usize];
    match file.read_exact(&mut buf) {
        Ok(_) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::Truncated(format!(
                "short read at {}:{}, wanted {} bytes",
                entry.file, entry.pos, entry.len
            )));
        }
        Err(e) => return Err(e.into()),
    }
    codec::decode_record(&buf)
}

/// Outcome of a best-effort file scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanOutcome {
    /// Offset of the first byte past the last well-formed record.
    pub valid_len: u64,
    /// Whether the file holds bytes past `valid_len`.
    pub truncated: bool,
}

/// Scans every record in a data file from offset 0, invoking the visitor
/// with each record's position. Decoding stops at the first torn (or, with
/// `verify_crc`, corrupt) record and the file is treated as ending there;
/// visitor errors propagate. Recovery scans structurally so a bad checksum
/// surfaces on the indexed read; merge scans verify.
pub fn scan_file<F>(path: &Path, verify_crc: bool, mut visitor: F) -> Result<ScanOutcome>
where
    F: FnMut(u32, Record) -> Result<()>,
{
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut offset = 0u64;
    loop {
        match codec::read_record(&mut reader, verify_crc) {
            Ok(Some((record, len))) => {
                visitor(offset as u32, record)?;
                offset += len as u64;
            }
            Ok(None) => break,
            Err(Error::Truncated(msg)) | Err(Error::Corrupt(msg)) => {
                tracing::warn!(path = %path.display(), offset = offset, %msg, "scan stopped at bad record");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ScanOutcome {
        valid_len: offset,
        truncated: offset < file_len,
    })
}

/// Scans a hint file, invoking the visitor with each entry. Stops with a
/// warn at a torn record.
pub fn scan_hint_file<F>(path: &Path, mut visitor: F) -> Result<()>
where
    F: FnMut(codec::HintEntry) -> Result<()>,
{
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        match codec::read_hint(&mut reader) {
            Ok(Some(hint)) => visitor(hint)?,
            Ok(None) => return Ok(()),
            Err(Error::Truncated(msg)) => {
                tracing::warn!(path = %path.display(), %msg, "hint scan stopped at torn record");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Path of a data file by numeric name.
pub fn file_path(dir: &Path, name: u32) -> PathBuf {
    dir.join(name.to_string())
}

/// Path of the hint file accompanying a merged data file.
pub fn hint_path(dir: &Path, name: u32) -> PathBuf {
    dir.join(format!("{name}h"))
}

/// Path of the transient merge temp for a target file.
pub fn temp_path(dir: &Path, name: u32) -> PathBuf {
    dir.join(format!("{name}_"))
}

/// Parses a directory entry name as a data file name: decimal digits only.
pub fn parse_data_name(name: &str) -> Option<u32> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// All integer-named files in the directory, ascending. Hint files, temp
/// files, and anything else are skipped.
pub fn list_data_files(dir: &Path) -> Result<Vec<u32>> {
    let mut names = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        if let Some(name) = dirent.file_name().to_str().and_then(parse_data_name) {
            names.push(name);
        }
    }
    Ok(names.into_iter().sorted().collect())
}

/// First-fit name for a rotated file: the smallest positive integer not
/// already taken, so holes left by merges are reused.
pub fn next_file_name(existing: &[u32]) -> u32 {
    let taken: HashSet<u32> = existing.iter().copied().collect();
    (1..).find(|n| !taken.contains(n)).unwrap_or(u32::MAX)
}

/// Append timestamp: wall-clock seconds truncated to 32 bits.
fn now_ts() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
