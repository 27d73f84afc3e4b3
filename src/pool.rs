//! Bounded pool of random-access file handles for the read path.
//!
//! Handles are exclusive while checked out: a caller seeks and reads without
//! any other reader observing the handle's cursor. Released handles are kept
//! for reuse up to the pool capacity; past that the oldest idle handle is
//! closed. Deleting or renaming a data file must invalidate its pooled
//! handles, since a pooled handle pins the old inode.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::Result;

pub struct ReaderPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
    stats: Stats,
}

struct PoolInner {
    /// Idle handles per path.
    idle: HashMap<PathBuf, Vec<File>>,
    /// One entry per idle handle, oldest first.
    order: VecDeque<PathBuf>,
}

impl ReaderPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                order: VecDeque::new(),
            }),
            stats: Stats::new(),
        }
    }

    /// Checks out a handle for the given path, reusing an idle one when
    /// available and opening the file otherwise.
    pub fn acquire(&self, path: &Path) -> Result<File> {
        {
            let mut inner = self.inner.lock()?;
            let reused = inner.idle.get_mut(path).and_then(|handles| handles.pop());
            if let Some(file) = reused {
                if inner.idle.get(path).is_some_and(|h| h.is_empty()) {
                    inner.idle.remove(path);
                }
                remove_one(&mut inner.order, path);
                self.stats.hit();
                return Ok(file);
            }
        }
        self.stats.miss();
        Ok(File::open(path)?)
    }

    /// Returns a handle to the pool, evicting the oldest idle handle when
    /// over capacity.
    pub fn release(&self, path: &Path, file: File) {
        let Ok(mut inner) = self.inner.lock() else {
            return; // poisoned pool just stops retaining handles
        };
        inner
            .idle
            .entry(path.to_path_buf())
            .or_default()
            .push(file);
        inner.order.push_back(path.to_path_buf());

        while inner.order.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(handles) = inner.idle.get_mut(&oldest) {
                handles.pop();
            }
            if inner.idle.get(&oldest).is_some_and(|h| h.is_empty()) {
                inner.idle.remove(&oldest);
            }
        }
    }

    /// Closes and drops every idle handle for the given path.
    pub fn invalidate(&self, path: &Path) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.idle.remove(path);
        inner.order.retain(|p| p != path);
    }

    /// Number of idle handles currently retained.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.order.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }
}

fn remove_one(order: &mut VecDeque<PathBuf>, path: &Path) {
    if let Some(idx) = order.iter().position(|p| p == path) {
        order.remove(idx);
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}
