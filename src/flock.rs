use crate::error::{Error, Result};

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[cfg(windows)]
use std::os::windows::io::AsRawHandle;

/// Advisory exclusive lock guarding a store directory against a second
/// process. Acquisition never blocks: a held lock fails fast, naming the
/// owning process when the lock file records one. The OS releases the
/// lock when the handle closes, so dropping the guard unlocks; the lock
/// file itself stays behind to avoid unlink races with a concurrent
/// opener.
pub struct FileLock {
    _handle: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock, recording this process ID in the lock file.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // Open without truncating: on contention the current content
        // still names the holder.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if !try_exclusive(&file)? {
            let holder = read_holder(&mut file);
            return Err(Error::Io(format!(
                "{} is held by {holder}",
                path.display()
            )));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self {
            _handle: file,
            path,
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Best-effort read of the PID the current holder wrote.
fn read_holder(file: &mut File) -> String {
    let mut content = String::new();
    if file.seek(SeekFrom::Start(0)).is_ok() && file.read_to_string(&mut content).is_ok() {
        if let Some(pid) = content.split_whitespace().next() {
            return format!("process {pid}");
        }
    }
    "another process".to_string()
}

/// Tries to take the lock without blocking. `Ok(false)` means another
/// handle holds it; anything else going wrong is a real error.
#[cfg(unix)]
fn try_exclusive(file: &File) -> Result<bool> {
    use libc::{flock, EWOULDBLOCK, LOCK_EX, LOCK_NB};

    if unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(windows)]
fn try_exclusive(file: &File) -> Result<bool> {
    use winapi::shared::winerror::ERROR_LOCK_VIOLATION;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let ok = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };
    if ok != 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(not(any(unix, windows)))]
fn try_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}
