#![allow(unsafe_code)]
//! Location locking and the single-writer slot.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{Result, StoreError};

/// Exclusive advisory lock held on a location's lock file.
///
/// The lock belongs to the open file handle, so it excludes other OS
/// processes and a second open of the same location within this process.
/// The owning pid is written into the file so an operator can see who
/// holds it.
pub struct LocationLock {
    path: PathBuf,
    file: File,
}

impl LocationLock {
    /// Tries to take the lock without blocking.
    ///
    /// Returns [`StoreError::LockContention`] when another handle holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if !try_lock_exclusive(&file)? {
            let holder = read_holder_pid(&path);
            warn!(path = %path.display(), holder = ?holder, "location.lock.contended");
            return Err(StoreError::LockContention(path));
        }
        let mut handle: &File = &file;
        handle.set_len(0)?;
        handle.seek(SeekFrom::Start(0))?;
        handle.write_all(format!("{}\n", std::process::id()).as_bytes())?;
        handle.sync_all()?;
        debug!(path = %path.display(), "location.lock.acquired");
        Ok(Self { path, file })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded in the lock file, if readable.
    pub fn holder_pid(&self) -> Option<u32> {
        let mut handle: &File = &self.file;
        let mut text = String::new();
        handle.seek(SeekFrom::Start(0)).ok()?;
        handle.read_to_string(&mut text).ok()?;
        text.trim().parse().ok()
    }
}

impl Drop for LocationLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        if let Err(_err) = unlock(&self.file) {
            #[cfg(debug_assertions)]
            eprintln!("failed to unlock {}: {:?}", self.path.display(), _err);
        }
        debug!(path = %self.path.display(), "location.lock.released");
    }
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// In-process slot admitting one writer at a time.
#[derive(Clone, Default)]
pub struct WriterSlot {
    inner: Arc<SlotInner>,
}

#[derive(Default)]
struct SlotInner {
    held: Mutex<bool>,
    released: Condvar,
}

/// Proof of holding the writer slot; releases it on drop.
pub struct WriterPermit {
    inner: Arc<SlotInner>,
}

impl WriterSlot {
    /// Creates a free slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the slot is free, then takes it.
    pub fn acquire(&self) -> WriterPermit {
        let mut held = self.inner.held.lock();
        while *held {
            self.inner.released.wait(&mut held);
        }
        *held = true;
        WriterPermit {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for WriterPermit {
    fn drop(&mut self) {
        *self.inner.held.lock() = false;
        self.inner.released.notify_one();
    }
}

fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::try_lock_exclusive(file)
    }
    #[cfg(windows)]
    {
        windows::try_lock_exclusive(file)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = file;
        Err(io::Error::new(
            io::ErrorKind::Other,
            "file locking unsupported on this platform",
        ))
    }
}

fn unlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock(file)
    }
    #[cfg(windows)]
    {
        windows::unlock(file)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = file;
        Err(io::Error::new(
            io::ErrorKind::Other,
            "file locking unsupported on this platform",
        ))
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    // flock, not fcntl: fcntl locks never conflict within one process and
    // are dropped when any descriptor of the file closes.
    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        loop {
            let res = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EWOULDBLOCK => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let res = LockFileEx(
                handle as isize,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            );
            if res != 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code as u32 == ERROR_LOCK_VIOLATION => Ok(false),
                _ => Err(err),
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let res = UnlockFileEx(handle as isize, 0, 1, 0, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
