//! Directory lock
//!
//! A store directory is owned by one process at a time through an advisory
//! `flock` on `<dir>/.cellar/LOCK`. The holder writes its pid into the file so
//! a contending process can name it in diagnostics.
//!
//! Inside one process the lock is shared: handles opened on the same
//! directory reuse the same [`DirLock`], and the OS lock is released when the
//! last of them is dropped.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::retry::Attempt;

/// Engine metadata directory inside the store directory
pub const META_DIR: &str = ".cellar";

/// Lock file name inside [`META_DIR`]
pub const LOCK_FILE: &str = "LOCK";

/// An exclusively locked file; unlocked on drop
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Try to lock `path` once without blocking
    ///
    /// Returns `Ok(None)` when another open file description holds it.
    pub fn try_acquire(path: &Path) -> StoreResult<Option<LockFile>> {
        // No truncate: the current holder's pid must survive our open
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        if !sys::try_lock_exclusive(&file).map_err(|e| StoreError::io(path, e))? {
            return Ok(None);
        }

        let mut lock = LockFile {
            file,
            path: path.to_path_buf(),
        };
        if let Err(e) = lock.record_pid() {
            // Only diagnostics depend on the pid
            warn!("Failed to record pid in {:?}: {}", path, e);
        }
        Ok(Some(lock))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_pid(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())?;
        self.file.sync_data()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(&self.file) {
            warn!("Failed to unlock {:?}: {}", self.path, e);
        }
        debug!("Released lock {:?}", self.path);
    }
}

/// Pid written by the current holder, if readable
pub fn read_holder(path: &Path) -> Option<u32> {
    let mut content = String::new();
    File::open(path).ok()?.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

/// Shared handle on a locked store directory
#[derive(Debug, Clone)]
pub struct DirLock(Arc<LockFile>);

impl DirLock {
    pub fn path(&self) -> &Path {
        self.0.path()
    }

    /// Number of handles in this process sharing the lock
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

type Registry = Mutex<HashMap<PathBuf, Weak<LockFile>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Path of the lock file for a store directory
pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(META_DIR).join(LOCK_FILE)
}

/// One non-blocking attempt to lock a store directory
///
/// Reuses this process's lock if one is live, otherwise tries the OS lock.
pub fn try_lock_dir(dir: &Path) -> StoreResult<Attempt<DirLock>> {
    let meta = dir.join(META_DIR);
    fs::create_dir_all(&meta).map_err(|e| StoreError::io(&meta, e))?;
    let key = fs::canonicalize(&meta)
        .map_err(|e| StoreError::io(&meta, e))?
        .join(LOCK_FILE);

    let mut locks = registry().lock().unwrap_or_else(|e| e.into_inner());

    if let Some(existing) = locks.get(&key).and_then(Weak::upgrade) {
        return Ok(Attempt::Ready(DirLock(existing)));
    }

    match LockFile::try_acquire(&key)? {
        Some(lock) => {
            debug!("Acquired lock {:?}", key);
            let lock = Arc::new(lock);
            locks.retain(|_, weak| weak.strong_count() > 0);
            locks.insert(key, Arc::downgrade(&lock));
            Ok(Attempt::Ready(DirLock(lock)))
        }
        None => Ok(Attempt::Busy {
            holder: read_holder(&key),
        }),
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        // SAFETY: the descriptor is owned by `file` and open for this call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        // SAFETY: as above
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "store directory locking requires a unix platform",
        ))
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_description_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("LOCK");

        let first = LockFile::try_acquire(&path).unwrap();
        assert!(first.is_some());

        // flock is per open file description, so a second open conflicts
        // even inside one process
        assert!(LockFile::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(LockFile::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_holder_pid_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("LOCK");

        let _lock = LockFile::try_acquire(&path).unwrap().unwrap();
        assert_eq!(read_holder(&path), Some(std::process::id()));

        // A refused attempt must not clobber the holder's pid
        assert!(LockFile::try_acquire(&path).unwrap().is_none());
        assert_eq!(read_holder(&path), Some(std::process::id()));
    }

    #[test]
    fn test_dir_lock_shared_in_process() {
        let temp_dir = TempDir::new().unwrap();

        let first = match try_lock_dir(temp_dir.path()).unwrap() {
            Attempt::Ready(lock) => lock,
            Attempt::Busy { .. } => panic!("fresh directory should lock"),
        };
        let second = match try_lock_dir(temp_dir.path()).unwrap() {
            Attempt::Ready(lock) => lock,
            Attempt::Busy { .. } => panic!("same process should share the lock"),
        };
        assert_eq!(first.share_count(), 2);
        assert_eq!(first.path(), second.path());

        // An independent description sees the directory as held
        let raw = lock_path(temp_dir.path());
        assert!(LockFile::try_acquire(&raw).unwrap().is_none());

        drop(first);
        assert!(LockFile::try_acquire(&raw).unwrap().is_none());

        drop(second);
        assert!(LockFile::try_acquire(&raw).unwrap().is_some());
    }

    #[test]
    fn test_busy_reports_holder() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join(META_DIR)).unwrap();
        let raw = fs::canonicalize(temp_dir.path().join(META_DIR))
            .unwrap()
            .join(LOCK_FILE);
        let _held = LockFile::try_acquire(&raw).unwrap().unwrap();

        match try_lock_dir(temp_dir.path()).unwrap() {
            Attempt::Busy { holder } => assert_eq!(holder, Some(std::process::id())),
            Attempt::Ready(_) => panic!("directory is held by another description"),
        }
    }
}
