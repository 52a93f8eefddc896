//! Advisory file locks for cross-process coordination.
//!
//! Every lock in the scheduler state directory is a whole-file exclusive
//! flock(2). The kernel releases the lock when the holding process exits or
//! closes the handle, so a crashed hook can never leak a slot.

use std::fs::{DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use filetime::FileTime;

use buildhook_shared::errors::{HookError, HookResult};

/// Interval between acquisition attempts in [`LockFile::lock_exclusive_timeout`].
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// An open lock file. The handle owns at most one exclusive flock; dropping
/// the handle releases it.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
    held: bool,
}

impl LockFile {
    /// Open or create the lock file, creating its parent directory if
    /// missing. Creation is idempotent across processes: the directory is
    /// world-writable (0777) so concurrent hooks under different users can
    /// share it, the file itself is 0600.
    pub fn open(path: &Path) -> HookResult<LockFile> {
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o777)
                .create(parent)
                .map_err(|e| {
                    HookError::Lock(format!(
                        "cannot create state directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                HookError::Lock(format!("cannot open lock file {}: {}", path.display(), e))
            })?;

        Ok(LockFile {
            file,
            path: path.to_path_buf(),
            held: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking exclusive acquire. `Ok(true)` means the caller now owns
    /// the lock until [`unlock`](LockFile::unlock) or handle drop.
    pub fn try_lock_exclusive(&mut self) -> HookResult<bool> {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            self.held = true;
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
            _ => Err(HookError::Lock(format!(
                "flock(LOCK_EX | LOCK_NB) on {} failed: {}",
                self.path.display(),
                err
            ))),
        }
    }

    /// Blocking exclusive acquire.
    pub fn lock_exclusive(&mut self) -> HookResult<()> {
        loop {
            let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX) };
            if ret == 0 {
                self.held = true;
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(HookError::Lock(format!(
                "flock(LOCK_EX) on {} failed: {}",
                self.path.display(),
                err
            )));
        }
    }

    /// Bounded-wait exclusive acquire: try once a second until the deadline.
    /// Returns `Ok(false)` when the timeout elapses without acquisition.
    pub fn lock_exclusive_timeout(&mut self, timeout: Duration) -> HookResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock_exclusive()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Release the lock. The file stays on disk; lock files persist forever.
    pub fn unlock(&mut self) -> HookResult<()> {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if ret != 0 {
            return Err(HookError::Lock(format!(
                "flock(LOCK_UN) on {} failed: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            )));
        }
        self.held = false;
        Ok(())
    }

    /// Probe whether the lock is currently free: attempt a non-blocking
    /// acquire and immediately release on success. Success means free.
    pub fn probe_free(&mut self) -> HookResult<bool> {
        if self.try_lock_exclusive()? {
            self.unlock()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Bump the file's mtime so `ls -l` on the state directory shows when
    /// each slot was last claimed.
    pub fn touch(&self) -> HookResult<()> {
        filetime::set_file_mtime(&self.path, FileTime::now()).map_err(|e| {
            HookError::Lock(format!("cannot touch {}: {}", self.path.display(), e))
        })
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Closing the fd releases the flock anyway; the explicit unlock only
        // keeps `held` truthful for any outstanding duplicated handle.
        if self.held {
            let _ = self.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(dir: &TempDir, name: &str) -> PathBuf {
        dir.path().join("state").join(name)
    }

    #[test]
    fn open_creates_parent_and_file() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir, "x86_64-linux-host1-0");
        let lock = LockFile::open(&path).unwrap();
        assert!(lock.path().exists());
        assert!(!lock.is_held());
    }

    #[test]
    fn try_lock_fails_when_held_elsewhere() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir, "slot");

        // Separate handles have separate open file descriptions, so this
        // mirrors two hook processes contending for one slot.
        let mut first = LockFile::open(&path).unwrap();
        let mut second = LockFile::open(&path).unwrap();

        assert!(first.try_lock_exclusive().unwrap());
        assert!(!second.try_lock_exclusive().unwrap());

        first.unlock().unwrap();
        assert!(second.try_lock_exclusive().unwrap());
    }

    #[test]
    fn probe_does_not_keep_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir, "slot");

        let mut probing = LockFile::open(&path).unwrap();
        assert!(probing.probe_free().unwrap());
        assert!(!probing.is_held());

        let mut other = LockFile::open(&path).unwrap();
        assert!(other.try_lock_exclusive().unwrap());
        assert!(!probing.probe_free().unwrap());
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir, "slot");

        {
            let mut held = LockFile::open(&path).unwrap();
            assert!(held.try_lock_exclusive().unwrap());
        }

        let mut after = LockFile::open(&path).unwrap();
        assert!(after.try_lock_exclusive().unwrap());
    }

    #[test]
    fn timeout_acquire_gives_up_when_held() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir, "upload");

        let mut holder = LockFile::open(&path).unwrap();
        assert!(holder.try_lock_exclusive().unwrap());

        let mut waiter = LockFile::open(&path).unwrap();
        let started = Instant::now();
        let acquired = waiter
            .lock_exclusive_timeout(Duration::from_millis(50))
            .unwrap();
        assert!(!acquired);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_acquire_succeeds_when_free() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir, "upload");

        let mut waiter = LockFile::open(&path).unwrap();
        assert!(
            waiter
                .lock_exclusive_timeout(Duration::from_millis(50))
                .unwrap()
        );
        assert!(waiter.is_held());
    }

    #[test]
    fn touch_advances_mtime() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir, "slot");
        let lock = LockFile::open(&path).unwrap();

        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        lock.touch().unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        let mtime = FileTime::from_last_modification_time(&meta);
        assert!(mtime.unix_seconds() > 1_000_000);
    }
}
