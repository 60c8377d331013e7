//! Exclusive run lock on a backup destination.
//!
//! The lock is a JSON file naming the owning process, held under an exclusive
//! OS file lock for as long as the run lasts. Only the process holding the
//! file lock may rewrite or remove the file, so two runs reclaiming the same
//! stale lock cannot both win. A lock whose owner no longer runs is stale and
//! gets reclaimed.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub static LOCK_FILE_NAME: &str = ".backup.lock";
static MAX_ACQUIRE_ATTEMPTS: usize = 3;
static HOLDER_READ_ATTEMPTS: usize = 5;
static HOLDER_READ_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockContent {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockContent {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// Ownership of a destination for one run.
///
/// The lock file is removed by [`LockGuard::release`] or, failing that, when
/// the guard is dropped, so every exit path of a run gives the lock back.
/// The OS file lock goes away with `file`.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: File,
    content: LockContent,
    released: bool,
}

impl LockGuard {
    /// Takes the lock in `dir`, reclaiming it if its owner is gone.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<LockGuard> {
        let path = dir.as_ref().join(LOCK_FILE_NAME);

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(Error::from)
                .with_msg(format!("Opening lock {:?} failed", path))?;

            if !try_lock_exclusive(&file)
                .map_err(Error::from)
                .with_msg(format!("Locking {:?} failed", path))?
            {
                return Err(Error::AlreadyRunning {
                    holder: read_busy_holder(&mut file),
                    lock_path: path,
                });
            }

            // The previous owner may have removed the file between our open
            // and our lock, leaving us holding an unlinked inode.
            if !refers_to(&file, &path)? {
                continue;
            }

            match read_content(&mut file) {
                Ok(None) => {}
                Ok(Some(holder)) if is_process_alive(holder.pid) => {
                    return Err(Error::AlreadyRunning {
                        holder: Some(holder),
                        lock_path: path,
                    });
                }
                Ok(Some(holder)) => tracing::warn!(
                    "Reclaiming stale lock {:?} left by pid {} at {}",
                    path,
                    holder.pid,
                    holder.acquired_at
                ),
                Err(e) if matches!(e.root(), Error::SerdeJson(_)) => {
                    tracing::warn!("Reclaiming unreadable lock {:?}: {e}", path)
                }
                Err(e) => return Err(e.with_msg(format!("Reading lock {:?} failed", path))),
            }

            let content = LockContent::current();
            write_content(&mut file, &content)
                .with_msg(format!("Writing lock {:?} failed", path))?;
            tracing::info!("Acquired lock {:?} for pid {}", path, content.pid);
            return Ok(LockGuard {
                path,
                file,
                content,
                released: false,
            });
        }

        Err(Error::from(std::io::Error::other(format!(
            "lock {:?} kept changing hands, gave up after {} attempts",
            path, MAX_ACQUIRE_ATTEMPTS
        ))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &LockContent {
        &self.content
    }

    /// Removes the lock file if it is still ours.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&mut self) -> Result<()> {
        if !refers_to(&self.file, &self.path)? {
            tracing::warn!("Lock {:?} vanished before release", self.path);
            return Ok(());
        }
        match read_content(&mut self.file) {
            Ok(Some(holder)) if holder == self.content => {
                std::fs::remove_file(&self.path)
                    .map_err(Error::from)
                    .with_msg(format!("Removing lock {:?} failed", self.path))?;
                tracing::info!("Released lock {:?}", self.path);
                Ok(())
            }
            Ok(Some(holder)) => {
                tracing::warn!(
                    "Lock {:?} now belongs to pid {}, leaving it in place",
                    self.path,
                    holder.pid
                );
                Ok(())
            }
            Ok(None) => {
                tracing::warn!("Lock {:?} was emptied before release", self.path);
                Ok(())
            }
            Err(e) => Err(e.with_msg(format!("Reading lock {:?} failed", self.path))),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove_if_owned() {
                tracing::error!("{e}");
            }
        }
    }
}

/// Empty content means a lock file nobody has written to yet.
fn read_content(file: &mut File) -> Result<Option<LockContent>> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&text)?))
}

fn write_content(file: &mut File, content: &LockContent) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&serde_json::to_vec(content)?)?;
    file.sync_all()?;
    Ok(())
}

/// Reads who holds a busy lock. The holder may still be writing its content,
/// so an unreadable file is retried briefly before giving up on it.
fn read_busy_holder(file: &mut File) -> Option<LockContent> {
    for _ in 0..HOLDER_READ_ATTEMPTS {
        if let Ok(Some(holder)) = read_content(file) {
            return Some(holder);
        }
        std::thread::sleep(HOLDER_READ_BACKOFF);
    }
    None
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    match file.try_lock() {
        Ok(()) => Ok(true),
        Err(std::fs::TryLockError::WouldBlock) => Ok(false),
        Err(std::fs::TryLockError::Error(e)) => Err(e),
    }
}

/// Whether `path` still names the file behind `file`.
#[cfg(unix)]
fn refers_to(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let opened = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(named) => Ok(opened.dev() == named.dev() && opened.ino() == named.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn refers_to(_file: &File, path: &Path) -> Result<bool> {
    // An open file cannot be removed here, so the path still names it.
    match std::fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Signal 0 checks that the process exists without touching it.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // 0 and negative values address process groups, not a process.
    let pid = match i32::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => return false,
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    // Only called once the file lock is ours, which its owner would still hold.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::ErrorCategory;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn read_lock_file(path: &Path) -> LockContent {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn write_stale_lock(dir: &Path) -> LockContent {
        let stale = LockContent {
            pid: u32::MAX - 1,
            acquired_at: Utc::now(),
        };
        std::fs::write(dir.join(LOCK_FILE_NAME), serde_json::to_string(&stale).unwrap()).unwrap();
        stale
    }

    #[test]
    fn test_lock_acquisition() {
        let temp_dir = TempDir::new().unwrap();

        let lock1 = LockGuard::acquire(temp_dir.path()).unwrap();
        assert!(temp_dir.path().join(LOCK_FILE_NAME).exists());

        let err = LockGuard::acquire(temp_dir.path()).unwrap_err();
        match err {
            Error::AlreadyRunning { holder, .. } => {
                assert_eq!(holder.as_ref(), Some(lock1.content()))
            }
            e => panic!("Expected AlreadyRunning, got {e}"),
        }

        drop(lock1);
        assert!(!temp_dir.path().join(LOCK_FILE_NAME).exists());
        assert!(LockGuard::acquire(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_lock_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = LockGuard::acquire(temp_dir.path()).unwrap();
        let lock_path = lock.path().to_path_buf();

        assert_eq!(&read_lock_file(&lock_path), lock.content());

        lock.release().unwrap();
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_contention_leaves_existing_lock_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let lock = LockGuard::acquire(temp_dir.path()).unwrap();
        let before = std::fs::read(lock.path()).unwrap();

        assert!(LockGuard::acquire(temp_dir.path()).is_err());
        assert_eq!(std::fs::read(lock.path()).unwrap(), before);
        let leftovers = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_release_keeps_foreign_lock() {
        let temp_dir = TempDir::new().unwrap();
        let lock = LockGuard::acquire(temp_dir.path()).unwrap();
        let foreign = LockContent {
            pid: 1,
            acquired_at: Utc::now(),
        };
        std::fs::write(lock.path(), serde_json::to_string(&foreign).unwrap()).unwrap();
        let lock_path = lock.path().to_path_buf();

        lock.release().unwrap();
        assert_eq!(read_lock_file(&lock_path), foreign);
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        write_stale_lock(temp_dir.path());

        let lock = LockGuard::acquire(temp_dir.path()).unwrap();
        assert_eq!(lock.content().pid, std::process::id());
        assert_eq!(
            read_lock_file(&temp_dir.path().join(LOCK_FILE_NAME)).pid,
            std::process::id()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_live_holder_without_file_lock_is_respected() {
        let temp_dir = TempDir::new().unwrap();
        let holder = LockContent {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let lock_path = temp_dir.path().join(LOCK_FILE_NAME);
        std::fs::write(&lock_path, serde_json::to_string(&holder).unwrap()).unwrap();

        let err = LockGuard::acquire(temp_dir.path()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::LockContention);
        assert_eq!(read_lock_file(&lock_path), holder);
    }

    #[test]
    fn test_concurrent_reclaim_has_one_winner() {
        const CONTENDERS: usize = 8;
        let temp_dir = TempDir::new().unwrap();

        for _ in 0..50 {
            write_stale_lock(temp_dir.path());
            let start = Barrier::new(CONTENDERS);
            let done = Barrier::new(CONTENDERS);

            let outcomes: Vec<std::result::Result<(), ErrorCategory>> =
                std::thread::scope(|s| {
                    let handles = (0..CONTENDERS)
                        .map(|_| {
                            s.spawn(|| {
                                start.wait();
                                let result = LockGuard::acquire(temp_dir.path());
                                // Everyone has tried before any winner lets go.
                                done.wait();
                                result.map(drop).map_err(|e| e.category())
                            })
                        })
                        .collect::<Vec<_>>();
                    handles.into_iter().map(|h| h.join().unwrap()).collect()
                });

            assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
            assert!(outcomes
                .iter()
                .filter_map(|o| o.as_ref().err())
                .all(|c| *c == ErrorCategory::LockContention));
            assert!(!temp_dir.path().join(LOCK_FILE_NAME).exists());
        }
    }

    #[test]
    fn test_garbled_lock_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(LOCK_FILE_NAME), "not json").unwrap();

        assert!(LockGuard::acquire(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_unreadable_lock_is_not_removed() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join(LOCK_FILE_NAME);
        std::fs::create_dir(&lock_path).unwrap();
        std::fs::write(lock_path.join("keep"), "x").unwrap();

        let err = LockGuard::acquire(temp_dir.path()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Io);
        assert!(lock_path.join("keep").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX - 1));
    }
}
