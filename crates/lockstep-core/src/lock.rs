//! Cross-process writer lock.
//!
//! Cooperating processes sharing one working tree serialize their units on an
//! `fs2` advisory lock; in-process serialization is the write queue's job.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::ErrorCode;

/// Lock file name, created inside the git directory so it never shows up as
/// an untracked change in the working tree.
pub const WRITER_LOCK_FILE: &str = "lockstep-writer.lock";

const FIRST_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: writer lock {} still held after {waited:?}", ErrorCode::LockContention.code(), .path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("{}: writer lock file: {0}", ErrorCode::FileWriteFailed.code())]
    Io(#[from] io::Error),
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io(_) => ErrorCode::FileWriteFailed,
        }
    }
}

/// Exclusive writer lock held for one transaction unit. Dropping releases it.
#[derive(Debug)]
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Take the lock at `path`, retrying with doubling backoff until
    /// `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] when another holder keeps the lock past
    /// `timeout`; [`LockError::Io`] when the lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        let mut backoff = FIRST_BACKOFF;
        while file.try_lock_exclusive().is_err() {
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            debug!(path = %path.display(), ?waited, "writer lock busy");
            thread::sleep(backoff.min(timeout.saturating_sub(waited)));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::{LockError, WRITER_LOCK_FILE, WriterLock};
    use crate::error::ErrorCode;
    use crossbeam::channel;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_creates_missing_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".git").join(WRITER_LOCK_FILE);
        let lock = WriterLock::acquire(&path, Duration::from_millis(50)).expect("lock");
        assert_eq!(lock.path(), path);
        assert!(path.exists());
    }

    #[test]
    fn second_holder_times_out_with_contention_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("writer.lock");
        let _held = WriterLock::acquire(&path, Duration::from_millis(50)).expect("first");

        let err = WriterLock::acquire(&path, Duration::from_millis(30)).expect_err("contended");
        assert!(matches!(&err, LockError::Timeout { path: p, .. } if *p == path));
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.to_string().starts_with("E5003"));
    }

    #[test]
    fn waiter_gets_the_lock_once_the_holder_drops_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("writer.lock");
        let (held_tx, held_rx) = channel::bounded::<()>(0);
        let (release_tx, release_rx) = channel::bounded::<()>(0);

        let holder_path = path.clone();
        let holder = thread::spawn(move || {
            let _lock = WriterLock::acquire(&holder_path, Duration::from_secs(1)).expect("holder");
            held_tx.send(()).expect("signal");
            release_rx.recv().expect("release");
        });

        held_rx.recv().expect("held");
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            release_tx.send(()).expect("release");
        });
        let lock = WriterLock::acquire(&path, Duration::from_secs(2)).expect("waiter");
        assert_eq!(lock.path(), path);

        release.join().expect("release thread");
        holder.join().expect("holder thread");
    }
}
