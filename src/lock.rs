//! Host-local mutual exclusion for collision passes.
//!
//! A pass holds an advisory `flock` on `<machine data dir>/<label>.lock` for
//! its whole detect-and-repair critical section. Acquisition is non-blocking
//! and retried according to a [`RetryPolicy`].

use crate::error::{Error, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Label of the lock taken around a forwarded-port pass.
pub const COLLISION_LOCK_LABEL: &str = "fpcollision";

/// Delay between attempts when the lock is held elsewhere.
pub const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_secs(1);

/// How to retry a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    /// `None` retries until acquired.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    pub fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(DEFAULT_LOCK_BACKOFF)
    }
}

/// Held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    label: String,
    file: Option<File>,
    path: Option<PathBuf>,
}

impl LockGuard {
    /// Guard that holds nothing (for lockers that do not touch the disk).
    pub fn unlocked(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            file: None,
            path: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                debug!("Failed to unlock {}: {}", self.label, e);
            }
            debug!("Released lock {}", self.label);
        }
    }
}

/// Something that can take a named lock within a scope directory.
pub trait Locker: Send + Sync {
    /// Try once. `Ok(None)` means the lock is held by someone else.
    fn try_acquire(&self, scope: &Path, label: &str) -> Result<Option<LockGuard>>;
}

/// Advisory file lock shared by every process on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLock;

impl ProcessLock {
    pub fn lock_path(scope: &Path, label: &str) -> PathBuf {
        scope.join(format!("{}.lock", label))
    }
}

impl Locker for ProcessLock {
    fn try_acquire(&self, scope: &Path, label: &str) -> Result<Option<LockGuard>> {
        std::fs::create_dir_all(scope).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to create lock directory {}: {}",
                scope.display(),
                e
            ))
        })?;

        let path = Self::lock_path(scope, label);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Filesystem(format!("Failed to open lock file: {}", e)))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                // PID is only for humans inspecting the file.
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired advisory lock on {:?}", path);
                Ok(Some(LockGuard {
                    label: label.to_string(),
                    file: Some(file),
                    path: Some(path),
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                debug!("Lock {:?} is held (owner PID: {:?})", path, holder.trim());
                Ok(None)
            }
            Err(e) => Err(Error::Filesystem(format!(
                "Failed to lock {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Always succeeds immediately. For single-process tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLocker;

impl Locker for NoopLocker {
    fn try_acquire(&self, _scope: &Path, label: &str) -> Result<Option<LockGuard>> {
        Ok(Some(LockGuard::unlocked(label)))
    }
}

/// Reports contention for the first `busy_for` attempts, then succeeds.
/// `u32::MAX` keeps it contended forever.
#[derive(Debug, Default)]
pub struct ContendedLocker {
    busy_for: u32,
    attempts: Mutex<u32>,
}

impl ContendedLocker {
    pub fn new(busy_for: u32) -> Self {
        Self {
            busy_for,
            attempts: Mutex::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

impl Locker for ContendedLocker {
    fn try_acquire(&self, _scope: &Path, label: &str) -> Result<Option<LockGuard>> {
        let mut attempts = self.attempts.lock();
        *attempts += 1;
        if *attempts <= self.busy_for {
            Ok(None)
        } else {
            Ok(Some(LockGuard::unlocked(label)))
        }
    }
}

/// Acquire `label` in `scope`, retrying per `policy`.
pub fn acquire(
    locker: &dyn Locker,
    scope: &Path,
    label: &str,
    policy: RetryPolicy,
) -> Result<LockGuard> {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        if let Some(guard) = locker.try_acquire(scope, label)? {
            if attempts > 1 {
                debug!("Acquired lock {} after {} attempts", label, attempts);
            }
            return Ok(guard);
        }

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(Error::LockTimeout {
                label: label.to_string(),
                attempts,
            });
        }

        debug!(
            "Lock {} busy, retrying in {:?} (attempt {})",
            label, policy.backoff, attempts
        );
        std::thread::sleep(policy.backoff);
    }
}

/// Run `body` while holding the lock. The lock is released when `body`
/// returns, errors, or panics.
pub fn with_lock<T>(
    locker: &dyn Locker,
    scope: &Path,
    label: &str,
    policy: RetryPolicy,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = acquire(locker, scope, label, policy)?;
    body()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProcessLock;

        let guard = lock.try_acquire(dir.path(), "fpcollision").unwrap();
        assert!(guard.is_some());
        assert!(lock.try_acquire(dir.path(), "fpcollision").unwrap().is_none());

        // Different label, different lock
        assert!(lock.try_acquire(dir.path(), "other").unwrap().is_some());

        drop(guard);
        assert!(lock.try_acquire(dir.path(), "fpcollision").unwrap().is_some());
    }

    #[test]
    fn lock_file_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ProcessLock
            .try_acquire(dir.path(), COLLISION_LOCK_LABEL)
            .unwrap()
            .unwrap();
        let contents = std::fs::read_to_string(guard.path().unwrap()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn bounded_policy_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locker = ContendedLocker::new(u32::MAX);
        let policy = RetryPolicy::bounded(Duration::from_millis(1), 3);

        let err = acquire(&locker, dir.path(), "fpcollision", policy).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { attempts: 3, .. }));
        assert_eq!(locker.attempts(), 3);
    }

    #[test]
    fn unbounded_policy_retries_until_free() {
        let dir = tempfile::tempdir().unwrap();
        let locker = ContendedLocker::new(4);
        let policy = RetryPolicy::unbounded(Duration::from_millis(1));

        let guard = acquire(&locker, dir.path(), "fpcollision", policy).unwrap();
        assert_eq!(guard.label(), "fpcollision");
        assert_eq!(locker.attempts(), 5);
    }

    #[test]
    fn with_lock_releases_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetryPolicy::bounded(Duration::from_millis(1), 1);

        let result: Result<()> = with_lock(&ProcessLock, dir.path(), "fpcollision", policy, || {
            Err(Error::Probe("boom".into()))
        });
        assert!(result.is_err());

        assert!(ProcessLock
            .try_acquire(dir.path(), "fpcollision")
            .unwrap()
            .is_some());
    }
}
