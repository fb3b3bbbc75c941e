//! Lock files: an exclusively created path whose existence is the lock.
//!
//! The file holds the owner identity and the acquisition time. Its mtime is the only
//! staleness signal: a lock older than `stale_threshold` is presumed abandoned by a
//! crashed holder and is taken over.
//!
//! Removal re-reads the file first and only deletes it if it still carries the record
//! that was observed (on takeover) or written (on release). A lock re-created by another
//! process in between is left alone.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tracing::{debug, warn};

use crate::errors::LockError;
use crate::retry::Backoff;

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity written into lock files when the caller does not supply one.
pub fn default_owner() -> String {
    format!("pid-{}", std::process::id())
}

/// Lock path guarding `path` (`<path>.lock`).
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up after waiting this long
    pub timeout: Duration,
    /// Locks older than this are taken over
    pub stale_threshold: Duration,
    /// Sleep between attempts while the lock is held
    pub poll_interval: Duration,
    /// Identity recorded in the lock file
    pub owner: String,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            owner: default_owner(),
        }
    }
}

impl LockOptions {
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }
}

/// A held lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner: String,
    record: String,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Release explicitly, surfacing any I/O error that `Drop` would swallow.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.remove_own()
    }

    fn remove_own(&self) -> Result<(), LockError> {
        let removed = remove_if_unchanged(&self.path, &self.record).map_err(|source| {
            LockError::Io {
                path: self.path.clone(),
                source,
            }
        })?;
        if !removed {
            warn!(
                lock = %self.path.display(),
                owner = %self.owner,
                holder = %read_holder(&self.path),
                "Lock was taken over before release; leaving it in place"
            );
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.remove_own();
        }
    }
}

/// Acquire the lock at `lock_path`, waiting up to `options.timeout`.
pub fn acquire(lock_path: &Path, options: &LockOptions) -> Result<LockGuard, LockError> {
    let io_err = |source: std::io::Error| LockError::Io {
        path: lock_path.to_path_buf(),
        source,
    };

    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let start = Instant::now();
    let mut backoff = Backoff::fixed(options.poll_interval);

    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                let record = format!("{}\n{}\n", options.owner, Utc::now().to_rfc3339());
                if let Err(source) = file.write_all(record.as_bytes()) {
                    drop(file);
                    let _ = fs::remove_file(lock_path);
                    return Err(io_err(source));
                }
                debug!(
                    lock = %lock_path.display(),
                    owner = %options.owner,
                    attempts = backoff.attempt() + 1,
                    "Lock acquired"
                );
                return Ok(LockGuard {
                    path: lock_path.to_path_buf(),
                    owner: options.owner.clone(),
                    record,
                    released: false,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                match lock_age(lock_path).map_err(io_err)? {
                    // Released between our create attempt and the stat.
                    None => continue,
                    Some(age) if age > options.stale_threshold => {
                        let stale = match fs::read_to_string(lock_path) {
                            Ok(stale) => stale,
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(err) => return Err(io_err(err)),
                        };
                        // Someone else may have replaced the lock since the stat.
                        if !lock_age(lock_path)
                            .map_err(io_err)?
                            .is_some_and(|age| age > options.stale_threshold)
                        {
                            continue;
                        }
                        warn!(
                            lock = %lock_path.display(),
                            holder = %holder_of(&stale),
                            age_ms = age.as_millis() as u64,
                            "Taking over stale lock"
                        );
                        remove_if_unchanged(lock_path, &stale).map_err(io_err)?;
                        continue;
                    }
                    Some(_) => {}
                }

                let waited = start.elapsed();
                if waited >= options.timeout {
                    return Err(LockError::Timeout {
                        path: lock_path.to_path_buf(),
                        waited,
                        holder: read_holder(lock_path),
                    });
                }
                let remaining = options.timeout - waited;
                thread::sleep(backoff.next_delay().min(remaining));
            }
            Err(err) => return Err(io_err(err)),
        }
    }
}

/// Owner recorded in the lock file, or `"unknown"` if it cannot be read.
pub fn read_holder(lock_path: &Path) -> String {
    fs::read_to_string(lock_path)
        .map(|content| holder_of(&content))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn holder_of(record: &str) -> String {
    record
        .lines()
        .next()
        .filter(|owner| !owner.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Delete the lock only if it still holds `record`. Returns whether it was removed; a
/// missing file counts as removed.
fn remove_if_unchanged(lock_path: &Path, record: &str) -> std::io::Result<bool> {
    match fs::read_to_string(lock_path) {
        Ok(current) if current == record => {}
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    }
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err),
    }
}

/// Age of the lock by mtime, or `None` if it no longer exists.
fn lock_age(lock_path: &Path) -> std::io::Result<Option<Duration>> {
    let modified = match fs::metadata(lock_path) {
        Ok(meta) => meta.modified()?,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    // An mtime in the future (clock skew) counts as fresh.
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn fast_options(owner: &str) -> LockOptions {
        LockOptions::default()
            .owner(owner)
            .timeout(Duration::from_millis(300))
            .poll_interval(Duration::from_millis(10))
    }

    fn age_lock(lock_path: &Path, age: Duration) {
        let file = fs::OpenOptions::new().write(true).open(lock_path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_lock_path_convention() {
        assert_eq!(
            lock_path_for(Path::new("/x/manifest-illustrate.json")),
            PathBuf::from("/x/manifest-illustrate.json.lock")
        );
    }

    #[test]
    fn test_acquire_writes_owner_and_release_removes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");

        let guard = acquire(&path, &fast_options("worker-a")).unwrap();
        assert!(path.exists());
        assert_eq!(read_holder(&path), "worker-a");
        assert_eq!(guard.owner(), "worker-a");

        guard.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        {
            let _guard = acquire(&path, &fast_options("worker-a")).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_release_of_missing_lock_is_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        let guard = acquire(&path, &fast_options("worker-a")).unwrap();
        fs::remove_file(&path).unwrap();
        guard.release().unwrap();
    }

    #[test]
    fn test_held_lock_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        let _held = acquire(&path, &fast_options("worker-a")).unwrap();

        let started = Instant::now();
        let err = acquire(&path, &fast_options("worker-b")).unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(300));
        match err {
            LockError::Timeout { holder, .. } => assert_eq!(holder, "worker-a"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        fs::write(&path, "crashed-worker\n2020-01-01T00:00:00Z\n").unwrap();
        age_lock(&path, Duration::from_secs(3600));

        let options = fast_options("worker-b").stale_threshold(Duration::from_secs(60));
        let guard = acquire(&path, &options).unwrap();

        assert_eq!(read_holder(&path), "worker-b");
        drop(guard);
    }

    #[test]
    fn test_fresh_foreign_lock_is_not_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        fs::write(&path, "slow-worker\n").unwrap();

        let options = fast_options("worker-b").stale_threshold(Duration::from_secs(60));
        assert!(matches!(
            acquire(&path, &options),
            Err(LockError::Timeout { .. })
        ));
        assert_eq!(read_holder(&path), "slow-worker");
    }

    #[test]
    fn test_guard_leaves_lock_it_no_longer_owns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        let guard = acquire(&path, &fast_options("worker-a")).unwrap();

        fs::write(&path, "worker-b\n2025-01-01T00:00:00Z\n").unwrap();
        guard.release().unwrap();
        assert_eq!(read_holder(&path), "worker-b");

        let guard = acquire(&path, &fast_options("worker-c")).unwrap();
        fs::write(&path, "worker-d\n2025-01-01T00:00:00Z\n").unwrap();
        drop(guard);
        assert_eq!(read_holder(&path), "worker-d");
    }

    #[test]
    fn test_remove_if_unchanged_keeps_replaced_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        fs::write(&path, "crashed-worker\n2020-01-01T00:00:00Z\n").unwrap();

        assert!(!remove_if_unchanged(&path, "other-worker\n2020-01-01T00:00:00Z\n").unwrap());
        assert!(path.exists());

        assert!(remove_if_unchanged(&path, "crashed-worker\n2020-01-01T00:00:00Z\n").unwrap());
        assert!(!path.exists());
        assert!(remove_if_unchanged(&path, "anything").unwrap());
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json.lock");
        let held = acquire(&path, &fast_options("worker-a")).unwrap();

        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let options = fast_options("worker-b").timeout(Duration::from_secs(5));
            acquire(&waiter_path, &options).map(|g| g.owner().to_string())
        });

        thread::sleep(Duration::from_millis(50));
        held.release().unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), "worker-b");
    }

    #[test]
    fn test_lock_provides_mutual_exclusion() {
        let dir = tempdir().unwrap();
        let path = Arc::new(dir.path().join("m.json.lock"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = Arc::clone(&path);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let options = fast_options(&format!("worker-{i}"))
                        .timeout(Duration::from_secs(10))
                        .poll_interval(Duration::from_millis(1));
                    for _ in 0..5 {
                        let guard = acquire(&path, &options).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        guard.release().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
