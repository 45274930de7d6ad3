//! Lock files enforcing one writer per key.
//!
//! Every read-modify-write of a parent happens under the lock of its parent
//! key, and every orphan registry append under the registry lock. A lock is
//! a file created with `create_new`; whoever creates it owns it until the
//! guard is dropped. Contention is retried a bounded number of times.
//!
//! A lock file whose mtime is older than `stale_after` belongs to a crashed
//! writer and may be broken. Live guards keep their mtime fresh from a
//! heartbeat thread, so a slow holder is never mistaken for a dead one.
//! Writers call [`KeyLock::ensure_held`] right before persisting.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use uuid::Uuid;

use crate::config::LockingConfig;

/// Floor for the heartbeat period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct LockPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// A lock file not refreshed for this long is assumed abandoned by a crashed writer.
    pub stale_after: Duration,
}

impl LockPolicy {
    /// Guards refresh their lock files four times per stale period.
    fn heartbeat_every(&self) -> Duration {
        (self.stale_after / 4).max(MIN_HEARTBEAT)
    }
}

impl From<&LockingConfig> for LockPolicy {
    fn from(cfg: &LockingConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            retry_delay: cfg.retry_delay(),
            stale_after: cfg.stale_after(),
        }
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy::from(&LockingConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {} still held after {attempts} attempts", path.display())]
    Contended { path: PathBuf, attempts: u32 },
    #[error("lock {} was taken over by another writer", path.display())]
    Lost { path: PathBuf },
    #[error("lock I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Guard for an acquired lock file. Dropping it releases the lock.
#[derive(Debug)]
pub struct KeyLock {
    heartbeat: Option<Heartbeat>,
    path: PathBuf,
    token: String,
    released: bool,
}

impl KeyLock {
    /// Lock `<dir>/<key>.lock`.
    pub fn for_key(dir: &Path, key: &str, policy: &LockPolicy) -> Result<Self, LockError> {
        Self::acquire(dir.join(format!("{}.lock", key)), policy)
    }

    pub fn acquire(path: PathBuf, policy: &LockPolicy) -> Result<Self, LockError> {
        let mut lock = Self::acquire_bare(path, policy)?;
        let heartbeat = Heartbeat::spawn(policy.heartbeat_every());
        heartbeat.add(&lock);
        lock.heartbeat = Some(heartbeat);
        Ok(lock)
    }

    /// Acquire without a heartbeat of its own; the caller provides one.
    fn acquire_bare(path: PathBuf, policy: &LockPolicy) -> Result<Self, LockError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let token = Uuid::new_v4().to_string();

        for attempt in 1..=policy.max_attempts {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{} {}", token, std::process::id()).map_err(|source| {
                        LockError::Io {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    tracing::trace!(lock = %path.display(), attempt, "lock acquired");
                    return Ok(Self {
                        heartbeat: None,
                        path,
                        token,
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, policy.stale_after) {
                        match break_stale(&path, policy.stale_after, &token) {
                            Ok(true) => {
                                tracing::warn!(lock = %path.display(), "removed stale lock");
                                continue;
                            }
                            Ok(false) => {}
                            Err(source) => return Err(LockError::Io { path, source }),
                        }
                    }
                    if attempt < policy.max_attempts {
                        thread::sleep(policy.retry_delay);
                    }
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }

        Err(LockError::Contended {
            path,
            attempts: policy.max_attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail with [`LockError::Lost`] unless the lock file is still ours.
    /// Refreshes the file's mtime as a side effect.
    pub fn ensure_held(&self) -> Result<(), LockError> {
        match touch_if_owned(&self.path, &self.token) {
            Ok(true) => Ok(()),
            Ok(false) => Err(LockError::Lost {
                path: self.path.clone(),
            }),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.heartbeat.take();
        self.remove_if_owned().map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn remove_if_owned(&self) -> io::Result<()> {
        // A stale-lock sweep by another writer may have replaced our file.
        match fs::read_to_string(&self.path) {
            Ok(content) if content.starts_with(&self.token) => fs::remove_file(&self.path),
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // Stop refreshing before the file goes away.
        self.heartbeat.take();
        if !self.released {
            let _ = self.remove_if_owned();
        }
    }
}

/// Several key locks held together, acquired in sorted key order and kept
/// alive by one shared heartbeat.
#[derive(Debug)]
pub struct LockSet {
    heartbeat: Option<Heartbeat>,
    locks: Vec<KeyLock>,
}

impl LockSet {
    pub fn for_keys<'k>(
        dir: &Path,
        keys: impl IntoIterator<Item = &'k str>,
        policy: &LockPolicy,
    ) -> Result<Self, LockError> {
        let mut keys: Vec<&str> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        // Declared first so that on early return the heartbeat stops before the files go.
        let mut locks = Vec::with_capacity(keys.len());
        let heartbeat = Heartbeat::spawn(policy.heartbeat_every());
        for key in keys {
            let lock = KeyLock::acquire_bare(dir.join(format!("{}.lock", key)), policy)?;
            // Registered one by one so early locks stay fresh while later ones are awaited.
            heartbeat.add(&lock);
            locks.push(lock);
        }
        Ok(LockSet {
            heartbeat: Some(heartbeat),
            locks,
        })
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// [`KeyLock::ensure_held`] over every lock of the set.
    pub fn ensure_held(&self) -> Result<(), LockError> {
        self.locks.iter().try_for_each(KeyLock::ensure_held)
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.heartbeat.take();
        self.locks.clear();
    }
}

/// Background thread refreshing lock files until dropped.
#[derive(Debug)]
struct Heartbeat {
    locks: Option<mpsc::Sender<(PathBuf, String)>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn spawn(every: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<(PathBuf, String)>();
        let handle = thread::spawn(move || {
            let mut locks: Vec<(PathBuf, String)> = Vec::new();
            loop {
                match rx.recv_timeout(every) {
                    Ok(lock) => locks.push(lock),
                    Err(RecvTimeoutError::Timeout) => {
                        locks.retain(|(path, token)| match touch_if_owned(path, token) {
                            Ok(true) => true,
                            Ok(false) => {
                                tracing::error!(lock = %path.display(), "lock lost while held");
                                false
                            }
                            Err(err) => {
                                tracing::warn!(lock = %path.display(), error = %err, "lock heartbeat failed");
                                true
                            }
                        });
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self {
            locks: Some(tx),
            handle: Some(handle),
        }
    }

    fn add(&self, lock: &KeyLock) {
        if let Some(tx) = &self.locks {
            let _ = tx.send((lock.path.clone(), lock.token.clone()));
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.locks.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bump the mtime of `path` if it still carries `token`. `Ok(false)` when it does not.
fn touch_if_owned(path: &Path, token: &str) -> io::Result<bool> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if !content.starts_with(token) {
        return Ok(false);
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(true)
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

/// Remove a stale lock without ever deleting a live one.
///
/// The lock is first renamed to a name only this contender uses; rename is
/// atomic, so of several breakers exactly one moves a given file. If the
/// moved file turns out to be fresh, it is linked back into place (unless a
/// new lock already took the path) and `false` is returned.
fn break_stale(path: &Path, stale_after: Duration, token: &str) -> io::Result<bool> {
    let mut moved = OsString::from(path.as_os_str());
    moved.push(format!(".{}.stale", token));
    let moved = PathBuf::from(moved);

    match fs::rename(path, &moved) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    }
    if is_stale(&moved, stale_after) {
        fs::remove_file(&moved)?;
        return Ok(true);
    }

    let restored = fs::hard_link(&moved, path);
    fs::remove_file(&moved)?;
    match restored {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockPolicy {
        LockPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(5),
            stale_after: Duration::from_secs(3600),
        }
    }

    #[test]
    fn second_acquire_is_contended_until_release() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = KeyLock::for_key(tmp.path(), "S1A_EW_GRD_R140", &quick()).unwrap();
        assert!(first.path().exists());

        let err = KeyLock::for_key(tmp.path(), "S1A_EW_GRD_R140", &quick()).unwrap_err();
        assert!(matches!(err, LockError::Contended { attempts: 3, .. }));

        // Different keys never contend.
        let _other = KeyLock::for_key(tmp.path(), "S2A_MSIL1C_R108", &quick()).unwrap();

        first.release().unwrap();
        let again = KeyLock::for_key(tmp.path(), "S1A_EW_GRD_R140", &quick()).unwrap();
        drop(again);
        assert!(!tmp.path().join("S1A_EW_GRD_R140.lock").exists());
    }

    #[test]
    fn stale_locks_are_reclaimed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("k.lock");
        fs::write(&path, "someone-else 1\n").unwrap();
        let policy = LockPolicy {
            stale_after: Duration::ZERO,
            ..quick()
        };
        std::thread::sleep(Duration::from_millis(20));
        let lock = KeyLock::acquire(path.clone(), &policy).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with(&lock.token));
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn held_lock_outlives_stale_period() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = LockPolicy {
            stale_after: Duration::from_millis(200),
            ..quick()
        };
        let first = KeyLock::for_key(tmp.path(), "S1A_EW_GRD_R140", &policy).unwrap();
        std::thread::sleep(Duration::from_millis(600));

        let second = KeyLock::for_key(tmp.path(), "S1A_EW_GRD_R140", &policy);
        assert!(matches!(second, Err(LockError::Contended { .. })));
        first.ensure_held().unwrap();
    }

    #[test]
    fn lock_set_outlives_stale_period() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = LockPolicy {
            stale_after: Duration::from_millis(200),
            ..quick()
        };
        let set = LockSet::for_keys(tmp.path(), ["S1A_IW_GRD_R002", "S1A_EW_GRD_R140"], &policy)
            .unwrap();
        assert_eq!(set.len(), 2);
        std::thread::sleep(Duration::from_millis(600));

        assert!(KeyLock::for_key(tmp.path(), "S1A_IW_GRD_R002", &policy).is_err());
        set.ensure_held().unwrap();
        drop(set);
        assert!(KeyLock::for_key(tmp.path(), "S1A_IW_GRD_R002", &policy).is_ok());
    }

    #[test]
    fn fresh_lock_survives_a_late_breaker() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("k.lock");
        fs::write(&path, "live-holder 1\n").unwrap();

        // The breaker judged the lock stale, but it was refreshed since.
        let broken = break_stale(&path, Duration::from_secs(3600), "breaker").unwrap();
        assert!(!broken);
        assert_eq!(fs::read_to_string(&path).unwrap(), "live-holder 1\n");
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn ensure_held_detects_takeover() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("k.lock");
        let lock = KeyLock::acquire(path.clone(), &quick()).unwrap();
        lock.ensure_held().unwrap();

        fs::write(&path, "replaced 2\n").unwrap();
        assert!(matches!(lock.ensure_held(), Err(LockError::Lost { .. })));
    }

    #[test]
    fn drop_leaves_foreign_lock_alone() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("k.lock");
        let lock = KeyLock::acquire(path.clone(), &quick()).unwrap();
        fs::write(&path, "replaced 2\n").unwrap();
        drop(lock);
        assert!(path.exists());
    }
}
