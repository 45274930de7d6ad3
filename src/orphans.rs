//! Durable registry of children that could not be linked.
//!
//! One child filename per line. Entries are only ever appended, never
//! duplicated, and never removed by this crate; the file is the place an
//! operator looks to remediate unlinked children.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::lock::{KeyLock, LockError, LockPolicy};

#[derive(Debug, Error)]
pub enum OrphanError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("orphan registry {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct OrphanRegistry {
    path: PathBuf,
    policy: LockPolicy,
}

impl OrphanRegistry {
    pub fn new(path: impl Into<PathBuf>, policy: LockPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `child_filename` unless it is already registered.
    ///
    /// Returns `true` when a new entry was written. Creates the registry on
    /// first use. The read-compare-append runs under the registry lock, so
    /// concurrent calls for the same child leave exactly one entry.
    pub fn record(&self, child_filename: &str) -> Result<bool, OrphanError> {
        let entry = child_filename.trim();
        let _guard = KeyLock::acquire(self.lock_path(), &self.policy)?;

        let existing = self.entries()?;
        if existing.iter().any(|e| e == entry) {
            tracing::debug!(child = entry, "already registered as orphan");
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io(source))?;
        let needs_newline = fs::read(&self.path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);
        if needs_newline {
            writeln!(file).map_err(|source| self.io(source))?;
        }
        writeln!(file, "{}", entry).map_err(|source| self.io(source))?;
        file.sync_all().map_err(|source| self.io(source))?;
        Ok(true)
    }

    /// All registered filenames, in insertion order. Empty when the file does not exist yet.
    pub fn entries(&self) -> Result<Vec<String>, OrphanError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(self.io(source)),
        }
    }

    pub fn contains(&self, child_filename: &str) -> Result<bool, OrphanError> {
        Ok(self.entries()?.iter().any(|e| e == child_filename.trim()))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn io(&self, source: io::Error) -> OrphanError {
        OrphanError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = OrphanRegistry::new(tmp.path().join("orphans.txt"), LockPolicy::default());
        assert!(registry.entries().unwrap().is_empty());

        assert!(registry.record("S1A_x.xml").unwrap());
        for _ in 0..4 {
            assert!(!registry.record("S1A_x.xml").unwrap());
        }
        assert!(registry.record("S2A_y.xml").unwrap());

        assert_eq!(registry.entries().unwrap(), vec!["S1A_x.xml", "S2A_y.xml"]);
        assert!(registry.contains("S2A_y.xml").unwrap());
        assert!(!tmp.path().join("orphans.txt.lock").exists());
    }

    #[test]
    fn creates_missing_parent_directory_lazily() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = OrphanRegistry::new(
            tmp.path().join("state").join("orphans.txt"),
            LockPolicy::default(),
        );
        assert!(registry.record("a.xml").unwrap());
        assert_eq!(registry.entries().unwrap(), vec!["a.xml"]);
    }

    #[test]
    fn tolerates_missing_trailing_newline() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("orphans.txt");
        fs::write(&path, "old.xml").unwrap();
        let registry = OrphanRegistry::new(&path, LockPolicy::default());
        assert!(registry.record("new.xml").unwrap());
        assert_eq!(registry.entries().unwrap(), vec!["old.xml", "new.xml"]);
    }

    #[test]
    fn concurrent_recording_leaves_one_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = OrphanRegistry::new(tmp.path().join("orphans.txt"), LockPolicy::default());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| registry.record("same.xml").unwrap());
            }
        });
        assert_eq!(registry.entries().unwrap(), vec!["same.xml"]);
    }
}
