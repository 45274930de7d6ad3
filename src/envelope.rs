//! Bulk envelope maintenance over a whole parent group.
//!
//! A group is a platform directory under the records root
//! (`<root>/S1A/`). Its parents are the `*.xml` files directly inside it;
//! its children are the files below it matching `records.child_globs`.
//!
//! [`Envelopes::rebuild`] recomputes every rectangle in the group from
//! scratch. All parent locks of the group are held for the whole pass and
//! every parent is written exactly once at the end, so the sentinel state
//! in between is never persisted.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::extent::GeoExtent;
use crate::link::Linker;
use crate::lock::{KeyLock, LockError, LockSet};
use crate::progress::{RebuildEvent, RebuildReporter};
use crate::reconcile::{write_geo, EnvelopeChange, Reconciler};
use crate::record::{Record, RecordError};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("group directory not found: {}", .0.display())]
    GroupNotFound(PathBuf),
    #[error("invalid child glob: {0}")]
    Glob(#[from] globset::Error),
    #[error("walking group: {0}")]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Storage(#[from] RecordError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub parents: usize,
    pub children: usize,
    pub widened: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Children whose parent key has no parent file in the group, or no key at all.
    pub unmatched: usize,
    pub unreadable: usize,
}

pub struct Envelopes<'a> {
    linker: &'a Linker,
    children: GlobSet,
}

impl<'a> Envelopes<'a> {
    pub fn new(linker: &'a Linker, child_globs: &[String]) -> Result<Self, EnvelopeError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in child_globs {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            linker,
            children: builder.build()?,
        })
    }

    /// Write the sentinel into every parent rectangle of `group`, one parent at a time.
    pub fn reset(&self, group: &str) -> Result<usize, EnvelopeError> {
        let parents = self.parents(group)?;
        for (key, path) in &parents {
            let guard = self.lock(key)?;
            let mut parent = Record::read(path)?;
            write_geo(&mut parent, &GeoExtent::Unset);
            guard.ensure_held()?;
            parent.write(path)?;
            tracing::debug!(parent = %key, "envelope reset");
        }
        tracing::info!(group, parents = parents.len(), "envelopes reset");
        Ok(parents.len())
    }

    /// Reset and recompute every rectangle of `group` in one locked pass.
    pub fn rebuild(
        &self,
        group: &str,
        progress: &dyn RebuildReporter,
    ) -> Result<RebuildStats, EnvelopeError> {
        let parent_files = self.parents(group)?;

        // Sorted acquisition order, so concurrent rebuilds cannot deadlock.
        let guards = LockSet::for_keys(
            &self.linker.lock_dir,
            parent_files.keys().map(String::as_str),
            &self.linker.lock_policy,
        )?;

        let mut parents: BTreeMap<String, (PathBuf, Record)> = BTreeMap::new();
        for (key, path) in parent_files {
            let mut record = Record::read(&path)?;
            write_geo(&mut record, &GeoExtent::Unset);
            parents.insert(key, (path, record));
        }
        let mut stats = RebuildStats {
            parents: parents.len(),
            ..Default::default()
        };
        progress.report(RebuildEvent::Discovering {
            group: group.to_string(),
            parents: parents.len() as u64,
        });

        let children = self.children(&self.group_dir(group))?;
        let total = children.len() as u64;
        let reconciler = Reconciler::new(&self.linker.area, self.linker.clock.as_ref())
            .mark_updates(self.linker.mark_updates);

        for (n, child_path) in children.iter().enumerate() {
            stats.children += 1;
            if n % 100 == 0 {
                progress.report(RebuildEvent::Applying {
                    group: group.to_string(),
                    n: n as u64,
                    total,
                });
            }
            let name = child_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = match self.linker.derive(&name) {
                Ok(id) => parents.get_mut(&id.parent_key),
                Err(err) => {
                    tracing::debug!(child = %name, error = %err, "no parent key");
                    None
                }
            };
            let Some((_, parent)) = parent else {
                stats.unmatched += 1;
                continue;
            };
            let child = match Record::read(child_path) {
                Ok(child) => child,
                Err(err) => {
                    tracing::warn!(child = %child_path.display(), error = %err, "skipping unreadable child");
                    stats.unreadable += 1;
                    continue;
                }
            };
            match reconciler.reconcile(parent, &child) {
                EnvelopeChange::Widened(_) => stats.widened += 1,
                EnvelopeChange::Unchanged => stats.unchanged += 1,
                EnvelopeChange::Skipped(reason) => {
                    tracing::debug!(child = %name, %reason, "child skipped");
                    stats.skipped += 1;
                }
            }
        }
        progress.report(RebuildEvent::Applying {
            group: group.to_string(),
            n: total,
            total,
        });

        progress.report(RebuildEvent::Persisting {
            group: group.to_string(),
            parents: parents.len() as u64,
        });
        guards.ensure_held()?;
        for (key, (path, record)) in &parents {
            record.write(path)?;
            tracing::debug!(parent = %key, "envelope rebuilt");
        }
        drop(guards);

        tracing::info!(group, ?stats, "envelopes rebuilt");
        Ok(stats)
    }

    /// Child record files of `group`, sorted by path.
    pub fn child_files(&self, group: &str) -> Result<Vec<PathBuf>, EnvelopeError> {
        let dir = self.group_dir(group);
        if !dir.is_dir() {
            return Err(EnvelopeError::GroupNotFound(dir));
        }
        self.children(&dir)
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.linker.records_root.join(group)
    }

    fn lock(&self, key: &str) -> Result<KeyLock, LockError> {
        KeyLock::for_key(&self.linker.lock_dir, key, &self.linker.lock_policy)
    }

    /// Parent files of a group, keyed by parent key.
    fn parents(&self, group: &str) -> Result<BTreeMap<String, PathBuf>, EnvelopeError> {
        let dir = self.group_dir(group);
        if !dir.is_dir() {
            return Err(EnvelopeError::GroupNotFound(dir));
        }
        let mut parents = BTreeMap::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension() != Some(OsStr::new("xml")) {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                parents.insert(stem.to_string_lossy().into_owned(), path.to_path_buf());
            }
        }
        Ok(parents)
    }

    /// Child files below `dir`, sorted by path.
    fn children(&self, dir: &Path) -> Result<Vec<PathBuf>, EnvelopeError> {
        let mut children = Vec::new();
        for entry in WalkDir::new(dir).min_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(dir).unwrap_or(path);
            if self.children.is_match(relative) {
                children.push(path.to_path_buf());
            }
        }
        children.sort();
        Ok(children)
    }
}
