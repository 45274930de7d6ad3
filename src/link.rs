//! Linking pipeline: one child in, parent created or widened, or child orphaned.
//!
//! # Steps
//!
//! 1. Normalize the child name and derive its parent identity. Failure
//!    orphans the child.
//! 2. Take the parent-key lock. Everything below runs under it, so two
//!    children of the same group never interleave their read-modify-write.
//! 3. Read the child, validate it, repair what can be repaired (persisting
//!    the repaired child), and validate again. Unmet conditions orphan it.
//! 4. If the parent file does not exist, materialize it from the child.
//!    Otherwise fold the child into the parent's envelope and persist only
//!    if something changed.
//!
//! Orphaning is an outcome, not an error. [`LinkError`] is reserved for
//! storage failures and lock contention on a parent.
//!
//! [`link_all`] fans a batch out over parent keys: children of one key are
//! linked in sequence on one blocking task, different keys in parallel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, TitleStyle};
use crate::extent::AreaOfInterest;
use crate::identity::{
    normalize_child_name, parent_path, resolve_child_path, IdentityError,
    ParentIdentityGenerator, SentinelIdentity,
};
use crate::lock::{KeyLock, LockError, LockPolicy};
use crate::materialize::Materializer;
use crate::models::{ParentIdentity, RequiredField, ValidationReport};
use crate::orphans::{OrphanError, OrphanRegistry};
use crate::reconcile::{EnvelopeChange, Reconciler, SkipReason};
use crate::record::{Record, RecordError};
use crate::validate::{repair, validate, PlatformRules, ValidationError};

/// Directory under the records root holding parent lock files.
pub const LOCK_DIR: &str = ".locks";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("storage failure: {0}")]
    Storage(#[from] RecordError),
    #[error("parent is busy: {0}")]
    Contended(LockError),
    #[error(transparent)]
    Orphans(#[from] OrphanError),
    #[error("child rejected after validation: {0}")]
    Invalid(#[from] ValidationError),
    #[error("link task failed: {0}")]
    Task(String),
}

impl From<LockError> for LinkError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Io { path, source } => LinkError::Storage(RecordError::Io { path, source }),
            contended => LinkError::Contended(contended),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrphanReason {
    #[error("no parent identity: {0}")]
    Identity(IdentityError),
    #[error("child record unreadable: {0}")]
    ChildUnreadable(String),
    #[error("missing required elements: {0}")]
    Validation(ValidationReport),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    Created {
        parent_key: String,
        repaired: Vec<RequiredField>,
    },
    Linked {
        parent_key: String,
        repaired: Vec<RequiredField>,
        envelope: EnvelopeChange,
    },
    Orphaned {
        reason: OrphanReason,
    },
}

impl LinkOutcome {
    pub fn parent_key(&self) -> Option<&str> {
        match self {
            LinkOutcome::Created { parent_key, .. } | LinkOutcome::Linked { parent_key, .. } => {
                Some(parent_key)
            }
            LinkOutcome::Orphaned { .. } => None,
        }
    }

    /// Short label for summaries: created, widened, unchanged, skipped or orphaned.
    pub fn label(&self) -> &'static str {
        match self {
            LinkOutcome::Created { .. } => "created",
            LinkOutcome::Linked { envelope, .. } => match envelope {
                EnvelopeChange::Widened(_) => "widened",
                EnvelopeChange::Unchanged => "unchanged",
                EnvelopeChange::Skipped(_) => "skipped",
            },
            LinkOutcome::Orphaned { .. } => "orphaned",
        }
    }
}

/// Everything known about a child without touching any record.
#[derive(Debug, Clone, Serialize)]
pub struct ChildCheck {
    pub child: String,
    pub path: Option<PathBuf>,
    pub exists: bool,
    pub identity: Option<ParentIdentity>,
    pub identity_error: Option<String>,
    pub report: Option<ValidationReport>,
    pub read_error: Option<String>,
}

pub struct Linker {
    pub(crate) records_root: PathBuf,
    pub(crate) lock_dir: PathBuf,
    registry: OrphanRegistry,
    identity: Box<dyn ParentIdentityGenerator>,
    rules: PlatformRules,
    pub(crate) area: AreaOfInterest,
    pub(crate) clock: Arc<dyn Clock>,
    base_url: String,
    title: TitleStyle,
    pub(crate) mark_updates: bool,
    pub(crate) lock_policy: LockPolicy,
}

impl Linker {
    pub fn from_config(config: &Config) -> Self {
        let lock_policy = LockPolicy::from(&config.locking);
        let records_root = config.records.root_path.clone();
        Self {
            lock_dir: records_root.join(LOCK_DIR),
            registry: OrphanRegistry::new(&config.orphans.registry_path, lock_policy.clone()),
            identity: Box::new(SentinelIdentity::new(
                config.parent.base_url.clone(),
                config.parent.id_namespace.clone(),
            )),
            rules: PlatformRules::from_config(&config.validation),
            area: config.area_of_interest.polygon(),
            clock: Arc::new(SystemClock),
            base_url: config.parent.base_url.clone(),
            title: config.parent.title,
            mark_updates: config.parent.mark_updates,
            lock_policy,
            records_root,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_identity(mut self, identity: Box<dyn ParentIdentityGenerator>) -> Self {
        self.identity = identity;
        self
    }

    pub fn registry(&self) -> &OrphanRegistry {
        &self.registry
    }

    pub fn rules(&self) -> &PlatformRules {
        &self.rules
    }

    pub fn records_root(&self) -> &Path {
        &self.records_root
    }

    pub fn derive(&self, child_name: &str) -> Result<ParentIdentity, IdentityError> {
        self.identity.derive(&normalize_child_name(child_name))
    }

    /// Link one child. See the module docs for the steps.
    pub fn link(&self, child_name: &str) -> Result<LinkOutcome, LinkError> {
        let filename = normalize_child_name(child_name);

        let located = self
            .identity
            .derive(&filename)
            .and_then(|id| Ok((resolve_child_path(&filename, &self.records_root)?, id)));
        let (child_path, identity) = match located {
            Ok(pair) => pair,
            Err(err) => return self.orphan(&filename, OrphanReason::Identity(err)),
        };
        if !child_path.exists() {
            tracing::warn!(child = %filename, path = %child_path.display(), "child record not found");
        }

        let guard = KeyLock::for_key(&self.lock_dir, &identity.parent_key, &self.lock_policy)?;

        let mut child = match Record::read(&child_path) {
            Ok(record) => record,
            Err(err) => {
                return self.orphan(&filename, OrphanReason::ChildUnreadable(err.to_string()))
            }
        };

        let report = validate(&self.rules, &filename, &child);
        let mut repaired = Vec::new();
        if !report.is_ok() {
            repaired = repair(&mut child, &report, Some(&identity));
            if !repaired.is_empty() {
                guard.ensure_held()?;
                child.write(&child_path)?;
                tracing::info!(child = %filename, fields = ?repaired, "child repaired");
            }
            let report = validate(&self.rules, &filename, &child);
            if !report.is_ok() {
                return self.orphan(&filename, OrphanReason::Validation(report));
            }
        }

        let parent_file = parent_path(&self.records_root, &identity.parent_key);
        match Record::read(&parent_file) {
            Ok(mut parent) => {
                let envelope = Reconciler::new(&self.area, self.clock.as_ref())
                    .mark_updates(self.mark_updates)
                    .reconcile(&mut parent, &child);
                if envelope.is_widened() {
                    guard.ensure_held()?;
                    parent.write(&parent_file)?;
                    tracing::info!(parent = %identity.parent_key, child = %filename, "parent updated");
                } else if let EnvelopeChange::Skipped(reason) = &envelope {
                    log_skip(&filename, reason);
                }
                Ok(LinkOutcome::Linked {
                    parent_key: identity.parent_key,
                    repaired,
                    envelope,
                })
            }
            Err(err) if err.is_not_found() => {
                let parent = Materializer {
                    rules: &self.rules,
                    area: &self.area,
                    clock: self.clock.as_ref(),
                    base_url: &self.base_url,
                    title: self.title,
                }
                .materialize(&filename, &child, &identity.parent_key)?;
                guard.ensure_held()?;
                parent.write(&parent_file)?;
                tracing::info!(parent = %identity.parent_key, child = %filename, "parent created");
                Ok(LinkOutcome::Created {
                    parent_key: identity.parent_key,
                    repaired,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Inspect a child without modifying anything.
    pub fn check(&self, child_name: &str) -> ChildCheck {
        let filename = normalize_child_name(child_name);
        let mut check = ChildCheck {
            child: filename.clone(),
            path: None,
            exists: false,
            identity: None,
            identity_error: None,
            report: None,
            read_error: None,
        };
        match self.identity.derive(&filename) {
            Ok(id) => check.identity = Some(id),
            Err(err) => check.identity_error = Some(err.to_string()),
        }
        match resolve_child_path(&filename, &self.records_root) {
            Ok(path) => {
                check.exists = path.exists();
                match Record::read(&path) {
                    Ok(record) => check.report = Some(validate(&self.rules, &filename, &record)),
                    Err(err) => check.read_error = Some(err.to_string()),
                }
                check.path = Some(path);
            }
            Err(err) => {
                check.identity_error.get_or_insert_with(|| err.to_string());
            }
        }
        check
    }

    fn orphan(&self, filename: &str, reason: OrphanReason) -> Result<LinkOutcome, LinkError> {
        let added = self.registry.record(filename)?;
        tracing::info!(child = %filename, %reason, new_entry = added, "child orphaned");
        Ok(LinkOutcome::Orphaned { reason })
    }
}

fn log_skip(child: &str, reason: &SkipReason) {
    match reason {
        SkipReason::MalformedExtent(_) => {
            tracing::warn!(child, %reason, "child linked without envelope contribution")
        }
        _ => tracing::debug!(child, %reason, "child linked without envelope contribution"),
    }
}

/// Counts over a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkSummary {
    pub created: usize,
    pub widened: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub orphaned: usize,
    pub failed: usize,
}

impl LinkSummary {
    pub fn tally<'a>(results: impl IntoIterator<Item = &'a Result<LinkOutcome, LinkError>>) -> Self {
        let mut summary = LinkSummary::default();
        for result in results {
            match result.as_ref().map(LinkOutcome::label) {
                Ok("created") => summary.created += 1,
                Ok("widened") => summary.widened += 1,
                Ok("unchanged") => summary.unchanged += 1,
                Ok("skipped") => summary.skipped += 1,
                Ok(_) => summary.orphaned += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

/// Link a batch of children, at most `jobs` parent keys at a time.
///
/// Results come back in input order. A failure on one child never stops
/// its siblings.
pub async fn link_all(
    linker: Arc<Linker>,
    children: Vec<String>,
    jobs: usize,
) -> Vec<(String, Result<LinkOutcome, LinkError>)> {
    // Children without an identity get their own group; they are orphaned
    // without taking any parent lock.
    let mut groups: BTreeMap<String, Vec<(usize, String)>> = BTreeMap::new();
    for (index, child) in children.iter().enumerate() {
        let key = match linker.derive(child) {
            Ok(id) => id.parent_key,
            Err(_) => format!("\0{}", index),
        };
        groups.entry(key).or_default().push((index, child.clone()));
    }

    let permits = Arc::new(Semaphore::new(jobs.max(1)));
    let mut handles = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let linker = Arc::clone(&linker);
        let permits = Arc::clone(&permits);
        let fallback: Vec<(usize, String)> = members.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            tokio::task::spawn_blocking(move || {
                members
                    .into_iter()
                    .map(|(index, child)| {
                        let result = linker.link(&child);
                        (index, child, result)
                    })
                    .collect::<Vec<_>>()
            })
            .await
        });
        handles.push((key, fallback, handle));
    }

    let mut results: Vec<Option<(String, Result<LinkOutcome, LinkError>)>> =
        (0..children.len()).map(|_| None).collect();
    for (key, fallback, handle) in handles {
        match handle.await {
            Ok(Ok(linked)) => {
                for (index, child, result) in linked {
                    results[index] = Some((child, result));
                }
            }
            Ok(Err(err)) => fail_group(&mut results, &key, fallback, err.to_string()),
            Err(err) => fail_group(&mut results, &key, fallback, err.to_string()),
        }
    }
    results.into_iter().flatten().collect()
}

fn fail_group(
    results: &mut [Option<(String, Result<LinkOutcome, LinkError>)>],
    key: &str,
    members: Vec<(usize, String)>,
    reason: String,
) {
    tracing::error!(parent = key, %reason, "link task failed");
    for (index, child) in members {
        results[index] = Some((child, Err(LinkError::Task(reason.clone()))));
    }
}
