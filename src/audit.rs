//! Read-only audit of the child records in a group.
//!
//! Lists every child that would not link cleanly as it stands on disk:
//! unreadable files, names without a parent identity, missing required
//! elements, titles that are not product names, and identifiers that are
//! not UUIDs. Nothing is repaired or registered as an orphan.

use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::link::Linker;
use crate::models::ValidationReport;
use crate::record::{mmd, Record};
use crate::validate::validate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum RecordProblem {
    Unreadable { error: String },
    NoParentIdentity { error: String },
    /// Product names start with the platform letter `S`.
    TitleNotProduct { title: String },
    IdentifierNotUuid { identifier: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub child: String,
    pub path: PathBuf,
    /// Absent when the record could not be read.
    pub report: Option<ValidationReport>,
    pub problems: Vec<RecordProblem>,
}

impl AuditEntry {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty() && self.report.as_ref().map_or(true, ValidationReport::is_ok)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub checked: usize,
    pub failing: Vec<AuditEntry>,
}

/// Audit one child record file.
pub fn audit_file(linker: &Linker, path: &Path) -> AuditEntry {
    let child = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut entry = AuditEntry {
        child: child.clone(),
        path: path.to_path_buf(),
        report: None,
        problems: Vec::new(),
    };

    if let Err(err) = linker.derive(&child) {
        entry.problems.push(RecordProblem::NoParentIdentity {
            error: err.to_string(),
        });
    }
    let record = match Record::read(path) {
        Ok(record) => record,
        Err(err) => {
            entry.problems.push(RecordProblem::Unreadable {
                error: err.to_string(),
            });
            return entry;
        }
    };
    entry.report = Some(validate(linker.rules(), &child, &record));
    entry.problems.extend(record_problems(&record));
    entry
}

/// Audit every file in `paths`, keeping only the failing ones.
pub fn audit_files(linker: &Linker, paths: &[PathBuf]) -> AuditSummary {
    let mut summary = AuditSummary {
        checked: paths.len(),
        ..Default::default()
    };
    for path in paths {
        let entry = audit_file(linker, path);
        if !entry.is_clean() {
            tracing::debug!(child = %entry.child, problems = entry.problems.len(), "audit failure");
            summary.failing.push(entry);
        }
    }
    tracing::info!(checked = summary.checked, failing = summary.failing.len(), "audit finished");
    summary
}

/// Title and identifier checks. Absent elements are left to validation.
fn record_problems(record: &Record) -> Vec<RecordProblem> {
    let mut problems = Vec::new();
    if let Some(title) = record.text(mmd::TITLE) {
        if !title.starts_with('S') {
            problems.push(RecordProblem::TitleNotProduct { title });
        }
    }
    if let Some(identifier) = record.text(mmd::METADATA_IDENTIFIER) {
        if !is_uuid_identifier(&identifier) {
            problems.push(RecordProblem::IdentifierNotUuid { identifier });
        }
    }
    problems
}

/// A bare UUID, or a UUID behind a `<namespace>:` prefix (`no.met:<uuid>`).
fn is_uuid_identifier(identifier: &str) -> bool {
    let id = identifier.rsplit(':').next().unwrap_or(identifier);
    Uuid::parse_str(id).is_ok()
}
