//! Child validation and best-effort repair.
//!
//! Which elements a child must carry depends on its platform family, looked
//! up in a prefix table. `related_dataset` (the back-reference to the
//! parent) is required of every child.
//!
//! Repair only inserts values it is given: product type and mode from the
//! identity generator's metadata, the parent identifier for
//! `related_dataset`. A repaired child must be validated again; repair can
//! leave conditions unmet.

use thiserror::Error;

use crate::config::ValidationConfig;
use crate::models::{ParentIdentity, RequiredField, ValidationReport};
use crate::record::{mmd, Record};

/// A child that cannot be linked because required elements are missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{child}: {report}")]
pub struct ValidationError {
    pub child: String,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyRule {
    pub prefix: String,
    pub required: Vec<RequiredField>,
}

impl FamilyRule {
    pub fn new(prefix: &str, required: &[RequiredField]) -> Self {
        Self {
            prefix: prefix.to_string(),
            required: required.to_vec(),
        }
    }
}

/// Platform family → required elements. First matching prefix wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRules {
    families: Vec<FamilyRule>,
}

impl Default for PlatformRules {
    fn default() -> Self {
        use RequiredField::*;
        Self {
            families: vec![
                FamilyRule::new("S1", &[ProductType, Mode]),
                FamilyRule::new("S3", &[Instrument]),
                FamilyRule::new("", &[ProductType]),
            ],
        }
    }
}

impl PlatformRules {
    pub fn new(families: Vec<FamilyRule>) -> Self {
        Self { families }
    }

    pub fn from_config(cfg: &ValidationConfig) -> Self {
        if cfg.families.is_empty() {
            return Self::default();
        }
        Self::new(
            cfg.families
                .iter()
                .map(|f| FamilyRule::new(&f.prefix, &f.required))
                .collect(),
        )
    }

    /// Required elements for a child, in report order.
    pub fn required_for(&self, child_filename: &str) -> Vec<RequiredField> {
        let mut required: Vec<RequiredField> = self
            .families
            .iter()
            .find(|f| child_filename.starts_with(&f.prefix))
            .map(|f| f.required.clone())
            .unwrap_or_default();
        required.push(RequiredField::RelatedDataset);
        required.sort();
        required.dedup();
        required
    }
}

pub fn validate(rules: &PlatformRules, child_filename: &str, child: &Record) -> ValidationReport {
    ValidationReport {
        missing: rules
            .required_for(child_filename)
            .into_iter()
            .filter(|field| !child.contains(field.key()))
            .collect(),
    }
}

/// Like [`validate`], but an unmet condition is an error.
pub fn ensure_valid(
    rules: &PlatformRules,
    child_filename: &str,
    child: &Record,
) -> Result<(), ValidationError> {
    let report = validate(rules, child_filename, child);
    if report.is_ok() {
        Ok(())
    } else {
        Err(ValidationError {
            child: child_filename.to_string(),
            report,
        })
    }
}

/// Insert whatever missing elements can be supplied. Returns the fields inserted.
pub fn repair(
    child: &mut Record,
    report: &ValidationReport,
    identity: Option<&ParentIdentity>,
) -> Vec<RequiredField> {
    let mut repaired = Vec::new();
    let metadata = identity.map(|id| &id.metadata);

    // Inserted at the front of the instrument, so mode goes in first and
    // product_type ends up ahead of it.
    let instrument_values = [
        (
            RequiredField::Mode,
            metadata.and_then(|m| m.mode.as_deref()),
        ),
        (
            RequiredField::ProductType,
            metadata.and_then(|m| m.product_type.as_deref()),
        ),
    ];
    for (field, value) in instrument_values {
        if !report.lacks(field) {
            continue;
        }
        let Some(value) = value else {
            tracing::debug!(%field, "no value available to repair");
            continue;
        };
        let container = if child.contains(mmd::PLATFORM_INSTRUMENT) {
            mmd::PLATFORM_INSTRUMENT
        } else {
            mmd::INSTRUMENT
        };
        if child.insert_first(container, field.key(), value).is_updated() {
            repaired.push(field);
        } else {
            tracing::debug!(%field, "no instrument element to repair into");
        }
    }

    if report.lacks(RequiredField::RelatedDataset) {
        match identity {
            Some(id) => {
                child.append_to_root(
                    mmd::RELATED_DATASET,
                    &[(mmd::RELATION_TYPE, "parent")],
                    &id.parent_id,
                );
                repaired.push(RequiredField::RelatedDataset);
            }
            None => tracing::debug!("no parent identity; related_dataset left missing"),
        }
    }

    repaired.sort();
    repaired
}
