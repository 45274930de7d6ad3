//! Core data types shared across the linking pipeline.
//!
//! These describe what is known about a child before it touches its parent:
//! which required elements it lacks and which parent it belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An element a child record may be required to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredField {
    ProductType,
    Mode,
    Instrument,
    RelatedDataset,
}

impl RequiredField {
    /// Record key of the element.
    pub fn key(self) -> &'static str {
        match self {
            RequiredField::ProductType => crate::record::mmd::PRODUCT_TYPE,
            RequiredField::Mode => crate::record::mmd::MODE,
            RequiredField::Instrument => crate::record::mmd::INSTRUMENT,
            RequiredField::RelatedDataset => crate::record::mmd::RELATED_DATASET,
        }
    }
}

impl fmt::Display for RequiredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Ordered list of required elements a child is missing.
///
/// Empty means the child can be linked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub missing: Vec<RequiredField>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn lacks(&self, field: RequiredField) -> bool {
        self.missing.contains(&field)
    }

    /// Human-readable conditions, one per missing element.
    pub fn conditions(&self) -> Vec<String> {
        self.missing
            .iter()
            .map(|f| format!("'{}' element not found", f))
            .collect()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("all required elements present");
        }
        f.write_str(&self.conditions().join(", "))
    }
}

/// Values a repair may insert. Supplied by the identity generator, never invented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupplementaryMetadata {
    pub platform: String,
    pub product_type: Option<String>,
    pub mode: Option<String>,
    pub relative_orbit: Option<u32>,
}

/// Where a child belongs: stable group key, parent identifier, and repair values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentIdentity {
    pub parent_key: String,
    pub parent_id: String,
    pub metadata: SupplementaryMetadata,
}

/// Value of `last_metadata_update/update/type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Created,
    Updated,
}

impl UpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::Created => "Created",
            UpdateType::Updated => "Updated",
        }
    }
}

/// `metadata_status` value that lets a child influence its parent's envelope.
pub const STATUS_ACTIVE: &str = "Active";

/// `dataset_production_status` of every parent.
pub const PRODUCTION_ONGOING: &str = "Ongoing";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_conditions_read_like_log_lines() {
        let report = ValidationReport {
            missing: vec![RequiredField::Mode, RequiredField::RelatedDataset],
        };
        assert!(!report.is_ok());
        assert!(report.lacks(RequiredField::Mode));
        assert_eq!(
            report.to_string(),
            "'mode' element not found, 'related_dataset' element not found"
        );
    }

    #[test]
    fn required_field_names_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            required: Vec<RequiredField>,
        }
        let w: Wrapper = toml::from_str(r#"required = ["product_type", "instrument"]"#).unwrap();
        assert_eq!(
            w.required,
            vec![RequiredField::ProductType, RequiredField::Instrument]
        );
    }
}
