//! Parent identity and record locations.
//!
//! Children are grouped by a key derived purely from their filename
//! (platform, mode, product type, relative orbit). The same key always maps
//! to the same parent identifier and the same parent file, in every process.
//!
//! # Layout
//!
//! ```text
//! <root>/S1A/2023/10/16/EW/metadata/S1A_EW_GRDM_..._050787_....xml   (child)
//! <root>/S2A/2023/10/16/metadata/S2A_MSIL1C_..._R108_....xml         (child)
//! <root>/S1A/S1A_EW_GRD_R140.xml                                      (parent)
//! ```

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ParentIdentity, SupplementaryMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("unsupported platform '{platform}' in {name}")]
    UnsupportedPlatform { platform: String, name: String },
    #[error("no acquisition timestamp in {0}")]
    MissingAcquisitionTime(String),
    #[error("cannot read {field} from {name}")]
    MalformedName { field: &'static str, name: String },
}

/// Derives the parent a child belongs to from the child's filename.
pub trait ParentIdentityGenerator: Send + Sync {
    fn derive(&self, child_filename: &str) -> Result<ParentIdentity, IdentityError>;
}

/// Identity generator for Sentinel-1 and Sentinel-2 product names.
#[derive(Debug, Clone)]
pub struct SentinelIdentity {
    base_url: String,
    id_namespace: String,
}

impl SentinelIdentity {
    pub fn new(base_url: impl Into<String>, id_namespace: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            id_namespace: id_namespace.into(),
        }
    }

    fn parent_id(&self, parent_key: &str) -> String {
        let url = format!("{}/{}", self.base_url, parent_key);
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes());
        format!("{}:{}", self.id_namespace, uuid)
    }
}

impl ParentIdentityGenerator for SentinelIdentity {
    fn derive(&self, child_filename: &str) -> Result<ParentIdentity, IdentityError> {
        let name = ProductName::parse(child_filename)?;
        let metadata = match name.family() {
            "S1" => sentinel1_metadata(&name)?,
            "S2" => sentinel2_metadata(&name)?,
            _ => return Err(name.unsupported()),
        };
        let parent_key = parent_key(&metadata);
        Ok(ParentIdentity {
            parent_id: self.parent_id(&parent_key),
            parent_key,
            metadata,
        })
    }
}

fn parent_key(metadata: &SupplementaryMetadata) -> String {
    let mut parts = vec![metadata.platform.clone()];
    parts.extend(metadata.mode.clone());
    parts.extend(metadata.product_type.clone());
    if let Some(orbit) = metadata.relative_orbit {
        parts.push(format!("R{:03}", orbit));
    }
    parts.join("_")
}

fn sentinel1_metadata(name: &ProductName) -> Result<SupplementaryMetadata, IdentityError> {
    let beam = name.field(1, "beam mode")?;
    let product = name.field(2, "product type")?;
    let product_type: String = product.chars().take(3).collect();
    if product_type.len() < 3 {
        return Err(name.malformed("product type"));
    }
    let (_, stop_index) = name
        .timestamps
        .get(1)
        .copied()
        .ok_or_else(|| name.malformed("stop time"))?;
    let absolute: i64 = name
        .fields
        .get(stop_index + 1)
        .filter(|f| f.len() == 6)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| name.malformed("absolute orbit"))?;
    let offset = match name.platform() {
        "S1A" => 73,
        "S1B" => 27,
        _ => return Err(name.unsupported()),
    };
    let relative = (absolute - offset).rem_euclid(175) + 1;
    Ok(SupplementaryMetadata {
        platform: name.platform().to_string(),
        product_type: Some(product_type),
        mode: Some(beam.to_string()),
        relative_orbit: Some(relative as u32),
    })
}

fn sentinel2_metadata(name: &ProductName) -> Result<SupplementaryMetadata, IdentityError> {
    let product_type = name.field(1, "product type")?;
    let relative = name
        .fields
        .iter()
        .find(|f| f.len() == 4 && f.starts_with('R') && f[1..].chars().all(|c| c.is_ascii_digit()))
        .and_then(|f| f[1..].parse::<u32>().ok())
        .ok_or_else(|| name.malformed("relative orbit"))?;
    Ok(SupplementaryMetadata {
        platform: name.platform().to_string(),
        product_type: Some(product_type.to_string()),
        mode: None,
        relative_orbit: Some(relative),
    })
}

/// A product filename split into its `_`-separated fields.
struct ProductName<'a> {
    name: &'a str,
    fields: Vec<&'a str>,
    /// Acquisition timestamps (`YYYYMMDDTHHMMSS`) with their field index.
    timestamps: Vec<(NaiveDate, usize)>,
}

impl<'a> ProductName<'a> {
    fn parse(filename: &'a str) -> Result<Self, IdentityError> {
        let stem = filename.split('.').next().unwrap_or(filename);
        let fields: Vec<&str> = stem.split('_').collect();
        let timestamps = fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| acquisition_date(f).map(|d| (d, i)))
            .collect();
        let name = ProductName {
            name: filename,
            fields,
            timestamps,
        };
        if name.platform().len() < 2 || !name.platform().starts_with('S') {
            return Err(name.malformed("platform"));
        }
        Ok(name)
    }

    fn platform(&self) -> &'a str {
        self.fields[0]
    }

    fn family(&self) -> &'a str {
        self.fields[0].get(..2).unwrap_or("")
    }

    fn field(&self, index: usize, what: &'static str) -> Result<&'a str, IdentityError> {
        self.fields
            .get(index)
            .copied()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| self.malformed(what))
    }

    fn acquired(&self) -> Result<NaiveDate, IdentityError> {
        self.timestamps
            .first()
            .map(|(d, _)| *d)
            .ok_or_else(|| IdentityError::MissingAcquisitionTime(self.name.to_string()))
    }

    fn malformed(&self, field: &'static str) -> IdentityError {
        IdentityError::MalformedName {
            field,
            name: self.name.to_string(),
        }
    }

    fn unsupported(&self) -> IdentityError {
        IdentityError::UnsupportedPlatform {
            platform: self.platform().to_string(),
            name: self.name.to_string(),
        }
    }
}

fn acquisition_date(field: &str) -> Option<NaiveDate> {
    let bytes = field.as_bytes();
    if bytes.len() != 15 || bytes[8] != b'T' {
        return None;
    }
    if !field[..8].chars().chain(field[9..].chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(&field[..8], "%Y%m%d").ok()
}

/// Canonical child record name: everything before the first `.`, plus `.xml`.
pub fn normalize_child_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let stem = base.split('.').next().unwrap_or(&base);
    format!("{}.xml", stem)
}

/// Where a child's record lives under the records root.
///
/// The path is computed, not checked; the file may not exist.
pub fn resolve_child_path(child_filename: &str, records_root: &Path) -> Result<PathBuf, IdentityError> {
    let name = ProductName::parse(child_filename)?;
    let date = name.acquired()?;
    let mut path = records_root.join(name.platform());
    path.push(date.format("%Y").to_string());
    path.push(date.format("%m").to_string());
    path.push(date.format("%d").to_string());
    match name.family() {
        "S1" => path.push(name.field(1, "beam mode")?),
        "S2" => {}
        _ => return Err(name.unsupported()),
    }
    path.push("metadata");
    path.push(normalize_child_name(child_filename));
    Ok(path)
}

/// Group directory of a parent key: the platform, i.e. the first `_` field.
pub fn parent_group(parent_key: &str) -> &str {
    parent_key.split('_').next().unwrap_or(parent_key)
}

pub fn parent_path(records_root: &Path, parent_key: &str) -> PathBuf {
    records_root
        .join(parent_group(parent_key))
        .join(format!("{}.xml", parent_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1: &str = "S1A_EW_GRDM_1SDH_20231016T071258_20231016T071502_050787_061EE6_78D6.xml";
    const S1_SLC: &str = "S1A_IW_SLC__1SDV_20231016T071258_20231016T071502_050787_061EE6_78D6.SAFE.zip";
    const S2: &str = "S2A_MSIL1C_20231016T103051_N0509_R108_T32VNM_20231016T123456.xml";

    fn generator() -> SentinelIdentity {
        SentinelIdentity::new("https://data.met.no/dataset", "no.met")
    }

    #[test]
    fn sentinel1_key_uses_relative_orbit() {
        let id = generator().derive(S1).unwrap();
        // (50787 - 73) mod 175 + 1
        assert_eq!(id.parent_key, "S1A_EW_GRD_R140");
        assert_eq!(id.metadata.mode.as_deref(), Some("EW"));
        assert_eq!(id.metadata.product_type.as_deref(), Some("GRD"));
        assert!(id.parent_id.starts_with("no.met:"));
    }

    #[test]
    fn same_relative_orbit_same_parent() {
        let other = S1.replace("050787", "050962");
        let a = generator().derive(S1).unwrap();
        let b = generator().derive(&other).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn slc_names_keep_field_positions() {
        let id = generator().derive(S1_SLC).unwrap();
        assert_eq!(id.parent_key, "S1A_IW_SLC_R140");
    }

    #[test]
    fn sentinel2_key() {
        let id = generator().derive(S2).unwrap();
        assert_eq!(id.parent_key, "S2A_MSIL1C_R108");
        assert_eq!(id.metadata.mode, None);
    }

    #[test]
    fn unsupported_and_garbage_names_fail() {
        let s3 = "S3A_OL_1_EFR____20231016T103051_20231016T103351_20231017T123456_0179_104_165_1800_MAR_O_NT_003.xml";
        assert!(matches!(
            generator().derive(s3),
            Err(IdentityError::UnsupportedPlatform { .. })
        ));
        assert!(generator().derive("readme.xml").is_err());
        assert!(generator().derive("S1A_EW.xml").is_err());
    }

    #[test]
    fn ids_are_deterministic_per_key() {
        let a = generator().derive(S2).unwrap();
        let b = SentinelIdentity::new("https://data.met.no/dataset", "no.met")
            .derive(S2)
            .unwrap();
        assert_eq!(a.parent_id, b.parent_id);
        let c = SentinelIdentity::new("https://example.org", "no.met")
            .derive(S2)
            .unwrap();
        assert_ne!(a.parent_id, c.parent_id);
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_child_name("X_1.SAFE.zip"), "X_1.xml");
        assert_eq!(normalize_child_name("/a/b/X_1.xml"), "X_1.xml");
        assert_eq!(normalize_child_name("X_1"), "X_1.xml");
    }

    #[test]
    fn child_paths() {
        let root = Path::new("/records");
        assert_eq!(
            resolve_child_path(S1_SLC, root).unwrap(),
            root.join("S1A/2023/10/16/IW/metadata")
                .join("S1A_IW_SLC__1SDV_20231016T071258_20231016T071502_050787_061EE6_78D6.xml")
        );
        assert_eq!(
            resolve_child_path(S2, root).unwrap(),
            root.join("S2A/2023/10/16/metadata").join(S2)
        );
        assert!(resolve_child_path("S1A_EW_GRDM.xml", root).is_err());
    }

    #[test]
    fn parent_paths() {
        assert_eq!(
            parent_path(Path::new("/r"), "S1A_EW_GRD_R140"),
            PathBuf::from("/r/S1A/S1A_EW_GRD_R140.xml")
        );
    }
}
