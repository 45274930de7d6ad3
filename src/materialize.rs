//! Parent materializer: turns the first linkable child of a group into its parent.
//!
//! The parent starts as a verbatim clone of the child. Parent-specific
//! fields are then overwritten, child-only fields are stripped, and the
//! rectangle is kept only if the child would have passed the reconciler's
//! gates; otherwise it starts unset. Temporal bounds the reconciler would
//! reject are blanked, so the next valid child seeds them. The caller
//! persists the result.

use crate::clock::Clock;
use crate::config::TitleStyle;
use crate::extent::{format_timestamp, AreaOfInterest, GeoExtent};
use crate::models::{UpdateType, PRODUCTION_ONGOING, STATUS_ACTIVE};
use crate::reconcile::{child_rectangle, temporal_extent, write_geo};
use crate::record::{mmd, Record};
use crate::validate::{ensure_valid, PlatformRules, ValidationError};

/// Title written into a new parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentTitle {
    /// `<platform>_<mode>_<product_type>_orbit_<orbit_absolute>`.
    Full(String),
    /// The parent's storage name.
    Fallback(String),
}

impl ParentTitle {
    /// Build a descriptive title if the child carries orbit, product type and mode.
    pub fn describe(child_filename: &str, child: &Record, storage_name: &str) -> Self {
        let platform = child_filename.split('_').next().filter(|p| !p.is_empty());
        let parts = (
            platform,
            child.text(mmd::MODE).filter(|s| !s.is_empty()),
            child.text(mmd::PRODUCT_TYPE).filter(|s| !s.is_empty()),
            child.text(mmd::ORBIT_ABSOLUTE).filter(|s| !s.is_empty()),
        );
        match parts {
            (Some(platform), Some(mode), Some(product_type), Some(orbit)) => ParentTitle::Full(
                format!("{}_{}_{}_orbit_{}", platform, mode, product_type, orbit),
            ),
            _ => ParentTitle::Fallback(storage_name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ParentTitle::Full(t) | ParentTitle::Fallback(t) => t,
        }
    }
}

pub struct Materializer<'a> {
    pub rules: &'a PlatformRules,
    pub area: &'a AreaOfInterest,
    pub clock: &'a dyn Clock,
    pub base_url: &'a str,
    pub title: TitleStyle,
}

impl Materializer<'_> {
    /// Build the parent record named `parent_key` from its first child.
    ///
    /// Fails if the child does not validate; callers are expected to have
    /// validated and repaired it already.
    pub fn materialize(
        &self,
        child_filename: &str,
        child: &Record,
        parent_key: &str,
    ) -> Result<Record, ValidationError> {
        ensure_valid(self.rules, child_filename, child)?;

        let identifier = child.text(mmd::RELATED_DATASET).unwrap_or_default();
        let url = format!("{}/{}", self.base_url, identifier);
        let now = format_timestamp(&self.clock.now());
        let title = match self.title {
            TitleStyle::StorageName => ParentTitle::Fallback(parent_key.to_string()),
            TitleStyle::Descriptive => ParentTitle::describe(child_filename, child, parent_key),
        };

        let mut parent = child.clone();
        let fields = [
            (mmd::UPDATE_DATETIME, now.as_str()),
            (mmd::UPDATE_TYPE, UpdateType::Created.as_str()),
            (mmd::TITLE, title.as_str()),
            (mmd::METADATA_IDENTIFIER, identifier.as_str()),
            (mmd::PRODUCTION_STATUS, PRODUCTION_ONGOING),
            (mmd::CITATION_PUBLICATION_DATE, now.as_str()),
            (mmd::CITATION_TITLE, title.as_str()),
            (mmd::CITATION_URL, url.as_str()),
            (mmd::RELATED_RESOURCE, url.as_str()),
        ];
        for (key, value) in fields {
            parent.ensure_text(key, value);
        }

        for local in [mmd::STORAGE_INFORMATION, mmd::DATA_ACCESS, mmd::RELATED_DATASET] {
            parent.remove_all(local);
        }

        if !self.seeds_envelope(child) {
            write_geo(&mut parent, &GeoExtent::Unset);
        }
        if let Err(err) = temporal_extent(child) {
            tracing::warn!(error = %err, "first child has no usable time range");
            for key in [mmd::START_DATE, mmd::END_DATE] {
                parent.set_text(key, "");
            }
        }

        tracing::debug!(parent = parent_key, %identifier, title = title.as_str(), "parent materialized");
        Ok(parent)
    }

    /// Whether the child's rectangle may stand as the parent's initial envelope.
    fn seeds_envelope(&self, child: &Record) -> bool {
        if child.text(mmd::METADATA_STATUS).as_deref() != Some(STATUS_ACTIVE) {
            return false;
        }
        match child_rectangle(child) {
            Ok(rect) => self.area.intersects(&rect),
            Err(err) => {
                tracing::warn!(error = %err, "first child has no usable rectangle");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::reconcile::parent_geo;
    use chrono::{TimeZone, Utc};

    const CHILD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<mmd:mmd xmlns:mmd="http://www.met.no/schema/mmd">
  <mmd:metadata_identifier>no.met:child-1</mmd:metadata_identifier>
  <mmd:title xml:lang="en">S1A_EW_GRDM_1SDH_20231016T071258</mmd:title>
  <mmd:metadata_status>STATUS</mmd:metadata_status>
  <mmd:dataset_production_status>Complete</mmd:dataset_production_status>
  <mmd:last_metadata_update>
    <mmd:update>
      <mmd:datetime>2023-10-16T09:00:00.000Z</mmd:datetime>
      <mmd:type>Created</mmd:type>
    </mmd:update>
  </mmd:last_metadata_update>
  <mmd:temporal_extent>
    <mmd:start_date>2023-10-16T07:12:58.000Z</mmd:start_date>
    <mmd:end_date>2023-10-16T07:15:02.000Z</mmd:end_date>
  </mmd:temporal_extent>
  <mmd:geographic_extent>
    <mmd:rectangle>
      <mmd:north>80.0</mmd:north>
      <mmd:south>70.0</mmd:south>
      <mmd:east>10.0</mmd:east>
      <mmd:west>-10.0</mmd:west>
    </mmd:rectangle>
  </mmd:geographic_extent>
  <mmd:platform>
    <mmd:short_name>Sentinel-1A</mmd:short_name>
    <mmd:orbit_absolute>50787</mmd:orbit_absolute>
    <mmd:instrument>
      <mmd:product_type>GRD</mmd:product_type>
      <mmd:mode>EW</mmd:mode>
    </mmd:instrument>
  </mmd:platform>
  <mmd:dataset_citation>
    <mmd:publication_date>2023-10-16</mmd:publication_date>
    <mmd:title>child</mmd:title>
    <mmd:url>https://example.org/child</mmd:url>
  </mmd:dataset_citation>
  <mmd:related_information>
    <mmd:resource>https://example.org/child</mmd:resource>
  </mmd:related_information>
  <mmd:storage_information>
    <mmd:file_name>child.zip</mmd:file_name>
  </mmd:storage_information>
  <mmd:data_access><mmd:type>HTTP</mmd:type></mmd:data_access>
  <mmd:related_dataset relation_type="parent">no.met:parent-1</mmd:related_dataset>
</mmd:mmd>
"#;

    const NAME: &str = "S1A_EW_GRDM_1SDH_20231016T071258_20231016T071502_050787_061EE6_78D6.xml";

    fn child(status: &str) -> Record {
        Record::parse(CHILD.replace("STATUS", status).as_bytes()).unwrap()
    }

    fn run(child: &Record, title: TitleStyle) -> Result<Record, ValidationError> {
        let rules = PlatformRules::default();
        let area = AreaOfInterest::default();
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        Materializer {
            rules: &rules,
            area: &area,
            clock: &clock,
            base_url: "https://data.met.no/dataset",
            title,
        }
        .materialize(NAME, child, "S1A_EW_GRD_R140")
    }

    #[test]
    fn overwrites_parent_fields_and_strips_child_fields() {
        let parent = run(&child("Active"), TitleStyle::StorageName).unwrap();
        let now = "2024-05-01T12:00:00.000Z";
        let url = "https://data.met.no/dataset/no.met:parent-1";

        assert_eq!(parent.text(mmd::UPDATE_DATETIME).as_deref(), Some(now));
        assert_eq!(parent.text(mmd::UPDATE_TYPE).as_deref(), Some("Created"));
        assert_eq!(parent.text(mmd::TITLE).as_deref(), Some("S1A_EW_GRD_R140"));
        assert_eq!(
            parent.text(mmd::METADATA_IDENTIFIER).as_deref(),
            Some("no.met:parent-1")
        );
        assert_eq!(parent.text(mmd::PRODUCTION_STATUS).as_deref(), Some("Ongoing"));
        assert_eq!(parent.text(mmd::CITATION_PUBLICATION_DATE).as_deref(), Some(now));
        assert_eq!(
            parent.text(mmd::CITATION_TITLE).as_deref(),
            Some("S1A_EW_GRD_R140")
        );
        assert_eq!(parent.text(mmd::CITATION_URL).as_deref(), Some(url));
        assert_eq!(parent.text(mmd::RELATED_RESOURCE).as_deref(), Some(url));

        assert!(!parent.contains(mmd::STORAGE_INFORMATION));
        assert!(!parent.contains(mmd::DATA_ACCESS));
        assert!(!parent.contains(mmd::RELATED_DATASET));

        assert_eq!(parent_geo(&parent).bounds(), [80.0, 70.0, 10.0, -10.0]);
        assert_eq!(
            parent.text(mmd::START_DATE).as_deref(),
            Some("2023-10-16T07:12:58.000Z")
        );
    }

    #[test]
    fn descriptive_title_when_child_has_orbit_info() {
        let parent = run(&child("Active"), TitleStyle::Descriptive).unwrap();
        assert_eq!(
            parent.text(mmd::TITLE).as_deref(),
            Some("S1A_EW_GRD_orbit_50787")
        );
    }

    #[test]
    fn descriptive_title_falls_back_without_orbit() {
        let mut c = child("Active");
        c.remove_all(mmd::ORBIT_ABSOLUTE);
        assert_eq!(
            ParentTitle::describe(NAME, &c, "S1A_EW_GRD_R140"),
            ParentTitle::Fallback("S1A_EW_GRD_R140".into())
        );
    }

    #[test]
    fn inactive_first_child_leaves_rectangle_unset() {
        let parent = run(&child("Inactive"), TitleStyle::StorageName).unwrap();
        assert!(parent_geo(&parent).is_unset());
        assert_eq!(parent.text(mmd::NORTH).as_deref(), Some("999.0"));
    }

    fn with_times(start: &str, end: &str) -> Record {
        let xml = CHILD
            .replace("STATUS", "Active")
            .replace("2023-10-16T07:12:58.000Z", start)
            .replace("2023-10-16T07:15:02.000Z", end);
        Record::parse(xml.as_bytes()).unwrap()
    }

    #[test]
    fn unreadable_child_time_is_not_copied() {
        let parent = run(&with_times("not a date", "2021-01-02"), TitleStyle::StorageName).unwrap();
        let extent = temporal_extent(&parent).unwrap();
        assert_eq!(extent.start, None);
        assert_eq!(extent.end, None);
        assert_eq!(parent.text(mmd::START_DATE).as_deref(), Some(""));
        // The rectangle is independent of the time range.
        assert_eq!(parent_geo(&parent).bounds(), [80.0, 70.0, 10.0, -10.0]);
    }

    #[test]
    fn reversed_child_time_is_not_copied() {
        let parent = run(&with_times("2022-01-01", "2021-01-01"), TitleStyle::StorageName).unwrap();
        let extent = temporal_extent(&parent).unwrap();
        assert_eq!((extent.start, extent.end), (None, None));
    }

    #[test]
    fn refuses_unvalidated_child() {
        let mut c = child("Active");
        c.remove_all(mmd::RELATED_DATASET);
        let err = run(&c, TitleStyle::StorageName).unwrap_err();
        assert_eq!(err.report.missing, vec![crate::models::RequiredField::RelatedDataset]);
    }
}
