//! Extent reconciler: folds one child into an existing parent's envelope.
//!
//! The child passes two gates first. Inactive children and children whose
//! rectangle misses the area of interest never touch the envelope. Past the
//! gates, the temporal range and the rectangle are widened to cover the
//! child. Everything is computed up front; the parent is only mutated once
//! the whole change is known, and not at all when nothing would change.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::clock::Clock;
use crate::extent::{
    format_coordinate, format_timestamp, parse_timestamp, AreaOfInterest, BoundingBox,
    ExtentError, GeoExtent, TemporalExtent,
};
use crate::models::{UpdateType, STATUS_ACTIVE};
use crate::record::{mmd, Record};

/// Why a child left the envelope alone.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("child status is {status:?}, not Active")]
    Inactive { status: Option<String> },
    #[error("child rectangle lies outside the area of interest")]
    OutsideArea,
    #[error("malformed child extent: {0}")]
    MalformedExtent(ExtentError),
}

/// Effect of one reconciliation on the parent's envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeChange {
    /// The parent was modified; lists the record keys that changed.
    Widened(Vec<&'static str>),
    /// The child fell inside the existing envelope.
    Unchanged,
    Skipped(SkipReason),
}

impl EnvelopeChange {
    pub fn is_widened(&self) -> bool {
        matches!(self, EnvelopeChange::Widened(_))
    }
}

pub struct Reconciler<'a> {
    area: &'a AreaOfInterest,
    clock: &'a dyn Clock,
    mark_updates: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(area: &'a AreaOfInterest, clock: &'a dyn Clock) -> Self {
        Self {
            area,
            clock,
            mark_updates: false,
        }
    }

    /// Set the update type to `Updated` whenever the envelope changes.
    pub fn mark_updates(mut self, yes: bool) -> Self {
        self.mark_updates = yes;
        self
    }

    /// Fold `child` into `parent`. Never fails: a bad child is a skip.
    pub fn reconcile(&self, parent: &mut Record, child: &Record) -> EnvelopeChange {
        let status = child.text(mmd::METADATA_STATUS);
        if status.as_deref() != Some(STATUS_ACTIVE) {
            tracing::debug!(?status, "inactive child, envelope untouched");
            return EnvelopeChange::Skipped(SkipReason::Inactive { status });
        }

        let read = child_rectangle(child).and_then(|rect| Ok((rect, TimedText::read(child)?)));
        let (rect, child_time) = match read {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "malformed child extent, envelope untouched");
                return EnvelopeChange::Skipped(SkipReason::MalformedExtent(err));
            }
        };
        if !self.area.intersects(&rect) {
            tracing::debug!(?rect, "child outside area of interest");
            return EnvelopeChange::Skipped(SkipReason::OutsideArea);
        }

        let edits = plan(parent, &rect, &child_time);
        if edits.is_empty() {
            return EnvelopeChange::Unchanged;
        }

        let changed: Vec<&'static str> = edits.iter().map(|(key, _)| *key).collect();
        for (key, value) in edits {
            parent.ensure_text(key, &value);
        }
        parent.ensure_text(mmd::UPDATE_DATETIME, &format_timestamp(&self.clock.now()));
        if self.mark_updates {
            parent.ensure_text(mmd::UPDATE_TYPE, UpdateType::Updated.as_str());
        }
        tracing::debug!(fields = ?changed, "envelope widened");
        EnvelopeChange::Widened(changed)
    }
}

/// Compute the field writes needed to cover the child. Empty when none.
fn plan(parent: &Record, rect: &BoundingBox, child: &TimedText) -> Vec<(&'static str, String)> {
    let mut edits = Vec::new();

    let before = TimedText::read_lenient(parent).extent();
    let merged = before.merge(&child.extent());
    if merged.start != before.start {
        if let Some((_, raw)) = &child.start {
            edits.push((mmd::START_DATE, raw.clone()));
        }
    }
    if merged.end != before.end {
        if let Some((_, raw)) = &child.end {
            edits.push((mmd::END_DATE, raw.clone()));
        }
    }

    let current = parent_geo(parent);
    let widened = current.merge(rect);
    if widened != current {
        let keys = [mmd::NORTH, mmd::SOUTH, mmd::EAST, mmd::WEST];
        let before = current.bounds();
        for ((key, new), old) in keys.iter().zip(widened.bounds()).zip(before) {
            if new != old {
                edits.push((*key, format_coordinate(new)));
            }
        }
    }
    edits
}

/// Temporal bounds together with the text they were parsed from.
#[derive(Debug)]
struct TimedText {
    start: Option<(DateTime<Utc>, String)>,
    end: Option<(DateTime<Utc>, String)>,
}

impl TimedText {
    /// Strict read: a present but unparseable bound, or start after end, is an error.
    /// Missing bounds are `None`.
    fn read(record: &Record) -> Result<Self, ExtentError> {
        let bound = |key: &str| -> Result<Option<(DateTime<Utc>, String)>, ExtentError> {
            match record.text(key) {
                Some(raw) if !raw.is_empty() => Ok(Some((parse_timestamp(key, &raw)?, raw))),
                _ => Ok(None),
            }
        };
        let (start, end) = (bound(mmd::START_DATE)?, bound(mmd::END_DATE)?);
        if let (Some((s, s_raw)), Some((e, e_raw))) = (&start, &end) {
            if s > e {
                return Err(ExtentError::ReversedInterval {
                    start: s_raw.clone(),
                    end: e_raw.clone(),
                });
            }
        }
        Ok(Self { start, end })
    }

    /// Unparseable bounds on a parent are treated as absent, so the next child repairs them.
    fn read_lenient(record: &Record) -> Self {
        let bound = |key: &str| {
            let raw = record.text(key).filter(|r| !r.is_empty())?;
            match parse_timestamp(key, &raw) {
                Ok(ts) => Some((ts, raw)),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring unreadable parent bound");
                    None
                }
            }
        };
        Self {
            start: bound(mmd::START_DATE),
            end: bound(mmd::END_DATE),
        }
    }

    fn extent(&self) -> TemporalExtent {
        TemporalExtent {
            start: self.start.as_ref().map(|(t, _)| *t),
            end: self.end.as_ref().map(|(t, _)| *t),
        }
    }
}

/// Temporal extent of a record. Missing bounds are `None`.
pub fn temporal_extent(record: &Record) -> Result<TemporalExtent, ExtentError> {
    TimedText::read(record).map(|t| t.extent())
}

fn coordinate(record: &Record, key: &str) -> Result<f64, ExtentError> {
    let raw = record.text(key).ok_or_else(|| ExtentError::Missing {
        field: key.to_string(),
    })?;
    raw.parse::<f64>().map_err(|_| ExtentError::BadCoordinate {
        field: key.to_string(),
        value: raw,
    })
}

/// The child's rectangle. All four bounds must be present and valid.
pub fn child_rectangle(record: &Record) -> Result<BoundingBox, ExtentError> {
    BoundingBox::new(
        coordinate(record, mmd::NORTH)?,
        coordinate(record, mmd::SOUTH)?,
        coordinate(record, mmd::EAST)?,
        coordinate(record, mmd::WEST)?,
    )
}

/// The parent's geospatial extent. Missing or unreadable bounds count as unset.
pub fn parent_geo(record: &Record) -> GeoExtent {
    let read = || -> Result<GeoExtent, ExtentError> {
        GeoExtent::from_bounds(
            coordinate(record, mmd::NORTH)?,
            coordinate(record, mmd::SOUTH)?,
            coordinate(record, mmd::EAST)?,
            coordinate(record, mmd::WEST)?,
        )
    };
    read().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "parent rectangle unreadable, treating as unset");
        GeoExtent::Unset
    })
}

/// Write all four bounds of `extent` into `record`.
pub fn write_geo(record: &mut Record, extent: &GeoExtent) {
    let keys = [mmd::NORTH, mmd::SOUTH, mmd::EAST, mmd::WEST];
    for (key, value) in keys.iter().zip(extent.bounds()) {
        record.ensure_text(key, &format_coordinate(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn record(status: &str, start: &str, end: &str, nsew: [&str; 4]) -> Record {
        let [n, s, e, w] = nsew;
        let xml = format!(
            r#"<mmd:mmd xmlns:mmd="http://www.met.no/schema/mmd">
  <mmd:metadata_status>{status}</mmd:metadata_status>
  <mmd:last_metadata_update>
    <mmd:update>
      <mmd:datetime>2020-01-01T00:00:00.000Z</mmd:datetime>
      <mmd:type>Created</mmd:type>
    </mmd:update>
  </mmd:last_metadata_update>
  <mmd:temporal_extent>
    <mmd:start_date>{start}</mmd:start_date>
    <mmd:end_date>{end}</mmd:end_date>
  </mmd:temporal_extent>
  <mmd:geographic_extent>
    <mmd:rectangle>
      <mmd:north>{n}</mmd:north>
      <mmd:south>{s}</mmd:south>
      <mmd:east>{e}</mmd:east>
      <mmd:west>{w}</mmd:west>
    </mmd:rectangle>
  </mmd:geographic_extent>
</mmd:mmd>"#
        );
        Record::parse(xml.as_bytes()).unwrap()
    }

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn bounds(r: &Record) -> [f64; 4] {
        parent_geo(r).bounds()
    }

    #[test]
    fn unset_parent_takes_child_rectangle_verbatim() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let mut parent = record("Active", "2021-01-01", "2021-01-02", ["999", "999", "999", "999"]);
        let child = record("Active", "2021-01-01", "2021-01-02", ["80", "70", "10", "-10"]);

        let change = Reconciler::new(&area, &clock).reconcile(&mut parent, &child);
        assert!(change.is_widened());
        assert_eq!(bounds(&parent), [80.0, 70.0, 10.0, -10.0]);
        assert_eq!(
            parent.text(mmd::UPDATE_DATETIME).as_deref(),
            Some("2024-05-01T12:00:00.000Z")
        );
        assert_eq!(parent.text(mmd::UPDATE_TYPE).as_deref(), Some("Created"));
    }

    #[test]
    fn widens_both_dimensions() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let mut parent = record(
            "Active",
            "2021-01-01T00:00:00Z",
            "2021-01-02T00:00:00Z",
            ["80.0", "70.0", "10.0", "-10.0"],
        );
        let child = record(
            "Active",
            "2020-06-01",
            "2020-06-03",
            ["82.0", "75.0", "5.0", "-15.0"],
        );

        let change = Reconciler::new(&area, &clock).reconcile(&mut parent, &child);
        assert_eq!(
            change,
            EnvelopeChange::Widened(vec![mmd::START_DATE, mmd::NORTH, mmd::WEST])
        );
        assert_eq!(bounds(&parent), [82.0, 70.0, 10.0, -15.0]);
        assert_eq!(parent.text(mmd::START_DATE).as_deref(), Some("2020-06-01"));
        assert_eq!(
            parent.text(mmd::END_DATE).as_deref(),
            Some("2021-01-02T00:00:00Z")
        );
    }

    #[test]
    fn inactive_child_is_ignored() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let mut parent = record("Active", "2021-01-01", "2021-01-02", ["80", "70", "10", "-10"]);
        let before = parent.clone();
        let child = record("Inactive", "2000-01-01", "2030-01-01", ["90", "60", "20", "-20"]);

        let change = Reconciler::new(&area, &clock).reconcile(&mut parent, &child);
        assert!(matches!(
            change,
            EnvelopeChange::Skipped(SkipReason::Inactive { .. })
        ));
        assert_eq!(parent, before);
    }

    #[test]
    fn child_outside_area_is_ignored() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let mut parent = record("Active", "2021-01-01", "2021-01-02", ["80", "70", "10", "-10"]);
        let before = parent.clone();
        // Southern Ocean.
        let child = record("Active", "2000-01-01", "2030-01-01", ["-60", "-70", "20", "10"]);

        let change = Reconciler::new(&area, &clock).reconcile(&mut parent, &child);
        assert_eq!(change, EnvelopeChange::Skipped(SkipReason::OutsideArea));
        assert_eq!(parent, before);
    }

    #[test]
    fn contained_child_rewrites_nothing() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let mut parent = record("Active", "2021-01-01", "2021-01-05", ["80", "70", "10", "-10"]);
        let before = parent.clone();
        let child = record("Active", "2021-01-02", "2021-01-03", ["79", "71", "9", "-9"]);

        let change = Reconciler::new(&area, &clock).reconcile(&mut parent, &child);
        assert_eq!(change, EnvelopeChange::Unchanged);
        assert_eq!(parent, before);
    }

    #[test]
    fn malformed_child_leaves_parent_untouched() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let mut parent = record("Active", "2021-01-01", "2021-01-05", ["80", "70", "10", "-10"]);
        let before = parent.clone();
        let reconciler = Reconciler::new(&area, &clock);

        let bad_time = record("Active", "yesterday", "2021-01-03", ["85", "71", "9", "-9"]);
        assert!(matches!(
            reconciler.reconcile(&mut parent, &bad_time),
            EnvelopeChange::Skipped(SkipReason::MalformedExtent(ExtentError::BadTimestamp { .. }))
        ));
        let bad_rect = record("Active", "2021-01-01", "2021-01-03", ["85", "71", "-9", "9"]);
        assert!(matches!(
            reconciler.reconcile(&mut parent, &bad_rect),
            EnvelopeChange::Skipped(SkipReason::MalformedExtent(_))
        ));
        let reversed = record("Active", "2021-01-04", "2020-12-01", ["85", "71", "9", "-9"]);
        assert!(matches!(
            reconciler.reconcile(&mut parent, &reversed),
            EnvelopeChange::Skipped(SkipReason::MalformedExtent(ExtentError::ReversedInterval { .. }))
        ));
        assert_eq!(parent, before);
    }

    #[test]
    fn mark_updates_sets_update_type() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let mut parent = record("Active", "2021-01-01", "2021-01-02", ["80", "70", "10", "-10"]);
        let child = record("Active", "2021-01-01", "2021-01-09", ["80", "70", "10", "-10"]);

        let change = Reconciler::new(&area, &clock)
            .mark_updates(true)
            .reconcile(&mut parent, &child);
        assert_eq!(change, EnvelopeChange::Widened(vec![mmd::END_DATE]));
        assert_eq!(parent.text(mmd::UPDATE_TYPE).as_deref(), Some("Updated"));
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let area = AreaOfInterest::default();
        let clock = clock();
        let reconciler = Reconciler::new(&area, &clock);
        let children = [
            record("Active", "2021-01-01", "2021-01-02", ["80", "70", "10", "-10"]),
            record("Active", "2020-06-01", "2020-06-03", ["82", "75", "5", "-15"]),
            record("Active", "2020-09-01", "2020-09-03", ["78", "65", "12", "0"]),
        ];

        let fold = |order: &[usize]| {
            let mut parent = record("Active", "", "", ["999", "999", "999", "999"]);
            for &i in order {
                let _ = reconciler.reconcile(&mut parent, &children[i]);
            }
            (temporal_extent(&parent).unwrap(), bounds(&parent))
        };

        let expected = fold(&[0, 1, 2]);
        for order in [[2, 1, 0], [1, 0, 2], [1, 2, 0]] {
            assert_eq!(fold(&order), expected);
        }
        assert_eq!(expected.1, [82.0, 65.0, 12.0, -15.0]);
        assert_eq!(
            format_timestamp(&expected.0.start.unwrap()),
            "2020-06-01T00:00:00.000Z"
        );
    }

    #[test]
    fn write_geo_resets_to_sentinel() {
        let mut parent = record("Active", "2021-01-01", "2021-01-02", ["80", "70", "10", "-10"]);
        write_geo(&mut parent, &GeoExtent::Unset);
        assert_eq!(parent.text(mmd::NORTH).as_deref(), Some("999.0"));
        assert!(parent_geo(&parent).is_unset());
    }
}
