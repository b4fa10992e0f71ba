//! Core domain model for sail reporting sync.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sailrep-core";

/// Set of source record ids. Ordering and duplicates in the source never matter.
pub type LinkSet = BTreeSet<String>;

/// Which source collection a sail record comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Boat,
    Individual,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Boat, SourceKind::Individual];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Boat => "boat",
            SourceKind::Individual => "individual",
        }
    }

    pub fn other(self) -> SourceKind {
        match self {
            SourceKind::Boat => SourceKind::Individual,
            SourceKind::Individual => SourceKind::Boat,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row from either source collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub event_id: Option<String>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, event_id: Option<&str>) -> Self {
        Self {
            id: id.into(),
            event_id: event_id.map(str::to_string),
        }
    }

    /// Event id with blank values treated as absent.
    pub fn event_id(&self) -> Option<&str> {
        self.event_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// All source records sharing one event id, rebuilt on every run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EventGroup {
    pub event_id: String,
    pub boat_record_ids: LinkSet,
    pub individual_record_ids: LinkSet,
}

impl EventGroup {
    pub fn record_ids(&self, kind: SourceKind) -> &LinkSet {
        match kind {
            SourceKind::Boat => &self.boat_record_ids,
            SourceKind::Individual => &self.individual_record_ids,
        }
    }
}

/// One row of the derived reporting collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReportingRecord {
    pub id: String,
    pub event_id: Option<String>,
    #[serde(default)]
    pub boat_sail_links: LinkSet,
    #[serde(default)]
    pub individual_sail_links: LinkSet,
}

impl ReportingRecord {
    pub fn links(&self, kind: SourceKind) -> &LinkSet {
        match kind {
            SourceKind::Boat => &self.boat_sail_links,
            SourceKind::Individual => &self.individual_sail_links,
        }
    }

    pub fn has_links(&self) -> bool {
        !self.boat_sail_links.is_empty() || !self.individual_sail_links.is_empty()
    }

    /// Linked to both kinds at once, or to neither.
    pub fn is_anomalous(&self) -> bool {
        self.boat_sail_links.is_empty() == self.individual_sail_links.is_empty()
    }

    /// The single kind this record links to, if it is well formed.
    pub fn linked_kind(&self) -> Option<SourceKind> {
        match (
            self.boat_sail_links.is_empty(),
            self.individual_sail_links.is_empty(),
        ) {
            (false, true) => Some(SourceKind::Boat),
            (true, false) => Some(SourceKind::Individual),
            _ => None,
        }
    }
}

/// The reporting row one (event id, kind) pair should produce.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DesiredAssociation {
    pub event_id: String,
    pub kind: SourceKind,
    pub record_ids: LinkSet,
}

impl DesiredAssociation {
    pub fn is_satisfied_by(&self, record: &ReportingRecord) -> bool {
        record.event_id.as_deref() == Some(self.event_id.as_str())
            && record.links(self.kind) == &self.record_ids
            && record.links(self.kind.other()).is_empty()
    }

    pub fn into_payload(self) -> ReportingPayload {
        ReportingPayload {
            event_id: self.event_id,
            kind: self.kind,
            record_ids: self.record_ids,
        }
    }
}

/// Field payload for a new reporting row. Exactly one link kind is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingPayload {
    pub event_id: String,
    pub kind: SourceKind,
    pub record_ids: LinkSet,
}

impl ReportingPayload {
    pub fn new<I, S>(event_id: impl Into<String>, kind: SourceKind, record_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_id: event_id.into(),
            kind,
            record_ids: record_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// The record this payload becomes once the store assigns it an id.
    pub fn into_record(self, id: impl Into<String>) -> ReportingRecord {
        let mut record = ReportingRecord {
            id: id.into(),
            event_id: Some(self.event_id),
            ..ReportingRecord::default()
        };
        match self.kind {
            SourceKind::Boat => record.boat_sail_links = self.record_ids,
            SourceKind::Individual => record.individual_sail_links = self.record_ids,
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(ids: &[&str]) -> LinkSet {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn blank_event_ids_are_absent() {
        assert_eq!(SourceRecord::new("a", Some("  ")).event_id(), None);
        assert_eq!(SourceRecord::new("a", None).event_id(), None);
        assert_eq!(SourceRecord::new("a", Some("e1")).event_id(), Some("e1"));
    }

    #[test]
    fn anomaly_covers_both_and_neither() {
        let neither = ReportingRecord {
            id: "r1".into(),
            ..Default::default()
        };
        let both = ReportingRecord {
            id: "r2".into(),
            event_id: Some("e1".into()),
            boat_sail_links: links(&["b1"]),
            individual_sail_links: links(&["i1"]),
        };
        let boat = ReportingRecord {
            id: "r3".into(),
            event_id: Some("e1".into()),
            boat_sail_links: links(&["b1"]),
            ..Default::default()
        };
        assert!(neither.is_anomalous());
        assert!(!neither.has_links());
        assert!(both.is_anomalous());
        assert_eq!(both.linked_kind(), None);
        assert!(!boat.is_anomalous());
        assert_eq!(boat.linked_kind(), Some(SourceKind::Boat));
    }

    #[test]
    fn association_requires_exclusive_links() {
        let desired = DesiredAssociation {
            event_id: "e1".into(),
            kind: SourceKind::Boat,
            record_ids: links(&["b1"]),
        };
        let exact = ReportingRecord {
            id: "r1".into(),
            event_id: Some("e1".into()),
            boat_sail_links: links(&["b1"]),
            ..Default::default()
        };
        let mixed = ReportingRecord {
            individual_sail_links: links(&["i1"]),
            ..exact.clone()
        };
        let other_event = ReportingRecord {
            event_id: Some("e2".into()),
            ..exact.clone()
        };
        assert!(desired.is_satisfied_by(&exact));
        assert!(!desired.is_satisfied_by(&mixed));
        assert!(!desired.is_satisfied_by(&other_event));
    }

    #[test]
    fn payload_becomes_single_kind_record() {
        let payload = ReportingPayload::new("e4", SourceKind::Individual, ["i4", "i3", "i4"]);
        assert_eq!(payload.record_ids, links(&["i3", "i4"]));
        let record = payload.into_record("new1");
        assert_eq!(record.linked_kind(), Some(SourceKind::Individual));
        assert_eq!(record.event_id.as_deref(), Some("e4"));
    }

    #[test]
    fn source_kind_serializes_snake_case() {
        let json = serde_json::to_string(&SourceKind::Individual).unwrap();
        assert_eq!(json, "\"individual\"");
    }
}
