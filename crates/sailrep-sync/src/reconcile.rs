//! Desired-state computation for the reporting table.
//!
//! Every run rebuilds the full desired state from the two source collections and diffs it
//! against the current reporting rows. Rows are never patched: a row whose links differ
//! from what the sources say is deleted and a fresh one is created.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use sailrep_core::{
    DesiredAssociation, EventGroup, LinkSet, ReportingPayload, ReportingRecord, SourceKind,
    SourceRecord,
};
use serde::Serialize;
use tracing::debug;

/// Event id to the ids of the source records carrying it.
pub type EventMap = BTreeMap<String, LinkSet>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceMaps {
    pub boat: EventMap,
    pub individual: EventMap,
    /// Source records skipped because they carry no event id yet.
    pub dropped_without_event: usize,
}

impl SourceMaps {
    pub fn event_ids(&self) -> BTreeSet<&str> {
        self.boat
            .keys()
            .chain(self.individual.keys())
            .map(String::as_str)
            .collect()
    }

    pub fn event_groups(&self) -> Vec<EventGroup> {
        self.event_ids()
            .into_iter()
            .map(|event_id| EventGroup {
                event_id: event_id.to_string(),
                boat_record_ids: self.boat.get(event_id).cloned().unwrap_or_default(),
                individual_record_ids: self.individual.get(event_id).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// One association per (event id, kind) present, ordered by event id with boat first.
    pub fn desired_associations(&self) -> Vec<DesiredAssociation> {
        let mut desired = Vec::new();
        for group in self.event_groups() {
            for kind in SourceKind::ALL {
                let record_ids = group.record_ids(kind);
                if !record_ids.is_empty() {
                    desired.push(DesiredAssociation {
                        event_id: group.event_id.clone(),
                        kind,
                        record_ids: record_ids.clone(),
                    });
                }
            }
        }
        desired
    }
}

pub fn aggregate_sources(boat: &[SourceRecord], individual: &[SourceRecord]) -> SourceMaps {
    let mut dropped = 0;
    let boat = group_by_event(boat, SourceKind::Boat, &mut dropped);
    let individual = group_by_event(individual, SourceKind::Individual, &mut dropped);
    SourceMaps {
        boat,
        individual,
        dropped_without_event: dropped,
    }
}

fn group_by_event(records: &[SourceRecord], kind: SourceKind, dropped: &mut usize) -> EventMap {
    let mut map = EventMap::new();
    for record in records {
        match record.event_id() {
            Some(event_id) => {
                map.entry(event_id.to_string())
                    .or_default()
                    .insert(record.id.clone());
            }
            None => {
                debug!(kind = %kind, record_id = %record.id, "sail has no event id yet");
                *dropped += 1;
            }
        }
    }
    map
}

/// Current reporting rows split by whether they link to any source record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportingSnapshot {
    pub linked: Vec<ReportingRecord>,
    pub unlinked: Vec<ReportingRecord>,
}

impl ReportingSnapshot {
    pub fn partition(records: Vec<ReportingRecord>) -> Self {
        let (linked, unlinked) = records.into_iter().partition(ReportingRecord::has_links);
        Self { linked, unlinked }
    }

    pub fn total(&self) -> usize {
        self.linked.len() + self.unlinked.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    BothKinds,
    Unlinked,
    MissingEventId,
}

/// A reporting row that can never be valid as it stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub record_id: String,
    pub event_id: Option<String>,
    pub kind: AnomalyKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePlan {
    pub desired: Vec<DesiredAssociation>,
    /// Existing rows that already match a desired association.
    pub retained: Vec<String>,
    pub to_create: Vec<ReportingPayload>,
    pub to_delete: Vec<String>,
    pub anomalies: Vec<Anomaly>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

pub fn reconcile(sources: &SourceMaps, snapshot: &ReportingSnapshot) -> ReconcilePlan {
    let desired = sources.desired_associations();

    let mut by_event: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, record) in snapshot.linked.iter().enumerate() {
        if let Some(event_id) = record.event_id.as_deref() {
            by_event.entry(event_id).or_default().push(idx);
        }
    }

    let mut retained = vec![false; snapshot.linked.len()];
    let mut to_create = Vec::new();
    for association in &desired {
        let matched = by_event
            .get(association.event_id.as_str())
            .and_then(|candidates| {
                candidates.iter().copied().find(|&idx| {
                    !retained[idx] && association.is_satisfied_by(&snapshot.linked[idx])
                })
            });
        match matched {
            Some(idx) => {
                debug!(
                    event_id = %association.event_id,
                    kind = %association.kind,
                    record_id = %snapshot.linked[idx].id,
                    "reporting row already in sync"
                );
                retained[idx] = true;
            }
            None => to_create.push(association.clone().into_payload()),
        }
    }

    let mut seen = HashSet::new();
    let mut to_delete = Vec::new();
    let stale = snapshot
        .linked
        .iter()
        .zip(&retained)
        .filter(|(_, kept)| !**kept)
        .map(|(record, _)| record);
    for record in snapshot.unlinked.iter().chain(stale) {
        if seen.insert(record.id.as_str()) {
            to_delete.push(record.id.clone());
        }
    }

    ReconcilePlan {
        retained: snapshot
            .linked
            .iter()
            .zip(&retained)
            .filter(|(_, kept)| **kept)
            .map(|(record, _)| record.id.clone())
            .collect(),
        anomalies: find_anomalies(snapshot),
        desired,
        to_create,
        to_delete,
    }
}

fn find_anomalies(snapshot: &ReportingSnapshot) -> Vec<Anomaly> {
    let unlinked = snapshot.unlinked.iter().map(|record| Anomaly {
        record_id: record.id.clone(),
        event_id: record.event_id.clone(),
        kind: AnomalyKind::Unlinked,
    });
    let linked = snapshot.linked.iter().filter_map(|record| {
        let kind = if record.is_anomalous() {
            AnomalyKind::BothKinds
        } else if record.event_id.is_none() {
            AnomalyKind::MissingEventId
        } else {
            return None;
        };
        Some(Anomaly {
            record_id: record.id.clone(),
            event_id: record.event_id.clone(),
            kind,
        })
    });
    unlinked.chain(linked).collect()
}

/// Event ids carried by more than one boat sail, or by both a boat sail and an individual
/// sail. Several individual sails sharing an event is normal.
pub fn find_duplicate_event_ids(boat: &[SourceRecord], individual: &[SourceRecord]) -> Vec<String> {
    let mut boat_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in boat {
        if let Some(event_id) = record.event_id() {
            *boat_counts.entry(event_id).or_default() += 1;
        }
    }
    let individual_events: HashSet<&str> = individual
        .iter()
        .filter_map(SourceRecord::event_id)
        .collect();

    boat_counts
        .into_iter()
        .filter(|(event_id, count)| *count > 1 || individual_events.contains(event_id))
        .map(|(event_id, _)| event_id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(id: &str, event_id: Option<&str>) -> SourceRecord {
        SourceRecord::new(id, event_id)
    }

    fn linked(id: &str, event_id: &str, boat: &[&str], individual: &[&str]) -> ReportingRecord {
        ReportingRecord {
            id: id.to_string(),
            event_id: Some(event_id.to_string()),
            boat_sail_links: boat.iter().map(|s| s.to_string()).collect(),
            individual_sail_links: individual.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn aggregation_groups_individuals_and_drops_missing_events() {
        let maps = aggregate_sources(
            &[src("boatId1", Some("eventId1")), src("boatId2", None)],
            &[
                src("indivId1", Some("eventId2")),
                src("indivId2", Some("eventId2")),
                src("indivId3", Some("")),
            ],
        );
        assert_eq!(maps.dropped_without_event, 2);
        assert_eq!(maps.boat.len(), 1);
        assert_eq!(maps.individual["eventId2"].len(), 2);
        assert_eq!(maps.event_ids().into_iter().collect::<Vec<_>>(), vec!["eventId1", "eventId2"]);
    }

    #[test]
    fn event_in_both_kinds_yields_two_associations() {
        let maps = aggregate_sources(
            &[src("boatId1", Some("eventId1"))],
            &[src("indivId1", Some("eventId1"))],
        );
        let desired = maps.desired_associations();
        assert_eq!(desired.len(), 2);
        assert_eq!(desired[0].kind, SourceKind::Boat);
        assert_eq!(desired[1].kind, SourceKind::Individual);
        let groups = maps.event_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].boat_record_ids.len(), 1);
        assert_eq!(groups[0].individual_record_ids.len(), 1);
    }

    #[test]
    fn partition_keeps_both_kind_rows_linked() {
        let snapshot = ReportingSnapshot::partition(vec![
            linked("reportingId1", "eventId1", &["boatId1"], &["indivId1"]),
            ReportingRecord {
                id: "reportingId2".into(),
                ..Default::default()
            },
        ]);
        assert_eq!(snapshot.linked.len(), 1);
        assert_eq!(snapshot.unlinked.len(), 1);
        assert_eq!(snapshot.total(), 2);
    }

    #[test]
    fn duplicate_reporting_rows_keep_only_one() {
        let maps = aggregate_sources(&[src("boatId1", Some("eventId1"))], &[]);
        let snapshot = ReportingSnapshot::partition(vec![
            linked("reportingId1", "eventId1", &["boatId1"], &[]),
            linked("reportingId2", "eventId1", &["boatId1"], &[]),
        ]);
        let plan = reconcile(&maps, &snapshot);
        assert_eq!(plan.retained, vec!["reportingId1".to_string()]);
        assert_eq!(plan.to_delete, vec!["reportingId2".to_string()]);
        assert!(plan.to_create.is_empty());
    }

    #[test]
    fn anomalies_are_classified() {
        let snapshot = ReportingSnapshot::partition(vec![
            linked("both", "eventId1", &["boatId1"], &["indivId1"]),
            ReportingRecord {
                id: "orphan".into(),
                event_id: None,
                boat_sail_links: ["boatId2".to_string()].into_iter().collect(),
                ..Default::default()
            },
            ReportingRecord {
                id: "empty".into(),
                ..Default::default()
            },
            linked("fine", "eventId3", &["boatId3"], &[]),
        ]);
        let plan = reconcile(&SourceMaps::default(), &snapshot);
        let kinds: Vec<_> = plan
            .anomalies
            .iter()
            .map(|a| (a.record_id.as_str(), a.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("empty", AnomalyKind::Unlinked),
                ("both", AnomalyKind::BothKinds),
                ("orphan", AnomalyKind::MissingEventId),
            ]
        );
        assert_eq!(plan.to_delete, vec!["empty", "both", "orphan", "fine"]);
    }

    #[test]
    fn duplicate_event_ids_follow_boat_rules() {
        let none = find_duplicate_event_ids(
            &[src("boatId1", Some("eventId1"))],
            &[src("indivId1", Some("eventId2"))],
        );
        assert!(none.is_empty());

        let individuals_only = find_duplicate_event_ids(
            &[],
            &[src("indivId1", Some("eventId1")), src("indivId2", Some("eventId1"))],
        );
        assert!(individuals_only.is_empty());

        let mixed = find_duplicate_event_ids(
            &[
                src("boatId1", Some("eventId1")),
                src("boatId2", Some("eventId1")),
                src("boatId3", Some("eventId2")),
            ],
            &[src("indivId1", Some("eventId1")), src("indivId2", Some("eventId2"))],
        );
        assert_eq!(mixed, vec!["eventId1".to_string(), "eventId2".to_string()]);
    }
}
