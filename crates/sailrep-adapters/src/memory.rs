//! In-memory collaborators for tests and dry runs.

use async_trait::async_trait;
use sailrep_core::{ReportingPayload, ReportingRecord, SourceKind, SourceRecord};
use tokio::sync::Mutex;

use crate::{Notifier, ReportingStore, SailSource, StoreError};

/// A mutation the store received, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Create(Vec<ReportingPayload>),
    Delete(Vec<String>),
}

#[derive(Debug, Default)]
struct MemoryState {
    boat: Vec<SourceRecord>,
    individual: Vec<SourceRecord>,
    reporting: Vec<ReportingRecord>,
    next_id: usize,
    calls: Vec<StoreCall>,
    fail_fetch: Option<&'static str>,
    /// How many records a create or delete call applies before it fails.
    create_limit: Option<usize>,
    delete_limit: Option<usize>,
}

/// Source and reporting collections held in memory, with failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(boat: Vec<SourceRecord>, individual: Vec<SourceRecord>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                boat,
                individual,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn set_sources(&self, kind: SourceKind, records: Vec<SourceRecord>) {
        let mut state = self.state.lock().await;
        match kind {
            SourceKind::Boat => state.boat = records,
            SourceKind::Individual => state.individual = records,
        }
    }

    pub async fn set_reporting(&self, records: Vec<ReportingRecord>) {
        self.state.lock().await.reporting = records;
    }

    pub async fn reporting(&self) -> Vec<ReportingRecord> {
        self.state.lock().await.reporting.clone()
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    /// Makes the named read (`boat`, `individual` or `reporting`) fail.
    pub async fn fail_fetch(&self, collection: &'static str) {
        self.state.lock().await.fail_fetch = Some(collection);
    }

    pub async fn fail_create(&self, fail: bool) {
        self.state.lock().await.create_limit = fail.then_some(0);
    }

    pub async fn fail_delete(&self, fail: bool) {
        self.state.lock().await.delete_limit = fail.then_some(0);
    }

    /// Lets each create call write `applied` records, then fail on the rest.
    pub async fn fail_create_after(&self, applied: usize) {
        self.state.lock().await.create_limit = Some(applied);
    }

    /// Lets each delete call remove `applied` records, then fail on the rest.
    pub async fn fail_delete_after(&self, applied: usize) {
        self.state.lock().await.delete_limit = Some(applied);
    }

    async fn read_sources(&self, kind: SourceKind) -> Result<Vec<SourceRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_fetch == Some(kind.as_str()) {
            return Err(StoreError::Message(format!("{kind} sails unavailable")));
        }
        Ok(match kind {
            SourceKind::Boat => state.boat.clone(),
            SourceKind::Individual => state.individual.clone(),
        })
    }
}

#[async_trait]
impl SailSource for MemoryStore {
    async fn fetch_boat_sail_records(&self) -> Result<Vec<SourceRecord>, StoreError> {
        self.read_sources(SourceKind::Boat).await
    }

    async fn fetch_individual_sail_records(&self) -> Result<Vec<SourceRecord>, StoreError> {
        self.read_sources(SourceKind::Individual).await
    }
}

#[async_trait]
impl ReportingStore for MemoryStore {
    async fn fetch_reporting_records(&self) -> Result<Vec<ReportingRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_fetch == Some("reporting") {
            return Err(StoreError::Message("reporting table unavailable".to_string()));
        }
        Ok(state.reporting.clone())
    }

    async fn create_reporting_records(
        &self,
        payloads: &[ReportingPayload],
    ) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Create(payloads.to_vec()));
        let limit = state.create_limit.unwrap_or(payloads.len());
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads.iter().take(limit) {
            state.next_id += 1;
            let id = format!("newId{}", state.next_id);
            state.reporting.push(payload.clone().into_record(id.clone()));
            ids.push(id);
        }
        if limit < payloads.len() {
            return Err(stopped_after(ids, "create rejected"));
        }
        Ok(ids)
    }

    async fn delete_reporting_records(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Delete(ids.to_vec()));
        let limit = state.delete_limit.unwrap_or(ids.len());
        let attempted = &ids[..limit.min(ids.len())];
        let mut deleted = Vec::with_capacity(attempted.len());
        state.reporting.retain(|record| {
            if attempted.contains(&record.id) {
                deleted.push(record.id.clone());
                false
            } else {
                true
            }
        });
        if limit < ids.len() {
            return Err(stopped_after(deleted, "delete rejected"));
        }
        Ok(deleted)
    }
}

fn stopped_after(completed: Vec<String>, reason: &str) -> StoreError {
    let err = StoreError::Message(reason.to_string());
    if completed.is_empty() {
        err
    } else {
        StoreError::Partial {
            completed,
            source: Box::new(err),
        }
    }
}

/// Notifier that keeps every message it is sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails after recording the message.
    pub fn failing() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), StoreError> {
        self.messages.lock().await.push(message.to_string());
        if self.fail {
            return Err(StoreError::Message("webhook unreachable".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_records_get_fresh_ids_and_deletes_report_hits() {
        let store = MemoryStore::new();
        let ids = store
            .create_reporting_records(&[
                ReportingPayload::new("eventId1", SourceKind::Boat, ["boatId1"]),
                ReportingPayload::new("eventId2", SourceKind::Individual, ["indivId1"]),
            ])
            .await
            .unwrap();
        assert_eq!(ids, vec!["newId1".to_string(), "newId2".to_string()]);

        let deleted = store
            .delete_reporting_records(&["newId1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, vec!["newId1".to_string()]);
        assert_eq!(store.reporting().await.len(), 1);
        assert_eq!(store.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn limited_create_applies_a_prefix_then_fails() {
        let store = MemoryStore::new();
        store.fail_create_after(1).await;
        let err = store
            .create_reporting_records(&[
                ReportingPayload::new("eventId1", SourceKind::Boat, ["boatId1"]),
                ReportingPayload::new("eventId2", SourceKind::Boat, ["boatId2"]),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.completed_ids(), ["newId1".to_string()]);
        assert_eq!(err.to_string(), "create rejected after 1 records were written");
        assert_eq!(store.reporting().await.len(), 1);
    }

    #[tokio::test]
    async fn injected_fetch_failure_hits_only_that_collection() {
        let store = MemoryStore::new();
        store.fail_fetch("individual").await;
        assert!(store.fetch_boat_sail_records().await.is_ok());
        assert!(store.fetch_individual_sail_records().await.is_err());
        assert!(store.fetch_reporting_records().await.is_ok());
    }

    #[tokio::test]
    async fn failing_notifier_still_records() {
        let notifier = RecordingNotifier::failing();
        assert!(notifier.notify("boom").await.is_err());
        assert_eq!(notifier.messages().await, vec!["boom".to_string()]);
    }
}
