//! Collaborator contracts for the sync engine and their store-backed implementations.

use async_trait::async_trait;
use sailrep_core::{LinkSet, ReportingPayload, ReportingRecord, SourceKind, SourceRecord};
use sailrep_storage::{ClientError, Fields, StoreClient, StoreRecord, WebhookClient};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

mod memory;

pub use memory::{MemoryStore, RecordingNotifier, StoreCall};

pub const CRATE_NAME: &str = "sailrep-adapters";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Client(ClientError),
    /// A batch write failed after some of its records were already applied.
    #[error("{source} after {} records were written", .completed.len())]
    Partial {
        completed: Vec<String>,
        source: Box<StoreError>,
    },
    #[error("malformed record {id} in {table}: {reason}")]
    MalformedRecord {
        table: String,
        id: String,
        reason: String,
    },
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    /// Ids a failed batch write applied before it stopped.
    pub fn completed_ids(&self) -> &[String] {
        match self {
            StoreError::Partial { completed, .. } => completed,
            _ => &[],
        }
    }
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Partial { completed, source } => StoreError::Partial {
                completed,
                source: Box::new(StoreError::Client(*source)),
            },
            other => StoreError::Client(other),
        }
    }
}

/// Read access to the two sail source collections.
#[async_trait]
pub trait SailSource: Send + Sync {
    async fn fetch_boat_sail_records(&self) -> Result<Vec<SourceRecord>, StoreError>;

    async fn fetch_individual_sail_records(&self) -> Result<Vec<SourceRecord>, StoreError>;
}

/// The derived reporting collection.
#[async_trait]
pub trait ReportingStore: Send + Sync {
    async fn fetch_reporting_records(&self) -> Result<Vec<ReportingRecord>, StoreError>;

    /// Returns the ids assigned to the new records, in payload order.
    async fn create_reporting_records(
        &self,
        payloads: &[ReportingPayload],
    ) -> Result<Vec<String>, StoreError>;

    async fn delete_reporting_records(&self, ids: &[String]) -> Result<Vec<String>, StoreError>;
}

/// Best-effort side channel for anomalies and run summaries.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), StoreError>;
}

/// Table and field names of the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLayout {
    pub boat_sails_table: String,
    pub individual_sails_table: String,
    pub reporting_table: String,
    pub event_id_field: String,
    pub boat_links_field: String,
    pub individual_links_field: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            boat_sails_table: "By Boat Sails".to_string(),
            individual_sails_table: "By Individual Sails".to_string(),
            reporting_table: "Reporting".to_string(),
            event_id_field: "EventId".to_string(),
            boat_links_field: "ByBoatSails".to_string(),
            individual_links_field: "ByIndividualSails".to_string(),
        }
    }
}

impl TableLayout {
    pub fn source_table(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Boat => &self.boat_sails_table,
            SourceKind::Individual => &self.individual_sails_table,
        }
    }

    pub fn links_field(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Boat => &self.boat_links_field,
            SourceKind::Individual => &self.individual_links_field,
        }
    }

    pub fn source_record(&self, record: StoreRecord) -> SourceRecord {
        let event_id = record.fields.get(&self.event_id_field).and_then(scalar_text);
        SourceRecord {
            id: record.id,
            event_id,
        }
    }

    pub fn reporting_record(&self, record: StoreRecord) -> Result<ReportingRecord, StoreError> {
        let event_id = record.fields.get(&self.event_id_field).and_then(scalar_text);
        let boat_sail_links = self.link_set(&record, SourceKind::Boat)?;
        let individual_sail_links = self.link_set(&record, SourceKind::Individual)?;
        Ok(ReportingRecord {
            id: record.id,
            event_id,
            boat_sail_links,
            individual_sail_links,
        })
    }

    fn link_set(&self, record: &StoreRecord, kind: SourceKind) -> Result<LinkSet, StoreError> {
        let field = self.links_field(kind);
        let malformed = |reason: String| StoreError::MalformedRecord {
            table: self.reporting_table.clone(),
            id: record.id.clone(),
            reason,
        };
        match record.fields.get(field) {
            None | Some(JsonValue::Null) => Ok(LinkSet::new()),
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| malformed(format!("{field} holds non-text link {item}")))
                })
                .collect(),
            Some(other) => Err(malformed(format!("{field} is not a list: {other}"))),
        }
    }

    pub fn payload_fields(&self, payload: &ReportingPayload) -> Fields {
        let mut fields = Fields::new();
        fields.insert(
            self.event_id_field.clone(),
            JsonValue::String(payload.event_id.clone()),
        );
        fields.insert(
            self.links_field(payload.kind).to_string(),
            JsonValue::Array(
                payload
                    .record_ids
                    .iter()
                    .cloned()
                    .map(JsonValue::String)
                    .collect(),
            ),
        );
        fields
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Sources and reporting table backed by the REST record store.
#[derive(Debug)]
pub struct AirtableStore {
    client: StoreClient,
    layout: TableLayout,
}

impl AirtableStore {
    pub fn new(client: StoreClient, layout: TableLayout) -> Self {
        Self { client, layout }
    }

    async fn fetch_source(&self, kind: SourceKind) -> Result<Vec<SourceRecord>, StoreError> {
        let table = self.layout.source_table(kind);
        let records = self
            .client
            .list_records(table, &[self.layout.event_id_field.as_str()])
            .await?;
        info!(kind = %kind, table, count = records.len(), "fetched sail records");
        Ok(records
            .into_iter()
            .map(|r| self.layout.source_record(r))
            .collect())
    }
}

#[async_trait]
impl SailSource for AirtableStore {
    async fn fetch_boat_sail_records(&self) -> Result<Vec<SourceRecord>, StoreError> {
        self.fetch_source(SourceKind::Boat).await
    }

    async fn fetch_individual_sail_records(&self) -> Result<Vec<SourceRecord>, StoreError> {
        self.fetch_source(SourceKind::Individual).await
    }
}

#[async_trait]
impl ReportingStore for AirtableStore {
    async fn fetch_reporting_records(&self) -> Result<Vec<ReportingRecord>, StoreError> {
        let layout = &self.layout;
        let records = self
            .client
            .list_records(
                &layout.reporting_table,
                &[
                    layout.event_id_field.as_str(),
                    layout.boat_links_field.as_str(),
                    layout.individual_links_field.as_str(),
                ],
            )
            .await?;
        info!(table = %layout.reporting_table, count = records.len(), "fetched reporting records");
        records
            .into_iter()
            .map(|r| layout.reporting_record(r))
            .collect()
    }

    async fn create_reporting_records(
        &self,
        payloads: &[ReportingPayload],
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<Fields> = payloads
            .iter()
            .map(|p| self.layout.payload_fields(p))
            .collect();
        let created = self
            .client
            .create_records(&self.layout.reporting_table, &rows)
            .await?;
        Ok(created.into_iter().map(|r| r.id).collect())
    }

    async fn delete_reporting_records(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        Ok(self
            .client
            .delete_records(&self.layout.reporting_table, ids)
            .await?)
    }
}

/// Sends notifications to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: WebhookClient,
}

impl WebhookNotifier {
    pub fn new(client: WebhookClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<(), StoreError> {
        Ok(self.client.post_text(message).await?)
    }
}

/// Notifier used when no webhook is configured; messages only reach the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), StoreError> {
        info!(target: "sailrep::notify", "{message}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_record(id: &str, fields: JsonValue) -> StoreRecord {
        serde_json::from_value(json!({ "id": id, "fields": fields })).unwrap()
    }

    #[test]
    fn source_record_reads_event_id() {
        let layout = TableLayout::default();
        let with_event = layout.source_record(store_record("boatId1", json!({"EventId": "eventId1"})));
        let without = layout.source_record(store_record("boatId2", json!({})));
        assert_eq!(with_event.event_id.as_deref(), Some("eventId1"));
        assert_eq!(without.event_id, None);
    }

    #[test]
    fn reporting_record_collects_link_sets() {
        let layout = TableLayout::default();
        let record = layout
            .reporting_record(store_record(
                "reportingId3",
                json!({"EventId": "eventId3", "ByIndividualSails": ["indivId3", "indivId2"]}),
            ))
            .unwrap();
        assert_eq!(record.event_id.as_deref(), Some("eventId3"));
        assert!(record.boat_sail_links.is_empty());
        assert_eq!(
            record.individual_sail_links.iter().collect::<Vec<_>>(),
            vec!["indivId2", "indivId3"]
        );

        let unlinked = layout
            .reporting_record(store_record("reportingId1", json!({})))
            .unwrap();
        assert!(!unlinked.has_links());
        assert_eq!(unlinked.event_id, None);
    }

    #[test]
    fn reporting_record_rejects_non_list_links() {
        let layout = TableLayout::default();
        let err = layout
            .reporting_record(store_record(
                "reportingId1",
                json!({"EventId": "eventId1", "ByBoatSails": "boatId1"}),
            ))
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedRecord { ref id, .. } if id == "reportingId1"));
    }

    #[test]
    fn payload_fields_populate_one_link_kind() {
        let layout = TableLayout::default();
        let payload = ReportingPayload::new("eventId4", SourceKind::Individual, ["indivId4", "indivId3"]);
        let fields = layout.payload_fields(&payload);
        assert_eq!(
            JsonValue::Object(fields),
            json!({"EventId": "eventId4", "ByIndividualSails": ["indivId3", "indivId4"]})
        );
    }

    #[test]
    fn layout_overrides_are_partial() {
        let layout: TableLayout = serde_json::from_value(json!({"reporting_table": "Sail Report"})).unwrap();
        assert_eq!(layout.reporting_table, "Sail Report");
        assert_eq!(layout.boat_sails_table, "By Boat Sails");
    }

    #[test]
    fn partial_client_writes_keep_their_ids() {
        let err = StoreError::from(ClientError::Partial {
            completed: vec!["newId1".to_string()],
            source: Box::new(ClientError::HttpStatus {
                status: 500,
                url: "https://api.airtable.com/v0/appBase/Reporting".to_string(),
                body: String::new(),
            }),
        });
        assert_eq!(err.completed_ids(), ["newId1".to_string()]);
        assert!(matches!(
            err,
            StoreError::Partial { ref source, .. } if matches!(**source, StoreError::Client(_))
        ));

        let plain = StoreError::from(ClientError::InvalidUrl("x".to_string()));
        assert!(plain.completed_ids().is_empty());
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        assert!(LogNotifier.notify("hello").await.is_ok());
    }
}
