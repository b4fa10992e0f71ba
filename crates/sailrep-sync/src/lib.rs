//! Reporting table sync: fetch, reconcile, apply.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sailrep_adapters::{
    AirtableStore, LogNotifier, Notifier, ReportingStore, SailSource, StoreError, TableLayout,
    WebhookNotifier,
};
use sailrep_core::{ReportingRecord, SourceRecord};
use sailrep_storage::{StoreClient, StoreClientConfig, TokenBucketConfig, WebhookClient, DEFAULT_API_URL};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod reconcile;

pub use reconcile::{
    aggregate_sources, find_duplicate_event_ids, reconcile, Anomaly, AnomalyKind, EventMap,
    ReconcilePlan, ReportingSnapshot, SourceMaps,
};

pub const CRATE_NAME: &str = "sailrep-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_key: String,
    pub base_id: String,
    pub http_timeout_secs: u64,
    pub requests_per_second: u32,
    pub user_agent: String,
    pub webhook_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub reports_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_url: non_empty("AIRTABLE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key: non_empty("AIRTABLE_API_KEY").unwrap_or_default(),
            base_id: non_empty("AIRTABLE_BASE_ID").unwrap_or_default(),
            http_timeout_secs: non_empty("SAILREP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            requests_per_second: non_empty("SAILREP_REQUESTS_PER_SECOND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            user_agent: non_empty("SAILREP_USER_AGENT")
                .unwrap_or_else(|| "sailrep/0.1".to_string()),
            webhook_url: non_empty("SLACK_WEBHOOK_URL"),
            scheduler_enabled: non_empty("SAILREP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: non_empty("SYNC_CRON").unwrap_or_else(|| "0 0 * * * *".to_string()),
            reports_dir: non_empty("SAILREP_REPORTS_DIR").map(PathBuf::from),
            workspace_root: non_empty("SAILREP_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Table layout from `tables.yaml` in the workspace root, or the defaults when absent.
pub fn load_table_layout(workspace_root: &Path) -> Result<TableLayout> {
    let path = workspace_root.join("tables.yaml");
    if !path.exists() {
        return Ok(TableLayout::default());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Collaborators for one sync run. Passed in explicitly so tests can swap in fakes.
#[derive(Clone)]
pub struct SyncContext {
    pub sources: Arc<dyn SailSource>,
    pub reporting: Arc<dyn ReportingStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl SyncContext {
    pub fn new(
        sources: Arc<dyn SailSource>,
        reporting: Arc<dyn ReportingStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            sources,
            reporting,
            notifier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => f.write_str("creating"),
            MutationKind::Delete => f.write_str("deleting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{operation} {records} reporting records failed: {message}")]
pub struct BatchFailure {
    pub operation: MutationKind,
    pub records: usize,
    pub message: String,
}

impl BatchFailure {
    /// `records` counts only the rows the failed batch left unapplied.
    fn new(operation: MutationKind, attempted: usize, err: &StoreError) -> Self {
        Self {
            operation,
            records: attempted.saturating_sub(err.completed_ids().len()),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching {collection} failed: {source}")]
    Fetch {
        collection: &'static str,
        source: StoreError,
    },
    #[error("{} reporting mutation batch(es) failed", .failures.len())]
    Mutation {
        failures: Vec<BatchFailure>,
        summary: Box<SyncRunSummary>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub boat_records: usize,
    pub individual_records: usize,
    pub reporting_records: usize,
    pub dropped_without_event: usize,
    pub anomalies: usize,
    pub retained: usize,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub failed_batches: usize,
}

impl SyncRunSummary {
    pub fn has_changes(&self) -> bool {
        !self.created.is_empty() || !self.deleted.is_empty()
    }

    pub fn message(&self) -> String {
        format!(
            "reporting table sync: created {}, deleted {}, unchanged {}",
            self.created.len(),
            self.deleted.len(),
            self.retained
        )
    }
}

/// Everything a run would do, computed without touching the reporting table.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPlan {
    pub boat_records: usize,
    pub individual_records: usize,
    pub reporting_records: usize,
    pub dropped_without_event: usize,
    pub plan: ReconcilePlan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<BatchFailure>,
}

struct Fetched {
    boat: Vec<SourceRecord>,
    individual: Vec<SourceRecord>,
    reporting: Vec<ReportingRecord>,
}

fn fetch_error(collection: &'static str) -> impl FnOnce(StoreError) -> SyncError {
    move |source| SyncError::Fetch { collection, source }
}

async fn fetch_sources(ctx: &SyncContext) -> Result<(Vec<SourceRecord>, Vec<SourceRecord>), SyncError> {
    let boat = async {
        ctx.sources
            .fetch_boat_sail_records()
            .await
            .map_err(fetch_error("boat sails"))
    };
    let individual = async {
        ctx.sources
            .fetch_individual_sail_records()
            .await
            .map_err(fetch_error("individual sails"))
    };
    tokio::try_join!(boat, individual)
}

async fn fetch_all(ctx: &SyncContext) -> Result<Fetched, SyncError> {
    let reporting = async {
        ctx.reporting
            .fetch_reporting_records()
            .await
            .map_err(fetch_error("reporting records"))
    };
    let ((boat, individual), reporting) = tokio::try_join!(fetch_sources(ctx), reporting)?;
    Ok(Fetched {
        boat,
        individual,
        reporting,
    })
}

fn build_plan(fetched: Fetched) -> SyncPlan {
    let sources = aggregate_sources(&fetched.boat, &fetched.individual);
    let snapshot = ReportingSnapshot::partition(fetched.reporting);
    SyncPlan {
        boat_records: fetched.boat.len(),
        individual_records: fetched.individual.len(),
        reporting_records: snapshot.total(),
        dropped_without_event: sources.dropped_without_event,
        plan: reconcile(&sources, &snapshot),
    }
}

/// Delivers `message`, logging instead of failing when the channel is down.
pub async fn notify_best_effort(notifier: &dyn Notifier, message: &str) {
    if let Err(err) = notifier.notify(message).await {
        warn!(error = %err, "notification failed");
    }
}

/// Issues the plan's create batch and delete batch. Each runs even if the other fails.
pub async fn apply_plan(
    reporting: &dyn ReportingStore,
    notifier: &dyn Notifier,
    plan: &ReconcilePlan,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    if !plan.to_create.is_empty() {
        match reporting.create_reporting_records(&plan.to_create).await {
            Ok(ids) => {
                info!(count = ids.len(), "created reporting records");
                outcome.created = ids;
            }
            Err(err) => {
                outcome.created = err.completed_ids().to_vec();
                let failure = BatchFailure::new(MutationKind::Create, plan.to_create.len(), &err);
                warn!(error = %failure, applied = outcome.created.len(), "create batch failed");
                notify_best_effort(notifier, &failure.to_string()).await;
                outcome.failures.push(failure);
            }
        }
    }

    if !plan.to_delete.is_empty() {
        match reporting.delete_reporting_records(&plan.to_delete).await {
            Ok(ids) => {
                info!(count = ids.len(), "deleted reporting records");
                outcome.deleted = ids;
            }
            Err(err) => {
                outcome.deleted = err.completed_ids().to_vec();
                let failure = BatchFailure::new(MutationKind::Delete, plan.to_delete.len(), &err);
                warn!(error = %failure, applied = outcome.deleted.len(), "delete batch failed");
                notify_best_effort(notifier, &failure.to_string()).await;
                outcome.failures.push(failure);
            }
        }
    }

    outcome
}

/// Reads sources and reporting rows and computes the plan without mutating anything.
pub async fn plan_reporting_sync(ctx: &SyncContext) -> Result<SyncPlan, SyncError> {
    Ok(build_plan(fetch_all(ctx).await?))
}

/// One full reconciliation of the reporting table.
pub async fn sync_reporting_table(ctx: &SyncContext) -> Result<SyncRunSummary, SyncError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    async move {
        info!("reporting sync started");
        let planned = match fetch_all(ctx).await {
            Ok(fetched) => build_plan(fetched),
            Err(err) => {
                error!(error = %err, "reporting sync aborted before planning");
                notify_best_effort(
                    ctx.notifier.as_ref(),
                    &format!("reporting table sync failed: {err}"),
                )
                .await;
                return Err(err);
            }
        };
        let plan = &planned.plan;

        if !plan.anomalies.is_empty() {
            let ids: Vec<&str> = plan.anomalies.iter().map(|a| a.record_id.as_str()).collect();
            warn!(count = ids.len(), "anomalous reporting records found");
            notify_best_effort(
                ctx.notifier.as_ref(),
                &format!("removing anomalous reporting records: {}", json_list(&ids)),
            )
            .await;
        }

        let outcome = apply_plan(ctx.reporting.as_ref(), ctx.notifier.as_ref(), plan).await;
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            boat_records: planned.boat_records,
            individual_records: planned.individual_records,
            reporting_records: planned.reporting_records,
            dropped_without_event: planned.dropped_without_event,
            anomalies: plan.anomalies.len(),
            retained: plan.retained.len(),
            created: outcome.created,
            deleted: outcome.deleted,
            failed_batches: outcome.failures.len(),
        };
        info!(
            created = summary.created.len(),
            deleted = summary.deleted.len(),
            retained = summary.retained,
            dropped_without_event = summary.dropped_without_event,
            "reporting sync finished"
        );

        if summary.has_changes() {
            notify_best_effort(ctx.notifier.as_ref(), &summary.message()).await;
        }
        if !outcome.failures.is_empty() {
            return Err(SyncError::Mutation {
                failures: outcome.failures,
                summary: Box::new(summary),
            });
        }
        Ok(summary)
    }
    .instrument(info_span!("sync_run", %run_id))
    .await
}

/// Reports event ids shared by several boat sails or by a boat and an individual sail.
pub async fn check_duplicate_event_ids(ctx: &SyncContext) -> Result<Vec<String>, SyncError> {
    let (boat, individual) = fetch_sources(ctx).await?;
    let duplicates = find_duplicate_event_ids(&boat, &individual);
    if !duplicates.is_empty() {
        warn!(count = duplicates.len(), "duplicate event ids in sail sources");
        notify_best_effort(
            ctx.notifier.as_ref(),
            &format!("duplicate eventIds: {}", json_list(&duplicates)),
        )
        .await;
    }
    Ok(duplicates)
}

fn json_list<T: Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| format!("{} items", items.len()))
}

/// Runs syncs one at a time against a fixed set of collaborators.
pub struct SyncEngine {
    ctx: SyncContext,
    reports_dir: Option<PathBuf>,
    run_guard: Mutex<()>,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            reports_dir: None,
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: Option<PathBuf>) -> Self {
        self.reports_dir = reports_dir;
        self
    }

    /// Runs one sync, waiting for any run already in progress on this engine.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let _guard = self.run_guard.lock().await;
        let result = sync_reporting_table(&self.ctx).await;

        let summary = match &result {
            Ok(summary) => Some(summary),
            Err(SyncError::Mutation { summary, .. }) => Some(&**summary),
            Err(SyncError::Fetch { .. }) => None,
        };
        if let (Some(dir), Some(summary)) = (&self.reports_dir, summary) {
            if let Err(err) = write_run_report(dir, summary).await {
                warn!(error = %err, "writing run report failed");
            }
        }
        result
    }

    pub async fn plan(&self) -> Result<SyncPlan, SyncError> {
        let _guard = self.run_guard.lock().await;
        plan_reporting_sync(&self.ctx).await
    }

    pub async fn check_duplicates(&self) -> Result<Vec<String>, SyncError> {
        check_duplicate_event_ids(&self.ctx).await
    }
}

/// Builds the engine against the REST record store described by `config`.
pub fn engine_from_config(config: &SyncConfig) -> Result<SyncEngine> {
    if config.api_key.is_empty() {
        anyhow::bail!("AIRTABLE_API_KEY is not set");
    }
    if config.base_id.is_empty() {
        anyhow::bail!("AIRTABLE_BASE_ID is not set");
    }

    let layout = load_table_layout(&config.workspace_root)?;
    let timeout = Duration::from_secs(config.http_timeout_secs);
    let client = StoreClient::new(StoreClientConfig {
        api_url: config.api_url.clone(),
        base_id: config.base_id.clone(),
        api_key: config.api_key.clone(),
        timeout,
        user_agent: Some(config.user_agent.clone()),
        rate_limit: Some(TokenBucketConfig::per_second(config.requests_per_second)),
    })?;
    let store = Arc::new(AirtableStore::new(client, layout));

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(WebhookClient::new(url, timeout)?)),
        None => Arc::new(LogNotifier),
    };

    let ctx = SyncContext::new(store.clone(), store, notifier);
    Ok(SyncEngine::new(ctx).with_reports_dir(config.reports_dir.clone()))
}

/// Cron-driven runs of `engine`. Overlapping ticks queue behind the engine's run guard.
pub async fn build_scheduler(engine: Arc<SyncEngine>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            match engine.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync complete"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Writes `<reports_dir>/<run_id>/sync_summary.json` and `sync_brief.md`.
pub async fn write_run_report(reports_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(run_dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;

    let brief = format!(
        "# Reporting Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Boat sails: {}\n- Individual sails: {}\n- Sails without event: {}\n- Reporting rows before: {}\n- Unchanged: {}\n- Created: {}\n- Deleted: {}\n- Anomalies: {}\n- Failed batches: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.boat_records,
        summary.individual_records,
        summary.dropped_without_event,
        summary.reporting_records,
        summary.retained,
        summary.created.len(),
        summary.deleted.len(),
        summary.anomalies,
        summary.failed_batches,
    );
    fs::write(run_dir.join("sync_brief.md"), brief)
        .await
        .context("writing sync_brief.md")?;

    Ok(run_dir)
}
