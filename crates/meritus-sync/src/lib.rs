//! Sync orchestration: dedup, cascade writes, run stats, and the scheduler.
//!
//! One [`SyncService`] instance owns one polling target. The two shipped
//! targets (court search API, mirror store) run as independently configured
//! instances of the same component; the job shape is shared, the state is
//! not.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Days, Utc};
use meritus_core::{
    collections, from_row, to_row, CaseEvent, CaseStatus, CaseTask, Client, CourtUpdate,
    TrackedCase, UpdateKind,
};
use meritus_sources::{
    CourtApiSource, FetchContext, MirrorStoreSource, SourceError, TribunalRegistry, UpdateSource,
};
use meritus_store::{
    Filter, HttpClientConfig, HttpFetcher, RestStore, RestStoreConfig, Store, StoreError,
    TokenBucketConfig,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "meritus-sync";

/// Default polling period for the live-sync case.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Operator-visible job health. In-memory only; reset zeroes the counters
/// without touching the running flag or the last-run timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub is_running: bool,
    pub sync_count: u64,
    pub error_count: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            is_running: false,
            sync_count: 0,
            error_count: 0,
            last_run: None,
        }
    }
}

/// Owns the RunStats in process memory. Reads hand out snapshot copies so
/// the operator UI can poll concurrently with an in-flight pass.
#[derive(Debug, Default)]
pub struct StatsTracker {
    inner: StdMutex<RunStats>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called exactly once per completed pass.
    pub fn record_run(&self, success: bool) {
        let mut stats = self.inner.lock().expect("stats mutex poisoned");
        stats.sync_count += 1;
        if !success {
            stats.error_count += 1;
        }
        stats.last_run = Some(Utc::now());
    }

    pub fn set_running(&self, running: bool) {
        self.inner.lock().expect("stats mutex poisoned").is_running = running;
    }

    pub fn snapshot(&self) -> RunStats {
        self.inner.lock().expect("stats mutex poisoned").clone()
    }

    pub fn reset(&self) {
        let mut stats = self.inner.lock().expect("stats mutex poisoned");
        stats.sync_count = 0;
        stats.error_count = 0;
    }
}

/// Content-based duplicate check against the store.
///
/// The match key is the exact triple (owner id, description, date); the
/// external source guarantees no stable record id across calls, so identity
/// has to come from content. The check runs before every write and the
/// runner serializes all dedup/write activity per owner, which is what keeps
/// the read-then-write window race-free.
pub struct Deduplicator {
    store: Arc<dyn Store>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn is_duplicate(
        &self,
        case_id: Uuid,
        update: &CourtUpdate,
    ) -> Result<bool, StoreError> {
        let filter = Filter::new()
            .eq("case_id", case_id.to_string())
            .eq("description", update.description.clone())
            .eq("date", update.date.to_string());
        let existing = self.store.select(collections::CASE_EVENTS, &filter).await?;
        Ok(!existing.is_empty())
    }
}

/// Creates the local entity chain an update implies, in dependency order:
/// client -> case -> event, plus kind-specific side effects.
///
/// Retry policy is reprocess-on-next-pass by construction: nothing records
/// an attempt, only the successfully inserted event row. A record whose
/// cascade failed part-way leaves no event behind, so the next pass sees it
/// as new and re-runs the remaining steps.
pub struct CascadeWriter {
    store: Arc<dyn Store>,
}

impl CascadeWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn persist(
        &self,
        case: &TrackedCase,
        update: &CourtUpdate,
    ) -> Result<(), SyncError> {
        let client_id = self.ensure_client(case, update).await?;
        let case_id = self.ensure_case(case, client_id, update).await?;
        self.insert_event(case_id, update).await?;

        match update.kind {
            UpdateKind::Hearing => self.create_hearing_task(case_id, update).await?,
            UpdateKind::CaseClosed => self.close_case(case_id).await?,
            UpdateKind::Movement | UpdateKind::Ruling => {}
        }
        Ok(())
    }

    /// Resolve or create the owning client. A case that already knows its
    /// client, or an update without a cascade payload, needs no work.
    async fn ensure_client(
        &self,
        case: &TrackedCase,
        update: &CourtUpdate,
    ) -> Result<Option<Uuid>, SyncError> {
        if let Some(existing) = case.client_id {
            return Ok(Some(existing));
        }
        let Some(document) = update.client_document.as_deref() else {
            return Ok(None);
        };

        let found = self
            .store
            .select(collections::CLIENTS, &Filter::new().eq("document", document))
            .await?;
        if let Some(row) = found.first() {
            if let Some(client) = from_row::<Client>(row) {
                return Ok(Some(client.id));
            }
        }

        let client = Client {
            id: Uuid::new_v4(),
            name: update
                .client_name
                .clone()
                .unwrap_or_else(|| "Cliente importado".to_string()),
            document: document.to_string(),
        };
        debug!(client_id = %client.id, "creating client from sync cascade");
        self.store
            .insert(collections::CLIENTS, to_row(&client))
            .await?;
        Ok(Some(client.id))
    }

    /// Resolve or create the case row, keeping the tracked id so dedup and
    /// event ownership stay stable across passes.
    async fn ensure_case(
        &self,
        case: &TrackedCase,
        client_id: Option<Uuid>,
        update: &CourtUpdate,
    ) -> Result<Uuid, SyncError> {
        let found = self
            .store
            .select(
                collections::CASES,
                &Filter::new().eq("id", case.id.to_string()),
            )
            .await?;
        if let Some(row) = found.first() {
            // Existing case learning its client for the first time.
            let row_client = row.get("client_id").and_then(serde_json::Value::as_str);
            if let (None, Some(new_client)) = (row_client, client_id) {
                self.store
                    .update(
                        collections::CASES,
                        &case.id.to_string(),
                        serde_json::json!({ "client_id": new_client.to_string() }),
                    )
                    .await?;
            }
            return Ok(case.id);
        }

        let mut created = case.clone();
        created.client_id = client_id;
        if let Some(title) = &update.case_title {
            created.title = title.clone();
        }
        debug!(case_id = %created.id, "creating case from sync cascade");
        self.store
            .insert(collections::CASES, to_row(&created))
            .await?;
        Ok(case.id)
    }

    async fn insert_event(&self, case_id: Uuid, update: &CourtUpdate) -> Result<(), SyncError> {
        let event = CaseEvent::from_update(case_id, update);
        self.store
            .insert(collections::CASE_EVENTS, to_row(&event))
            .await?;
        Ok(())
    }

    async fn create_hearing_task(
        &self,
        case_id: Uuid,
        update: &CourtUpdate,
    ) -> Result<(), SyncError> {
        let task = CaseTask {
            id: Uuid::new_v4(),
            case_id,
            title: format!("Preparar audiência: {}", update.title),
            due_date: update.date,
            done: false,
            source: update.source.clone(),
        };
        self.store.insert(collections::TASKS, to_row(&task)).await?;
        Ok(())
    }

    async fn close_case(&self, case_id: Uuid) -> Result<(), SyncError> {
        self.store
            .update(
                collections::CASES,
                &case_id.to_string(),
                serde_json::json!({
                    "status": CaseStatus::Closed.as_str(),
                    "active": false
                }),
            )
            .await?;
        Ok(())
    }
}

/// Outcome of one completed pass, for logging and tests.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cases_checked: usize,
    pub updates_seen: usize,
    pub events_created: usize,
    pub duplicates_skipped: usize,
    pub failed_cases: usize,
    pub failed_records: usize,
}

impl PassSummary {
    pub fn succeeded(&self) -> bool {
        self.failed_cases == 0 && self.failed_records == 0
    }
}

#[derive(Debug, Default)]
struct CaseOutcome {
    updates_seen: usize,
    events_created: usize,
    duplicates_skipped: usize,
    failed_records: usize,
}

/// Executes one pass: fetch -> dedup -> cascade-write, case by case, in
/// stable id order, with per-case and per-record failure isolation.
pub struct SyncWorker {
    store: Arc<dyn Store>,
    source: Arc<dyn UpdateSource>,
    dedup: Deduplicator,
    writer: CascadeWriter,
    stats: Arc<StatsTracker>,
    pass_lock: Mutex<()>,
}

impl SyncWorker {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn UpdateSource>) -> Self {
        Self {
            dedup: Deduplicator::new(store.clone()),
            writer: CascadeWriter::new(store.clone()),
            store,
            source,
            stats: Arc::new(StatsTracker::new()),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    /// Coalesced pass entry: if a pass is already in flight the request is
    /// absorbed and `None` is returned. At most one pass runs at a time,
    /// which also serializes every dedup-check/write pair per owner.
    pub async fn run_pass(&self) -> Option<PassSummary> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!(source = self.source.name(), "pass already in flight; request coalesced");
            return None;
        };
        Some(self.run_pass_locked().await)
    }

    async fn run_pass_locked(&self) -> PassSummary {
        let ctx = FetchContext::new();
        let started_at = Utc::now();
        info!(run_id = %ctx.run_id, source = self.source.name(), "sync pass started");

        let mut summary = PassSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: started_at,
            cases_checked: 0,
            updates_seen: 0,
            events_created: 0,
            duplicates_skipped: 0,
            failed_cases: 0,
            failed_records: 0,
        };

        let rows = match self
            .store
            .select(collections::CASES, &Filter::new().eq("active", true))
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(run_id = %ctx.run_id, error = %err, "could not list tracked cases");
                summary.failed_cases = 1;
                summary.finished_at = Utc::now();
                self.stats.record_run(false);
                return summary;
            }
        };

        let mut cases: Vec<TrackedCase> =
            rows.iter().filter_map(TrackedCase::from_store_row).collect();
        // Stable order so repeated runs are easy to reason about.
        cases.sort_by_key(|c| c.id);

        for case in &cases {
            summary.cases_checked += 1;
            match self.sync_case(&ctx, case).await {
                Ok(outcome) => {
                    summary.updates_seen += outcome.updates_seen;
                    summary.events_created += outcome.events_created;
                    summary.duplicates_skipped += outcome.duplicates_skipped;
                    summary.failed_records += outcome.failed_records;
                }
                Err(err) => {
                    warn!(
                        run_id = %ctx.run_id,
                        case_id = %case.id,
                        error = %err,
                        "case sync failed; continuing pass"
                    );
                    summary.failed_cases += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        self.stats.record_run(summary.succeeded());
        info!(
            run_id = %ctx.run_id,
            cases = summary.cases_checked,
            created = summary.events_created,
            duplicates = summary.duplicates_skipped,
            failed_cases = summary.failed_cases,
            failed_records = summary.failed_records,
            "sync pass finished"
        );
        summary
    }

    async fn sync_case(
        &self,
        ctx: &FetchContext,
        case: &TrackedCase,
    ) -> Result<CaseOutcome, SyncError> {
        let updates = self.source.fetch_updates(ctx, case).await?;
        let mut outcome = CaseOutcome {
            updates_seen: updates.len(),
            ..CaseOutcome::default()
        };

        for update in &updates {
            match self.dedup.is_duplicate(case.id, update).await {
                Ok(true) => {
                    outcome.duplicates_skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        run_id = %ctx.run_id,
                        case_id = %case.id,
                        error = %err,
                        "dedup check failed; record left for next pass"
                    );
                    outcome.failed_records += 1;
                    continue;
                }
            }

            if let Err(err) = self.writer.persist(case, update).await {
                // The record self-heals next pass: no event row was
                // written, so it will not dedup away.
                warn!(
                    run_id = %ctx.run_id,
                    case_id = %case.id,
                    error = %err,
                    "cascade write failed; record left for next pass"
                );
                outcome.failed_records += 1;
                continue;
            }
            outcome.events_created += 1;
        }
        Ok(outcome)
    }

    /// Maintenance pass: delete read events of no-longer-open cases beyond
    /// the retention window. Runs on its own, never interleaved with a sync
    /// pass's record-by-record creation.
    pub async fn purge_stale_events(&self, retention_days: u32) -> Result<usize, SyncError> {
        let cutoff = Utc::now().date_naive() - Days::new(u64::from(retention_days));
        let rows = self.store.select(collections::CASES, &Filter::new()).await?;
        let closed: Vec<TrackedCase> = rows
            .iter()
            .filter_map(TrackedCase::from_store_row)
            .filter(|c| !c.status.is_open())
            .collect();

        let mut purged = 0usize;
        for case in &closed {
            let events = self
                .store
                .select(
                    collections::CASE_EVENTS,
                    &Filter::new().eq("case_id", case.id.to_string()),
                )
                .await?;
            for row in &events {
                let Some(event) = from_row::<CaseEvent>(row) else {
                    continue;
                };
                if event.read && event.date < cutoff {
                    self.store
                        .delete(
                            collections::CASE_EVENTS,
                            &Filter::new().eq("id", event.id.to_string()),
                        )
                        .await?;
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!(purged, "purged stale case events");
        }
        Ok(purged)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncServiceOptions {
    pub period: Duration,
}

impl Default for SyncServiceOptions {
    fn default() -> Self {
        Self {
            period: DEFAULT_SYNC_PERIOD,
        }
    }
}

/// The operator-facing sync job: one polling target, one timer, one set of
/// run stats. The five public operations are exactly what the surrounding
/// application's settings screen invokes; none of them return errors;
/// failures are logged and reflected in the stats snapshot only.
///
/// Each instance serializes its own dedup-check/write pairs, but two
/// instances feeding the same local store do not serialize against each
/// other: identical content arriving from both targets inside the same
/// check/write window can land twice. Deployments that dual-feed one store
/// should stagger the two periods, or drive the second target through
/// `run_now` at the end of the first target's pass.
pub struct SyncService {
    worker: Arc<SyncWorker>,
    period: Duration,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn UpdateSource>,
        options: SyncServiceOptions,
    ) -> Self {
        Self {
            worker: Arc::new(SyncWorker::new(store, source)),
            period: options.period,
            scheduler: Mutex::new(None),
        }
    }

    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    /// Arm the fixed-interval timer and perform an immediate first pass.
    /// No-op when already running. A scheduler that cannot be armed is the
    /// one fatal condition: it is logged and surfaced as `is_running ==
    /// false` so the operator UI reflects reality.
    pub async fn start(&self) {
        let mut guard = self.scheduler.lock().await;
        if guard.is_some() {
            debug!("sync service already running");
            return;
        }

        let sched = match JobScheduler::new().await {
            Ok(sched) => sched,
            Err(err) => {
                error!(error = %err, "could not create sync scheduler");
                self.worker.stats.set_running(false);
                return;
            }
        };

        let worker = self.worker.clone();
        let job = match Job::new_repeated_async(self.period, move |_uuid, _lock| {
            let worker = worker.clone();
            Box::pin(async move {
                // A tick landing during an in-flight pass coalesces away.
                worker.run_pass().await;
            })
        }) {
            Ok(job) => job,
            Err(err) => {
                error!(error = %err, "could not create sync job");
                self.worker.stats.set_running(false);
                return;
            }
        };

        if let Err(err) = sched.add(job).await {
            error!(error = %err, "could not arm sync job");
            self.worker.stats.set_running(false);
            return;
        }
        if let Err(err) = sched.start().await {
            error!(error = %err, "could not start sync scheduler");
            self.worker.stats.set_running(false);
            return;
        }

        *guard = Some(sched);
        self.worker.stats.set_running(true);

        let worker = self.worker.clone();
        tokio::spawn(async move {
            worker.run_pass().await;
        });
    }

    /// Cancel the timer. An in-flight pass is not interrupted, but no new
    /// pass begins afterwards.
    pub async fn stop(&self) {
        let mut guard = self.scheduler.lock().await;
        if let Some(mut sched) = guard.take() {
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "sync scheduler shutdown reported an error");
            }
        }
        self.worker.stats.set_running(false);
    }

    /// Out-of-band pass; coalesced with any pass already in flight.
    pub async fn run_now(&self) {
        self.worker.run_pass().await;
    }

    pub fn stats(&self) -> RunStats {
        self.worker.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.worker.stats.reset()
    }

    pub async fn purge_stale_events(&self, retention_days: u32) -> Result<usize, SyncError> {
        self.worker.purge_stale_events(retention_days).await
    }
}

/// Environment-shaped configuration, one value per knob the operator tunes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_url: String,
    pub store_key: String,
    pub interval_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Court-API request budget in requests per minute; unset means only the
    /// concurrency bounds apply.
    pub court_rpm: Option<u32>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_url: std::env::var("MERITUS_STORE_URL")
                .unwrap_or_else(|_| "http://localhost:54321/rest/v1".to_string()),
            store_key: std::env::var("MERITUS_STORE_KEY").unwrap_or_default(),
            interval_secs: std::env::var("MERITUS_SYNC_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            http_timeout_secs: std::env::var("MERITUS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            user_agent: std::env::var("MERITUS_USER_AGENT")
                .unwrap_or_else(|_| "meritus-sync/0.1".to_string()),
            court_rpm: std::env::var("MERITUS_COURT_RPM")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|rpm| *rpm > 0),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Translate the per-minute budget into a token bucket: burst up to the
    /// budget, then one token per even slice of the minute.
    pub fn court_rate_limit(&self) -> Option<TokenBucketConfig> {
        self.court_rpm.map(|rpm| TokenBucketConfig {
            capacity: rpm,
            refill_every: Duration::from_millis(60_000 / u64::from(rpm)),
        })
    }
}

/// Wire a court-API sync service against the hosted store.
pub fn court_api_service(config: &SyncConfig) -> anyhow::Result<SyncService> {
    let store: Arc<dyn Store> = Arc::new(RestStore::new(RestStoreConfig {
        base_url: config.store_url.clone(),
        api_key: config.store_key.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?);
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config.court_rate_limit(),
        ..Default::default()
    })?);
    let source: Arc<dyn UpdateSource> = Arc::new(CourtApiSource::new(
        http,
        TribunalRegistry::labor_courts(),
    ));
    Ok(SyncService::new(
        store,
        source,
        SyncServiceOptions {
            period: config.period(),
        },
    ))
}

/// Wire a mirror-store sync service: same job shape, different target.
pub fn mirror_service(
    config: &SyncConfig,
    mirror: Arc<dyn Store>,
    collection: &str,
) -> anyhow::Result<SyncService> {
    let store: Arc<dyn Store> = Arc::new(RestStore::new(RestStoreConfig {
        base_url: config.store_url.clone(),
        api_key: config.store_key.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?);
    let source: Arc<dyn UpdateSource> = Arc::new(MirrorStoreSource::new(mirror, collection));
    Ok(SyncService::new(
        store,
        source,
        SyncServiceOptions {
            period: config.period(),
        },
    ))
}
