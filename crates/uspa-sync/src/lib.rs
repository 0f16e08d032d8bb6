//! Vacancy completion, canonical ordering and the checkpointed scrape pipeline.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uspa_adapters::{
    parse_payload, AdapterError, CommandSourceFactory, CommandTrigger, DownloadWait, FetchError,
    FetchOutcome, FixtureSourceFactory, HttpSourceFactory, RecordSource, SourceFactory, WorkerSlot,
};
use uspa_core::{
    default_events, default_locations, default_statuses, normalize_weight_class, query_space,
    weight_class_sort_value, CompletedRecord, DomainReference, Lift, Query, RawRecordRow,
};
use uspa_storage::{
    read_checkpoint, read_dataset, write_atomically, Accumulator, AccumulatorPaths, ArtifactKind,
    ArtifactStore, HttpClientConfig, HttpFetcher, OpenMode,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "uspa-sync";

pub const SCOPE_FILE: &str = "scope.yaml";
pub const DEFAULT_RECORDS_URL: &str = "https://records.uspa.net/records.php";


type PresentKey = (String, Lift, String);

fn present_key(division: &str, lift: &Lift, weight_class: &str) -> PresentKey {
    (
        division.trim().to_uppercase(),
        lift.clone(),
        normalize_weight_class(weight_class).to_ascii_lowercase(),
    )
}

/// Reference divisions followed by any division seen in the data but unknown
/// to the reference, in first-seen order. Matching is case-insensitive.
pub fn division_universe(reference: &DomainReference, real: &[CompletedRecord]) -> Vec<String> {
    let mut divisions = reference.divisions.clone();
    let mut seen: HashSet<String> = divisions.iter().map(|d| d.to_uppercase()).collect();
    for division in real.iter().filter_map(|r| r.division.as_deref()) {
        let division = division.trim();
        if !division.is_empty() && seen.insert(division.to_uppercase()) {
            divisions.push(division.to_string());
        }
    }
    divisions
}

/// Expand the real rows of one query so every (division, lift, weight class)
/// combination of the reference universe is represented.
///
/// Real rows come first and are never altered beyond weight-class
/// normalization; a vacancy is appended for each combination with no real row.
pub fn complete_query(
    query: &Query,
    rows: Vec<RawRecordRow>,
    reference: &DomainReference,
) -> Vec<CompletedRecord> {
    let lifts = Lift::for_event(&query.event);
    let real: Vec<CompletedRecord> = rows
        .into_iter()
        .map(|row| CompletedRecord::real(query, row))
        .collect();

    let present: HashSet<PresentKey> = real
        .iter()
        .filter(|r| r.has_record)
        .filter_map(|r| {
            Some(present_key(
                r.division.as_deref()?,
                r.lift.as_ref()?,
                r.weight_class.as_deref()?,
            ))
        })
        .collect();

    let divisions = division_universe(reference, &real);
    let mut out = real;
    for division in &divisions {
        let classes = reference.weight_classes_for(division);
        for lift in &lifts {
            for weight_class in &classes {
                if !present.contains(&present_key(division, lift, weight_class)) {
                    out.push(CompletedRecord::vacancy(
                        query,
                        division,
                        weight_class,
                        lift.clone(),
                    ));
                }
            }
        }
    }
    out
}

/// Division, then kg value ("140kg" < "140+kg"), then lift precedence.
pub fn canonical_cmp(a: &CompletedRecord, b: &CompletedRecord) -> Ordering {
    a.division
        .cmp(&b.division)
        .then_with(|| weight_value(a).total_cmp(&weight_value(b)))
        .then_with(|| lift_rank(a).cmp(&lift_rank(b)))
}

fn weight_value(record: &CompletedRecord) -> f64 {
    record
        .weight_class
        .as_deref()
        .map(weight_class_sort_value)
        .unwrap_or(f64::INFINITY)
}

fn lift_rank(record: &CompletedRecord) -> u8 {
    record.lift.as_ref().map(Lift::precedence).unwrap_or(u8::MAX)
}

pub fn canonical_sort(rows: &mut [CompletedRecord]) {
    rows.sort_by(canonical_cmp);
}

pub fn complete_and_order(
    query: &Query,
    rows: Vec<RawRecordRow>,
    reference: &DomainReference,
) -> Vec<CompletedRecord> {
    let mut completed = complete_query(query, rows, reference);
    canonical_sort(&mut completed);
    completed
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Fixtures,
    Http,
    Command,
}

impl SourceKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixtures" | "fixture" => Some(SourceKind::Fixtures),
            "http" => Some(SourceKind::Http),
            "command" | "browser" => Some(SourceKind::Command),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    TreatAsNoData,
    Retry { attempts: u32 },
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Retry { attempts: 1 }
    }
}

impl TimeoutPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw == "no-data" {
            return Some(TimeoutPolicy::TreatAsNoData);
        }
        let attempts = raw.strip_prefix("retry:")?.trim().parse().ok()?;
        Some(TimeoutPolicy::Retry { attempts })
    }

    fn allows_retry(self, timeouts_so_far: u32) -> bool {
        match self {
            TimeoutPolicy::TreatAsNoData => false,
            TimeoutPolicy::Retry { attempts } => timeouts_so_far <= attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub source: SourceKind,
    pub fixtures_dir: PathBuf,
    pub records_url: String,
    pub downloader_cmd: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub timeout_policy: TimeoutPolicy,
    pub keep_raw_payloads: bool,
    pub download_wait: DownloadWait,
    pub handle_interrupts: bool,
    /// Stop after this many queries; the checkpoint is kept for the next run.
    pub max_queries: Option<usize>,
}

impl SyncConfig {
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("data"),
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            fixtures_dir: root.join("fixtures"),
            workspace_root: root,
            source: SourceKind::Fixtures,
            records_url: DEFAULT_RECORDS_URL.to_string(),
            downloader_cmd: None,
            user_agent: "uspa-records-bot/0.1".to_string(),
            http_timeout_secs: 20,
            timeout_policy: TimeoutPolicy::default(),
            keep_raw_payloads: false,
            download_wait: DownloadWait::default(),
            handle_interrupts: false,
            max_queries: None,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("USPA_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::rooted_at(root);
        let env_path = |key: &str, fallback: &PathBuf| {
            std::env::var(key)
                .map(PathBuf::from)
                .unwrap_or_else(|_| fallback.clone())
        };

        Self {
            data_dir: env_path("USPA_DATA_DIR", &defaults.data_dir),
            artifacts_dir: env_path("USPA_ARTIFACTS_DIR", &defaults.artifacts_dir),
            reports_dir: env_path("USPA_REPORTS_DIR", &defaults.reports_dir),
            fixtures_dir: env_path("USPA_FIXTURES_DIR", &defaults.fixtures_dir),
            source: std::env::var("USPA_SOURCE")
                .ok()
                .and_then(|v| SourceKind::parse(&v))
                .unwrap_or(defaults.source),
            records_url: std::env::var("USPA_RECORDS_URL").unwrap_or(defaults.records_url),
            downloader_cmd: std::env::var("USPA_DOWNLOADER_CMD").ok(),
            user_agent: std::env::var("USPA_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("USPA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            timeout_policy: std::env::var("USPA_DOWNLOAD_TIMEOUT_POLICY")
                .ok()
                .and_then(|v| TimeoutPolicy::parse(&v))
                .unwrap_or(defaults.timeout_policy),
            keep_raw_payloads: std::env::var("USPA_KEEP_RAW_PAYLOADS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            handle_interrupts: true,
            ..defaults
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
    pub locations: Vec<String>,
    pub statuses: Vec<String>,
    pub events: Vec<String>,
    pub worker_count: usize,
    pub batch_size: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            locations: default_locations(),
            statuses: default_statuses(),
            events: default_events(),
            worker_count: 4,
            batch_size: 500,
        }
    }
}

impl ScopeConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let scope: ScopeConfig = serde_yaml::from_str(text).context("parsing scope config")?;
        scope.validate()?;
        Ok(scope)
    }

    /// `<workspace_root>/scope.yaml`, or the full query space when absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(SCOPE_FILE);
        match fs::read_to_string(&path).await {
            Ok(text) => {
                Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_dimension("locations", &self.locations, &default_locations())?;
        check_dimension("statuses", &self.statuses, &default_statuses())?;
        check_dimension("events", &self.events, &default_events())?;
        if self.worker_count == 0 {
            bail!("worker_count must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        Ok(())
    }

    pub fn queries(&self) -> Vec<Query> {
        query_space(&self.locations, &self.statuses, &self.events)
    }
}

fn check_dimension(name: &str, values: &[String], known: &[String]) -> Result<()> {
    if values.is_empty() {
        bail!("scope {name} must not be empty");
    }
    let mut seen = HashSet::new();
    for value in values {
        if !known.contains(value) {
            bail!("unknown {name} entry {value:?}");
        }
        if !seen.insert(value) {
            bail!("duplicate {name} entry {value:?}");
        }
    }
    Ok(())
}

pub fn source_factory_from_config(
    config: &SyncConfig,
    scope: &ScopeConfig,
) -> Result<Arc<dyn SourceFactory>> {
    let factory: Arc<dyn SourceFactory> = match config.source {
        SourceKind::Fixtures => Arc::new(FixtureSourceFactory {
            root: config.fixtures_dir.clone(),
        }),
        SourceKind::Http => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                concurrency: scope.worker_count,
                ..Default::default()
            })?;
            Arc::new(HttpSourceFactory {
                http: Arc::new(http),
                base_url: config.records_url.clone(),
            })
        }
        SourceKind::Command => {
            let command = config
                .downloader_cmd
                .as_deref()
                .context("USPA_DOWNLOADER_CMD must be set for the command source")?;
            let trigger = CommandTrigger::from_command_line(
                command,
                config.records_url.clone(),
                Duration::from_secs(config.http_timeout_secs.max(1) * 3),
            )?;
            Arc::new(CommandSourceFactory {
                trigger,
                wait: config.download_wait,
            })
        }
    };
    Ok(factory)
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryDisposition {
    Records { real: usize },
    NoData,
    TimedOut { attempts: u32 },
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub struct ProcessedQuery {
    pub query: Query,
    pub disposition: QueryDisposition,
    pub rows: Vec<CompletedRecord>,
    pub dropped_lines: usize,
    pub retried_downloads: u32,
}

pub struct WorkerContext {
    pub slot: WorkerSlot,
    source: Box<dyn RecordSource>,
}

impl WorkerContext {
    pub fn new(slot: WorkerSlot, source: Box<dyn RecordSource>) -> Self {
        Self { slot, source }
    }

    pub async fn close(&mut self) {
        if let Err(err) = self.source.close().await {
            warn!(worker = self.slot.worker_id, error = %err, "closing record source failed");
        }
    }
}

#[derive(Clone)]
pub struct QueryProcessor {
    reference: Arc<DomainReference>,
    artifacts: ArtifactStore,
    timeout_policy: TimeoutPolicy,
    keep_raw_payloads: bool,
}

impl QueryProcessor {
    pub fn new(
        reference: Arc<DomainReference>,
        artifacts: ArtifactStore,
        timeout_policy: TimeoutPolicy,
        keep_raw_payloads: bool,
    ) -> Self {
        Self {
            reference,
            artifacts,
            timeout_policy,
            keep_raw_payloads,
        }
    }

    /// Fetch, parse, complete and order one query. Never fails: fetch errors
    /// become a standalone failure row.
    pub async fn process(&self, ctx: &mut WorkerContext, query: &Query) -> ProcessedQuery {
        let (result, timeouts) = self.fetch_with_policy(ctx, query).await;
        let retried_downloads = match result {
            Ok(FetchOutcome::DownloadTimedOut) => timeouts.saturating_sub(1),
            _ => timeouts,
        };
        let mut processed = ProcessedQuery {
            query: query.clone(),
            disposition: QueryDisposition::NoData,
            rows: Vec::new(),
            dropped_lines: 0,
            retried_downloads,
        };

        match result {
            Ok(FetchOutcome::Payload(bytes)) => {
                if self.keep_raw_payloads {
                    self.capture(ArtifactKind::Payload, query, "csv", &bytes).await;
                }
                let parsed = parse_payload(&bytes);
                if parsed.dropped > 0 {
                    debug!(dropped = parsed.dropped, "dropped malformed payload lines");
                }
                let real = parsed.rows.len();
                processed.dropped_lines = parsed.dropped;
                processed.disposition = if real == 0 {
                    QueryDisposition::NoData
                } else {
                    QueryDisposition::Records { real }
                };
                processed.rows = complete_and_order(query, parsed.rows, &self.reference);
            }
            Ok(FetchOutcome::NoData) => {
                info!("source reports no matching records");
                processed.rows = complete_and_order(query, Vec::new(), &self.reference);
            }
            Ok(FetchOutcome::DownloadTimedOut) => {
                warn!(
                    attempts = timeouts,
                    "download never materialized; completing as no-data"
                );
                processed.disposition = QueryDisposition::TimedOut { attempts: timeouts };
                processed.rows = complete_and_order(query, Vec::new(), &self.reference);
            }
            Err(err) => {
                error!(%query, error = %err, "fetch failed; recording failure row");
                if let Some(snapshot) = err.snapshot() {
                    self.capture(ArtifactKind::FailureSnapshot, query, "html", snapshot)
                        .await;
                }
                processed.disposition = QueryDisposition::Failed {
                    message: err.to_string(),
                };
                processed.rows = vec![CompletedRecord::fetch_failure(query)];
            }
        }
        processed
    }

    async fn fetch_with_policy(
        &self,
        ctx: &mut WorkerContext,
        query: &Query,
    ) -> (Result<FetchOutcome, FetchError>, u32) {
        let mut timeouts = 0;
        loop {
            match ctx.source.fetch(query).await {
                Ok(FetchOutcome::DownloadTimedOut) => {
                    timeouts += 1;
                    if self.timeout_policy.allows_retry(timeouts) {
                        warn!(attempt = timeouts, "download timed out; retrying");
                        continue;
                    }
                    return (Ok(FetchOutcome::DownloadTimedOut), timeouts);
                }
                other => return (other, timeouts),
            }
        }
    }

    async fn capture(&self, kind: ArtifactKind, query: &Query, extension: &str, bytes: &[u8]) {
        match self
            .artifacts
            .store_bytes(kind, Utc::now(), query, extension, bytes)
            .await
        {
            Ok(stored) => debug!(path = %stored.absolute_path.display(), "captured artifact"),
            Err(err) => warn!(error = %err, "could not capture artifact"),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedQuery {
    pub location: String,
    pub status: String,
    pub event: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub processed_queries: usize,
    pub real_rows: usize,
    pub vacancy_rows: usize,
    pub no_data_queries: usize,
    pub download_timeouts: usize,
    pub retried_downloads: usize,
    pub dropped_lines: usize,
    pub failed_queries: Vec<FailedQuery>,
}

impl RunStats {
    fn record(&mut self, processed: &ProcessedQuery) {
        self.processed_queries += 1;
        self.dropped_lines += processed.dropped_lines;
        self.retried_downloads += processed.retried_downloads as usize;
        for row in &processed.rows {
            if row.has_record {
                self.real_rows += 1;
            } else if row.division.is_some() {
                self.vacancy_rows += 1;
            }
        }
        match &processed.disposition {
            QueryDisposition::Records { .. } => {}
            QueryDisposition::NoData => self.no_data_queries += 1,
            QueryDisposition::TimedOut { .. } => self.download_timeouts += 1,
            QueryDisposition::Failed { message } => self.failed_queries.push(FailedQuery {
                location: processed.query.location.clone(),
                status: processed.query.status.clone(),
                event: processed.query.event.clone(),
                message: message.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resumed: bool,
    pub planned_queries: usize,
    pub skipped_queries: usize,
    pub remaining_queries: usize,
    pub interrupted: bool,
    pub completed: bool,
    pub stats: RunStats,
    pub worker_errors: Vec<String>,
    pub dataset_path: String,
    pub reports_dir: String,
    pub parquet_manifest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub total_queries: usize,
    pub completed_queries: usize,
    pub pending_queries: usize,
}

struct CommitState {
    accumulator: Accumulator,
    stats: RunStats,
}

enum WorkerError {
    Open(AdapterError),
    Commit(anyhow::Error),
    Panicked(String),
}

pub struct ScrapePipeline {
    config: SyncConfig,
    scope: ScopeConfig,
    reference: Arc<DomainReference>,
    factory: Arc<dyn SourceFactory>,
    stop: Arc<AtomicBool>,
}

impl ScrapePipeline {
    pub fn new(
        config: SyncConfig,
        scope: ScopeConfig,
        factory: Arc<dyn SourceFactory>,
    ) -> Result<Self> {
        Self::with_reference(config, scope, factory, DomainReference::standard())
    }

    pub fn with_reference(
        config: SyncConfig,
        scope: ScopeConfig,
        factory: Arc<dyn SourceFactory>,
        reference: DomainReference,
    ) -> Result<Self> {
        reference.validate().context("validating reference data")?;
        scope.validate()?;
        Ok(Self {
            config,
            scope,
            reference: Arc::new(reference),
            factory,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Setting the flag stops dispatch; in-flight queries still commit.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run_once(&self) -> Result<ScrapeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        self.stop.store(false, AtomicOrdering::SeqCst);

        let accumulator = Accumulator::open(&self.config.data_dir).await?;
        let resumed = matches!(accumulator.mode(), OpenMode::Resumed { .. });
        let dataset_path = accumulator.paths().dataset.clone();

        let planned = self.scope.queries();
        let mut pending: VecDeque<Query> = planned
            .iter()
            .filter(|q| !accumulator.is_completed(q))
            .cloned()
            .collect();
        let skipped_queries = planned.len() - pending.len();
        if let Some(limit) = self.config.max_queries {
            pending.truncate(limit);
        }
        info!(
            %run_id,
            planned = planned.len(),
            skipped = skipped_queries,
            pending = pending.len(),
            "starting scrape run"
        );

        let worker_count = self.scope.worker_count.min(pending.len()).max(1);
        let queue = Arc::new(Mutex::new(pending));
        let state = Arc::new(Mutex::new(CommitState {
            accumulator,
            stats: RunStats::default(),
        }));
        let processor = QueryProcessor::new(
            self.reference.clone(),
            ArtifactStore::new(self.config.artifacts_dir.clone()),
            self.config.timeout_policy,
            self.config.keep_raw_payloads,
        );

        let interrupt = self.config.handle_interrupts.then(|| {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight queries");
                    stop.store(true, AtomicOrdering::SeqCst);
                }
            })
        });

        let downloads_root = self.config.data_dir.join("downloads");
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let slot = WorkerSlot::new(worker_id, &downloads_root);
            let factory = self.factory.clone();
            let processor = processor.clone();
            let queue = queue.clone();
            let state = state.clone();
            let stop = self.stop.clone();
            workers.spawn(async move {
                run_worker(slot, factory, processor, queue, state, stop).await
            });
        }

        let mut worker_errors = Vec::new();
        let mut fatal: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(WorkerError::Open(err))) => {
                    error!(error = %err, "worker could not open a record source");
                    worker_errors.push(err.to_string());
                }
                Ok(Err(WorkerError::Commit(err))) => {
                    error!(error = %format!("{err:#}"), "commit failed; aborting run");
                    fatal.get_or_insert(err);
                }
                Ok(Err(WorkerError::Panicked(message))) => {
                    error!(error = %message, "worker panicked; its query stays pending");
                    worker_errors.push(format!("worker panicked: {message}"));
                }
                Err(join_err) => {
                    error!(error = %join_err, "worker task panicked");
                    worker_errors.push(join_err.to_string());
                }
            }
        }
        if let Some(handle) = interrupt {
            handle.abort();
        }
        if let Some(err) = fatal {
            return Err(err.context(format!("scrape run {run_id} aborted")));
        }

        let interrupted = self.stop.load(AtomicOrdering::SeqCst);
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut state = state.lock().await;
        let remaining_queries = planned
            .iter()
            .filter(|q| !state.accumulator.is_completed(q))
            .count();
        let completed = remaining_queries == 0;
        let parquet_manifest = if completed {
            let manifest = export_dataset_snapshot(&reports_dir, &dataset_path).await?;
            state.accumulator.finish_run().await?;
            Some(manifest.display().to_string())
        } else {
            info!(
                remaining = remaining_queries,
                checkpoint = %state.accumulator.paths().checkpoint.display(),
                "run incomplete; checkpoint kept for resume"
            );
            None
        };

        let summary = ScrapeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            resumed,
            planned_queries: planned.len(),
            skipped_queries,
            remaining_queries,
            interrupted,
            completed,
            stats: std::mem::take(&mut state.stats),
            worker_errors,
            dataset_path: dataset_path.display().to_string(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest,
        };
        write_reports(&reports_dir, &summary).await?;
        Ok(summary)
    }
}

async fn run_worker(
    slot: WorkerSlot,
    factory: Arc<dyn SourceFactory>,
    processor: QueryProcessor,
    queue: Arc<Mutex<VecDeque<Query>>>,
    state: Arc<Mutex<CommitState>>,
    stop: Arc<AtomicBool>,
) -> Result<(), WorkerError> {
    let source = factory.open(&slot).await.map_err(WorkerError::Open)?;
    let mut ctx = WorkerContext::new(slot, source);
    let outcome = AssertUnwindSafe(drain_queue(&mut ctx, &processor, &queue, &state, &stop))
        .catch_unwind()
        .await;
    ctx.close().await;
    outcome.unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

async fn drain_queue(
    ctx: &mut WorkerContext,
    processor: &QueryProcessor,
    queue: &Mutex<VecDeque<Query>>,
    state: &Mutex<CommitState>,
    stop: &AtomicBool,
) -> Result<(), WorkerError> {
    loop {
        if stop.load(AtomicOrdering::SeqCst) {
            return Ok(());
        }
        let Some(query) = queue.lock().await.pop_front() else {
            return Ok(());
        };

        let span = info_span!(
            "query",
            worker = ctx.slot.worker_id,
            location = %query.location,
            status = %query.status,
            event = %query.event,
        );
        let processed = processor.process(ctx, &query).instrument(span).await;

        let mut guard = state.lock().await;
        if let Err(err) = guard.accumulator.commit(&query, &processed.rows).await {
            stop.store(true, AtomicOrdering::SeqCst);
            return Err(WorkerError::Commit(
                err.context(format!("committing {query}")),
            ));
        }
        guard.stats.record(&processed);
    }
}

pub async fn plan(config: &SyncConfig, scope: &ScopeConfig) -> Result<PlanSummary> {
    let paths = AccumulatorPaths::in_dir(&config.data_dir);
    let completed = read_checkpoint(&paths.checkpoint).await?;
    let queries = scope.queries();
    let completed_queries = queries
        .iter()
        .filter(|q| completed.contains(&q.checkpoint_key()))
        .count();
    Ok(PlanSummary {
        total_queries: queries.len(),
        completed_queries,
        pending_queries: queries.len() - completed_queries,
    })
}

pub async fn plan_from_env() -> Result<PlanSummary> {
    let config = SyncConfig::from_env();
    let scope = ScopeConfig::load(&config.workspace_root).await?;
    plan(&config, &scope).await
}


async fn write_reports(reports_dir: &Path, summary: &ScrapeRunSummary) -> Result<()> {
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let mut failures: BTreeMap<&str, usize> = BTreeMap::new();
    for failed in &summary.stats.failed_queries {
        *failures.entry(failed.location.as_str()).or_default() += 1;
    }

    let brief = format!(
        "# USPA Records Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Resumed: {}\n- Planned queries: {}\n- Skipped (checkpointed): {}\n- Processed: {}\n- Remaining: {}\n- Real rows: {}\n- Vacancy rows: {}\n- No-data queries: {}\n- Download timeouts: {}\n\n## Failed Queries by Location\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.resumed,
        summary.planned_queries,
        summary.skipped_queries,
        summary.stats.processed_queries,
        summary.remaining_queries,
        summary.stats.real_rows,
        summary.stats.vacancy_rows,
        summary.stats.no_data_queries,
        summary.stats.download_timeouts,
        if failures.is_empty() {
            "- none".to_string()
        } else {
            failures
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
    );
    fs::write(reports_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;
    Ok(())
}

pub async fn export_dataset_snapshot(reports_dir: &Path, dataset: &Path) -> Result<PathBuf> {
    let records: Vec<CompletedRecord> = read_dataset(dataset)
        .await?
        .iter()
        .map(|row| row.to_record())
        .collect();

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let encoded = encode_records_parquet(&records)?;
    write_atomically(&snapshot_dir.join("records.parquet"), &encoded).await?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![ParquetManifestFile {
            name: "records".to_string(),
            path: "snapshots/records.parquet".to_string(),
            sha256: hex::encode(Sha256::digest(&encoded)),
            bytes: encoded.len() as u64,
            rows: records.len(),
        }],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomically(&manifest_path, &bytes).await?;
    info!(
        rows = records.len(),
        bytes = encoded.len(),
        manifest = %manifest_path.display(),
        "exported dataset snapshot"
    );
    Ok(manifest_path)
}

const SNAPSHOT_BATCH_ROWS: usize = 65_536;

fn records_schema() -> Arc<Schema> {
    let text = |name: &str, nullable: bool| ArrowField::new(name, DataType::Utf8, nullable);
    Arc::new(Schema::new(vec![
        text("division", true),
        text("weight_class", true),
        text("lift", true),
        text("name", true),
        ArrowField::new("kilos", DataType::Float64, true),
        ArrowField::new("pounds", DataType::Float64, true),
        text("date", true),
        text("location", false),
        text("event", false),
        text("status", false),
        ArrowField::new("has_record", DataType::Boolean, false),
    ]))
}

fn records_batch(schema: &Arc<Schema>, records: &[CompletedRecord]) -> Result<RecordBatch> {
    let text = |f: fn(&CompletedRecord) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from_iter(records.iter().map(f)))
    };
    let number = |f: fn(&CompletedRecord) -> Option<f64>| -> ArrayRef {
        Arc::new(Float64Array::from_iter(records.iter().map(f)))
    };
    let columns: Vec<ArrayRef> = vec![
        text(|r| r.division.as_deref()),
        text(|r| r.weight_class.as_deref()),
        text(|r| r.lift.as_ref().map(Lift::as_str)),
        text(|r| r.name.as_deref()),
        number(|r| r.kilos),
        number(|r| r.pounds),
        text(|r| r.date.as_deref()),
        text(|r| Some(r.location.as_str())),
        text(|r| Some(r.event.as_str())),
        text(|r| Some(r.status.as_str())),
        Arc::new(BooleanArray::from_iter(records.iter().map(|r| Some(r.has_record)))),
    ];
    RecordBatch::try_new(schema.clone(), columns).context("assembling records batch")
}

/// Whole-dataset Parquet file held in memory, one row group per batch.
fn encode_records_parquet(records: &[CompletedRecord]) -> Result<Vec<u8>> {
    let schema = records_schema();
    let mut encoded = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut encoded, schema.clone(), None)
        .context("starting parquet encoder")?;
    for chunk in records.chunks(SNAPSHOT_BATCH_ROWS) {
        writer
            .write(&records_batch(&schema, chunk)?)
            .context("encoding records batch")?;
        writer.flush().context("closing row group")?;
    }
    writer.close().context("finishing parquet footer")?;
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tempfile::tempdir;

    fn raw(division: &str, weight_class: &str, lift: Lift, name: &str) -> RawRecordRow {
        RawRecordRow {
            division: division.to_string(),
            weight_class: weight_class.to_string(),
            lift,
            name: name.to_string(),
            kilos: Some(150.0),
            pounds: Some(330.7),
            date: Some("2023-01-01".to_string()),
        }
    }

    fn reference() -> DomainReference {
        DomainReference::standard()
    }

    #[test]
    fn zero_real_rows_fill_the_whole_universe() {
        let query = Query::new("texas", "non-tested", "raw-powerlifting");
        let rows = complete_and_order(&query, Vec::new(), &reference());
        assert_eq!(rows.len(), 30 * 4 * 12);
        assert!(rows.iter().all(|r| !r.has_record));
        assert!(rows.iter().all(|r| r.name.as_deref() == Some(uspa_core::VACANCY_NAME)));
        assert!(rows.iter().all(|r| r.kilos.is_none() && r.date.is_none()));

        let deadlift_only = Query::new("texas", "non-tested", "raw-deadlift-only");
        let rows = complete_and_order(&deadlift_only, Vec::new(), &reference());
        assert_eq!(rows.len(), 30 * 12);
        assert!(rows.iter().all(|r| r.lift == Some(Lift::Deadlift)));
    }

    #[test]
    fn bench_only_scenario_marks_exactly_one_real_row() {
        let query = Query::new("ohio", "drug-tested", "raw-bench-only");
        let input = raw("OPEN MEN", "82.5kg/181.9lb", Lift::Bench, "J. Doe");
        let rows = complete_and_order(&query, vec![input], &reference());

        assert_eq!(rows.len(), 30 * 12);
        let real: Vec<_> = rows.iter().filter(|r| r.has_record).collect();
        assert_eq!(real.len(), 1);
        let record = real[0];
        assert_eq!(record.division.as_deref(), Some("OPEN MEN"));
        assert_eq!(record.weight_class.as_deref(), Some("82.5kg"));
        assert_eq!(record.lift, Some(Lift::Bench));
        assert_eq!(record.name.as_deref(), Some("J. Doe"));
        assert_eq!(record.kilos, Some(150.0));
        assert_eq!(record.pounds, Some(330.7));
        assert_eq!(record.date.as_deref(), Some("2023-01-01"));
        assert_eq!(
            (record.location.as_str(), record.status.as_str(), record.event.as_str()),
            ("ohio", "drug-tested", "raw-bench-only")
        );
        assert!(rows.iter().all(|r| r.lift == Some(Lift::Bench)));
        assert_eq!(
            rows.iter()
                .filter(|r| r.division.as_deref() == Some("OPEN MEN")
                    && r.weight_class.as_deref() == Some("82.5kg"))
                .count(),
            1
        );
    }

    #[test]
    fn completion_keeps_real_rows_verbatim_and_is_idempotent() {
        let query = Query::new("utah", "drug-tested", "classic-powerlifting");
        let input = vec![
            raw("OPEN WOMEN", "60kg/132.2lb", Lift::Total, "A"),
            raw("OPEN WOMEN", "60kg/132.2lb", Lift::Total, "B"),
            raw("MASTER 50-54 MEN", "100kg/220.4lb", Lift::Squat, "C"),
        ];
        let first = complete_and_order(&query, input.clone(), &reference());
        let second = complete_and_order(&query, input.clone(), &reference());
        assert_eq!(first, second);

        for row in input {
            let expected = CompletedRecord::real(&query, row);
            assert!(first.contains(&expected));
        }
        // Tied records both survive and suppress the vacancy.
        let open_women_60_total: Vec<_> = first
            .iter()
            .filter(|r| r.division.as_deref() == Some("OPEN WOMEN")
                && r.weight_class.as_deref() == Some("60kg")
                && r.lift == Some(Lift::Total))
            .collect();
        assert_eq!(open_women_60_total.len(), 2);
        assert!(open_women_60_total.iter().all(|r| r.has_record));
        assert_eq!(first.len(), 30 * 4 * 12 - 2 + 3);
    }

    #[test]
    fn unknown_divisions_get_gendered_coverage() {
        let query = Query::new("ohio", "drug-tested", "raw-powerlifting");
        let rows = complete_query(
            &query,
            vec![raw("GUEST MEN", "90kg/198.4lb", Lift::Squat, "Visitor")],
            &reference(),
        );
        let guest: Vec<_> = rows
            .iter()
            .filter(|r| r.division.as_deref() == Some("GUEST MEN"))
            .collect();
        assert_eq!(guest.len(), 12 * 4);
        assert_eq!(guest.iter().filter(|r| r.has_record).count(), 1);
        assert!(guest
            .iter()
            .all(|r| reference().men_weight_classes.contains(r.weight_class.as_ref().unwrap())));
    }

    #[test]
    fn division_casing_drift_does_not_duplicate() {
        let query = Query::new("ohio", "drug-tested", "raw-bench-only");
        let real = vec![raw("Open Men", "82.5kg/181.9lb", Lift::Bench, "J. Doe")];
        let rows = complete_query(&query, real, &reference());
        assert_eq!(rows.len(), 30 * 12);
        assert!(!rows
            .iter()
            .any(|r| !r.has_record && r.division.as_deref() == Some("OPEN MEN")
                && r.weight_class.as_deref() == Some("82.5kg")));
        assert_eq!(division_universe(&reference(), &[]).len(), 30);
    }

    #[test]
    fn canonical_order_uses_numeric_weight_and_lift_precedence() {
        let query = Query::new("ohio", "drug-tested", "raw-powerlifting");
        let mut rows: Vec<CompletedRecord> = ["52kg", "140kg", "140+kg", "56kg"]
            .iter()
            .map(|wc| CompletedRecord::vacancy(&query, "OPEN MEN", wc, Lift::Squat))
            .collect();
        canonical_sort(&mut rows);
        let order: Vec<_> = rows.iter().map(|r| r.weight_class.clone().unwrap()).collect();
        assert_eq!(order, vec!["52kg", "56kg", "140kg", "140+kg"]);

        let mut rows: Vec<CompletedRecord> = [
            Lift::Other("Press".into()),
            Lift::Total,
            Lift::Deadlift,
            Lift::Squat,
            Lift::Bench,
        ]
        .into_iter()
        .map(|lift| CompletedRecord::vacancy(&query, "OPEN MEN", "90kg", lift))
        .collect();
        canonical_sort(&mut rows);
        let lifts: Vec<_> = rows.iter().map(|r| r.lift.clone().unwrap()).collect();
        assert_eq!(
            lifts,
            vec![
                Lift::Squat,
                Lift::Bench,
                Lift::Deadlift,
                Lift::Total,
                Lift::Other("Press".into())
            ]
        );
    }

    #[test]
    fn canonical_sort_is_stable_for_ties() {
        let query = Query::new("ohio", "drug-tested", "raw-bench-only");
        let mut rows = vec![
            CompletedRecord::real(&query, raw("OPEN MEN", "90kg", Lift::Bench, "second")),
            CompletedRecord::real(&query, raw("MASTER 40-44 MEN", "90kg", Lift::Bench, "x")),
            CompletedRecord::real(&query, raw("OPEN MEN", "90kg", Lift::Bench, "first")),
        ];
        canonical_sort(&mut rows);
        let names: Vec<_> = rows.iter().map(|r| r.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["x", "second", "first"]);
    }

    #[test]
    fn scope_config_parses_and_validates() {
        let scope = ScopeConfig::from_yaml_str(
            "locations: [ohio, national]\nstatuses: [drug-tested]\nevents: [raw-bench-only]\nworker_count: 2\n",
        )
        .expect("scope");
        assert_eq!(scope.queries().len(), 2);
        assert_eq!(scope.batch_size, 500);

        assert!(ScopeConfig::from_yaml_str("locations: [atlantis]\n").is_err());
        assert!(ScopeConfig::from_yaml_str("events: [raw-bench-only, raw-bench-only]\n").is_err());
        assert!(ScopeConfig::from_yaml_str("worker_count: 0\n").is_err());
        assert!(ScopeConfig::from_yaml_str("threads: 3\n").is_err());
        assert_eq!(ScopeConfig::default().queries().len(), 1040);
    }

    #[test]
    fn timeout_policy_parsing() {
        assert_eq!(TimeoutPolicy::parse("no-data"), Some(TimeoutPolicy::TreatAsNoData));
        assert_eq!(
            TimeoutPolicy::parse("retry:2"),
            Some(TimeoutPolicy::Retry { attempts: 2 })
        );
        assert_eq!(TimeoutPolicy::parse("sometimes"), None);
        assert!(TimeoutPolicy::Retry { attempts: 1 }.allows_retry(1));
        assert!(!TimeoutPolicy::Retry { attempts: 1 }.allows_retry(2));
        assert!(!TimeoutPolicy::TreatAsNoData.allows_retry(1));
    }

    #[derive(Debug, Clone)]
    enum Scripted {
        Payload(&'static str),
        NoData,
        TimedOut,
        Fail,
        Crash,
    }

    #[derive(Clone, Default)]
    struct ScriptedFactory {
        script: Arc<std::sync::Mutex<HashMap<String, VecDeque<Scripted>>>>,
        fetches: Arc<AtomicUsize>,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedFactory {
        fn script(&self, query: &Query, steps: Vec<Scripted>) {
            self.script
                .lock()
                .unwrap()
                .insert(query.checkpoint_key(), steps.into());
        }
    }

    struct ScriptedSource {
        factory: ScriptedFactory,
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&mut self, query: &Query) -> Result<FetchOutcome, FetchError> {
            self.factory.fetches.fetch_add(1, AtomicOrdering::SeqCst);
            let step = self
                .factory
                .script
                .lock()
                .unwrap()
                .get_mut(&query.checkpoint_key())
                .and_then(|steps| steps.pop_front())
                .unwrap_or(Scripted::NoData);
            match step {
                Scripted::Payload(text) => Ok(FetchOutcome::Payload(text.as_bytes().to_vec())),
                Scripted::NoData => Ok(FetchOutcome::NoData),
                Scripted::TimedOut => Ok(FetchOutcome::DownloadTimedOut),
                Scripted::Fail => Err(FetchError::structural(
                    query,
                    "content iframe never appeared",
                    Some(b"<html><title>Maintenance</title></html>".to_vec()),
                )),
                Scripted::Crash => panic!("source crashed on {query}"),
            }
        }

        async fn close(&mut self) -> Result<(), AdapterError> {
            self.factory.closes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl SourceFactory for ScriptedFactory {
        async fn open(&self, _slot: &WorkerSlot) -> Result<Box<dyn RecordSource>, AdapterError> {
            self.opens.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(Box::new(ScriptedSource {
                factory: self.clone(),
            }))
        }
    }

    const OHIO_BENCH: &str = "Division,Weight Class,Lift,Name,Kilos,Pounds,Date\nOPEN MEN,82.5kg/181.9lb,Bench,J. Doe,150,330.7,2023-01-01\n";

    fn small_scope(workers: usize) -> ScopeConfig {
        ScopeConfig {
            locations: vec!["ohio".into(), "utah".into()],
            statuses: vec!["drug-tested".into()],
            events: vec!["raw-bench-only".into(), "raw-deadlift-only".into()],
            worker_count: workers,
            batch_size: 500,
        }
    }

    fn pipeline(root: &Path, scope: ScopeConfig, factory: &ScriptedFactory) -> ScrapePipeline {
        let config = SyncConfig::rooted_at(root);
        ScrapePipeline::new(config, scope, Arc::new(factory.clone())).expect("pipeline")
    }

    async fn dataset_multiset(root: &Path) -> Vec<String> {
        let paths = AccumulatorPaths::in_dir(root.join("data"));
        let mut rows: Vec<String> = read_dataset(&paths.dataset)
            .await
            .expect("dataset")
            .iter()
            .map(|r| format!("{r:?}"))
            .collect();
        rows.sort();
        rows
    }

    #[tokio::test]
    async fn full_run_completes_clears_checkpoint_and_reports() {
        let dir = tempdir().expect("tempdir");
        let factory = ScriptedFactory::default();
        let ohio_bench = Query::new("ohio", "drug-tested", "raw-bench-only");
        let utah_bench = Query::new("utah", "drug-tested", "raw-bench-only");
        factory.script(&ohio_bench, vec![Scripted::Payload(OHIO_BENCH)]);
        factory.script(&utah_bench, vec![Scripted::Fail]);

        let summary = pipeline(dir.path(), small_scope(2), &factory)
            .run_once()
            .await
            .expect("run");

        assert!(summary.completed);
        assert!(!summary.resumed);
        assert_eq!(summary.stats.processed_queries, 4);
        assert_eq!(summary.stats.real_rows, 1);
        assert_eq!(summary.stats.vacancy_rows, 3 * 360 - 1);
        assert_eq!(summary.stats.no_data_queries, 2);
        assert_eq!(summary.stats.failed_queries.len(), 1);
        assert_eq!(summary.stats.failed_queries[0].location, "utah");
        assert_eq!(factory.opens.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(factory.closes.load(AtomicOrdering::SeqCst), 2);

        let paths = AccumulatorPaths::in_dir(dir.path().join("data"));
        assert!(!paths.checkpoint.exists());
        let rows = read_dataset(&paths.dataset).await.expect("dataset");
        assert_eq!(rows.len(), 3 * 360 + 1);
        let failure: Vec<_> = rows
            .iter()
            .map(|r| r.to_record())
            .filter(|r| r.division.is_none())
            .collect();
        assert_eq!(failure, vec![CompletedRecord::fetch_failure(&utah_bench)]);

        let reports_dir = PathBuf::from(&summary.reports_dir);
        assert!(reports_dir.join("run_summary.json").exists());
        assert!(reports_dir.join("run_brief.md").exists());
        let manifest = summary.parquet_manifest.expect("manifest");
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest).expect("manifest")).expect("json");
        let entry = &manifest["files"][0];
        assert_eq!(entry["rows"], 3 * 360 + 1);
        let parquet = std::fs::read(reports_dir.join("snapshots/records.parquet")).expect("parquet");
        assert_eq!(entry["bytes"], parquet.len() as u64);
        assert_eq!(entry["sha256"], hex::encode(Sha256::digest(&parquet)));
        assert_eq!(&parquet[..4], b"PAR1");
        assert!(dir.path().join("artifacts/failures").exists());
    }

    #[tokio::test]
    async fn interrupted_run_resumes_with_only_the_remaining_queries() {
        let scope = small_scope(1);
        let script = |factory: &ScriptedFactory| {
            factory.script(
                &Query::new("ohio", "drug-tested", "raw-bench-only"),
                vec![Scripted::Payload(OHIO_BENCH)],
            );
        };

        let uninterrupted = tempdir().expect("tempdir");
        let factory = ScriptedFactory::default();
        script(&factory);
        pipeline(uninterrupted.path(), scope.clone(), &factory)
            .run_once()
            .await
            .expect("uninterrupted run");

        let resumed = tempdir().expect("tempdir");
        let factory = ScriptedFactory::default();
        script(&factory);
        let mut config = SyncConfig::rooted_at(resumed.path());
        config.max_queries = Some(3);
        let first = ScrapePipeline::new(config, scope.clone(), Arc::new(factory.clone()))
            .expect("pipeline")
            .run_once()
            .await
            .expect("partial run");
        assert!(!first.completed);
        assert_eq!(first.remaining_queries, 1);
        assert!(AccumulatorPaths::in_dir(resumed.path().join("data"))
            .checkpoint
            .exists());

        let before = factory.fetches.load(AtomicOrdering::SeqCst);
        let plan = plan(&SyncConfig::rooted_at(resumed.path()), &scope)
            .await
            .expect("plan");
        assert_eq!(plan.pending_queries, 1);

        let second = pipeline(resumed.path(), scope.clone(), &factory)
            .run_once()
            .await
            .expect("resumed run");
        assert!(second.resumed);
        assert!(second.completed);
        assert_eq!(second.skipped_queries, 3);
        assert_eq!(second.stats.processed_queries, 1);
        assert_eq!(factory.fetches.load(AtomicOrdering::SeqCst) - before, 1);

        assert_eq!(
            dataset_multiset(resumed.path()).await,
            dataset_multiset(uninterrupted.path()).await
        );
    }

    #[tokio::test]
    async fn download_timeouts_follow_the_policy() {
        let query = Query::new("ohio", "drug-tested", "raw-bench-only");
        let scope = ScopeConfig {
            locations: vec!["ohio".into()],
            statuses: vec!["drug-tested".into()],
            events: vec!["raw-bench-only".into()],
            worker_count: 1,
            batch_size: 500,
        };

        let dir = tempdir().expect("tempdir");
        let factory = ScriptedFactory::default();
        factory.script(&query, vec![Scripted::TimedOut, Scripted::Payload(OHIO_BENCH)]);
        let mut config = SyncConfig::rooted_at(dir.path());
        config.timeout_policy = TimeoutPolicy::Retry { attempts: 1 };
        let summary = ScrapePipeline::new(config, scope.clone(), Arc::new(factory.clone()))
            .expect("pipeline")
            .run_once()
            .await
            .expect("run");
        assert_eq!(summary.stats.real_rows, 1);
        assert_eq!(summary.stats.download_timeouts, 0);
        assert_eq!(summary.stats.retried_downloads, 1);

        let dir = tempdir().expect("tempdir");
        let factory = ScriptedFactory::default();
        factory.script(&query, vec![Scripted::TimedOut, Scripted::Payload(OHIO_BENCH)]);
        let mut config = SyncConfig::rooted_at(dir.path());
        config.timeout_policy = TimeoutPolicy::TreatAsNoData;
        let summary = ScrapePipeline::new(config, scope, Arc::new(factory.clone()))
            .expect("pipeline")
            .run_once()
            .await
            .expect("run");
        assert_eq!(summary.stats.real_rows, 0);
        assert_eq!(summary.stats.download_timeouts, 1);
        assert_eq!(summary.stats.no_data_queries, 0);
        assert_eq!(summary.stats.vacancy_rows, 360);
    }

    #[tokio::test]
    async fn stop_flag_halts_dispatch_and_keeps_checkpoint() {
        struct StopOnOpen {
            inner: ScriptedFactory,
            stop: Arc<AtomicBool>,
        }

        #[async_trait]
        impl SourceFactory for StopOnOpen {
            async fn open(&self, slot: &WorkerSlot) -> Result<Box<dyn RecordSource>, AdapterError> {
                self.stop.store(true, AtomicOrdering::SeqCst);
                self.inner.open(slot).await
            }
        }

        let dir = tempdir().expect("tempdir");
        let factory = ScriptedFactory::default();
        let stop = Arc::new(AtomicBool::new(false));
        // The flag is reset at the start of a run, so the factory raises it.
        let pipeline = ScrapePipeline {
            config: SyncConfig::rooted_at(dir.path()),
            scope: small_scope(1),
            reference: Arc::new(DomainReference::standard()),
            factory: Arc::new(StopOnOpen {
                inner: factory.clone(),
                stop: stop.clone(),
            }),
            stop,
        };

        let summary = pipeline.run_once().await.expect("run");
        assert!(summary.interrupted);
        assert!(!summary.completed);
        assert_eq!(summary.remaining_queries, 4);
        assert_eq!(summary.stats.processed_queries, 0);
        assert!(summary.parquet_manifest.is_none());
        assert_eq!(factory.closes.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_panic_leaves_the_run_incomplete_and_closes_the_source() {
        let dir = tempdir().expect("tempdir");
        let factory = ScriptedFactory::default();
        let utah_bench = Query::new("utah", "drug-tested", "raw-bench-only");
        factory.script(&utah_bench, vec![Scripted::Crash]);

        let summary = pipeline(dir.path(), small_scope(2), &factory)
            .run_once()
            .await
            .expect("run");
        assert!(!summary.completed);
        assert_eq!(summary.remaining_queries, 1);
        assert_eq!(summary.stats.processed_queries, 3);
        assert_eq!(summary.worker_errors.len(), 1);
        assert!(summary.worker_errors[0].contains("source crashed"));
        assert!(summary.parquet_manifest.is_none());
        assert_eq!(factory.opens.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(factory.closes.load(AtomicOrdering::SeqCst), 2);

        let paths = AccumulatorPaths::in_dir(dir.path().join("data"));
        assert!(paths.checkpoint.exists());

        let resumed = pipeline(dir.path(), small_scope(2), &factory)
            .run_once()
            .await
            .expect("resumed run");
        assert!(resumed.completed);
        assert_eq!(resumed.skipped_queries, 3);
        assert_eq!(resumed.stats.processed_queries, 1);
        let rows = read_dataset(&paths.dataset).await.expect("dataset");
        let utah_rows = rows
            .iter()
            .filter(|r| r.location == "utah" && r.event == "raw-bench-only")
            .count();
        assert_eq!(utah_rows, 360);
    }
}
