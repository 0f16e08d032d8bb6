//! Dataset accumulation, checkpointing, artifact storage and HTTP fetch utilities.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uspa_core::{normalize_weight_class, CompletedRecord, Lift, Query};
use uuid::Uuid;

pub const CRATE_NAME: &str = "uspa-storage";

pub const DATASET_FILE: &str = "uspa_all_records.csv";
pub const CHECKPOINT_FILE: &str = "completed_queries.txt";
pub const JOURNAL_FILE: &str = "commit.journal";

/// One line of the dataset file, as text. Coercion happens in [`DatasetRow::to_record`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetRow {
    #[serde(rename = "Division")]
    pub division: Option<String>,
    #[serde(rename = "Weight Class")]
    pub weight_class: Option<String>,
    #[serde(rename = "Lift")]
    pub lift: Option<String>,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Kilos")]
    pub kilos: Option<String>,
    #[serde(rename = "Pounds")]
    pub pounds: Option<String>,
    #[serde(rename = "Date")]
    pub date: Option<String>,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Event")]
    pub event: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "HasRecord", default)]
    pub has_record: Option<String>,
}

impl From<&CompletedRecord> for DatasetRow {
    fn from(record: &CompletedRecord) -> Self {
        Self {
            division: record.division.clone(),
            weight_class: record.weight_class.clone(),
            lift: record.lift.as_ref().map(|l| l.as_str().to_string()),
            name: record.name.clone(),
            kilos: record.kilos.map(|v| v.to_string()),
            pounds: record.pounds.map(|v| v.to_string()),
            date: record.date.clone(),
            location: record.location.clone(),
            event: record.event.clone(),
            status: record.status.clone(),
            has_record: Some(if record.has_record { "True" } else { "False" }.to_string()),
        }
    }
}

impl DatasetRow {
    pub fn to_record(&self) -> CompletedRecord {
        CompletedRecord {
            division: text_or_none(self.division.as_deref()),
            weight_class: text_or_none(self.weight_class.as_deref())
                .map(|wc| normalize_weight_class(&wc)),
            lift: text_or_none(self.lift.as_deref()).map(|l| Lift::parse(&l)),
            name: text_or_none(self.name.as_deref()),
            kilos: parse_number(self.kilos.as_deref()),
            pounds: parse_number(self.pounds.as_deref()),
            date: text_or_none(self.date.as_deref()),
            location: self.location.clone(),
            event: self.event.clone(),
            status: self.status.clone(),
            has_record: parse_flag(self.has_record.as_deref()),
        }
    }
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn parse_number(value: Option<&str>) -> Option<f64> {
    value?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

pub fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes" | "y" | "t")
    )
}

pub fn encode_rows(rows: &[CompletedRecord], with_header: bool) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(with_header)
        .from_writer(Vec::new());
    if with_header && rows.is_empty() {
        writer
            .write_record(uspa_core::DATASET_COLUMNS)
            .context("writing dataset header")?;
    }
    for row in rows {
        writer
            .serialize(DatasetRow::from(row))
            .context("encoding dataset row")?;
    }
    writer.into_inner().context("flushing dataset rows")
}

pub fn decode_rows(bytes: &[u8]) -> anyhow::Result<Vec<DatasetRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let mut out = Vec::new();
    for (idx, row) in reader.deserialize::<DatasetRow>().enumerate() {
        out.push(row.with_context(|| format!("decoding dataset row {}", idx + 1))?);
    }
    Ok(out)
}

pub async fn read_dataset(path: impl AsRef<Path>) -> anyhow::Result<Vec<DatasetRow>> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading dataset {}", path.display()))?;
    decode_rows(&bytes).with_context(|| format!("parsing dataset {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CommitJournal {
    query_key: String,
    dataset_len: u64,
    checkpoint_len: u64,
}

#[derive(Debug, Clone)]
pub struct AccumulatorPaths {
    pub dataset: PathBuf,
    pub checkpoint: PathBuf,
    pub journal: PathBuf,
}

impl AccumulatorPaths {
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            dataset: dir.join(DATASET_FILE),
            checkpoint: dir.join(CHECKPOINT_FILE),
            journal: dir.join(JOURNAL_FILE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Fresh,
    Resumed { completed: usize },
}

/// Append-only dataset plus checkpoint set, committed one query at a time.
///
/// A commit appends the query's rows and then its checkpoint line. A journal
/// written beforehand records both file lengths, so a crash between the two
/// appends is rolled back on the next open.
#[derive(Debug)]
pub struct Accumulator {
    paths: AccumulatorPaths,
    completed: HashSet<String>,
    mode: OpenMode,
}

impl Accumulator {
    pub async fn open(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let paths = AccumulatorPaths::in_dir(data_dir);

        recover_journal(&paths).await?;
        let mut completed = read_checkpoint(&paths.checkpoint).await?;

        let dataset_exists = fs::try_exists(&paths.dataset)
            .await
            .with_context(|| format!("checking dataset {}", paths.dataset.display()))?;
        if !completed.is_empty() && !dataset_exists {
            warn!(
                checkpoint = %paths.checkpoint.display(),
                entries = completed.len(),
                "checkpoint present without a dataset file; starting a fresh run"
            );
            completed.clear();
            remove_if_exists(&paths.checkpoint).await?;
        }

        let mode = if completed.is_empty() {
            let header = encode_rows(&[], true)?;
            write_atomically(&paths.dataset, &header).await?;
            remove_if_exists(&paths.checkpoint).await?;
            OpenMode::Fresh
        } else {
            info!(completed = completed.len(), "resuming from checkpoint");
            OpenMode::Resumed {
                completed: completed.len(),
            }
        };

        Ok(Self {
            paths,
            completed,
            mode,
        })
    }

    pub fn paths(&self) -> &AccumulatorPaths {
        &self.paths
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_completed(&self, query: &Query) -> bool {
        self.completed.contains(&query.checkpoint_key())
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Durably append `rows` and mark `query` completed, as one unit.
    ///
    /// A failed commit is rolled back before returning. If the rollback itself
    /// fails the journal stays on disk and every later commit settles it first.
    pub async fn commit(&mut self, query: &Query, rows: &[CompletedRecord]) -> anyhow::Result<()> {
        let key = query.checkpoint_key();
        if let Some(settled) = recover_journal(&self.paths).await? {
            self.completed.insert(settled);
        }
        if self.completed.contains(&key) {
            bail!("query {query} is already checkpointed");
        }
        let body = encode_rows(rows, false)?;

        let journal = CommitJournal {
            query_key: key.clone(),
            dataset_len: file_len(&self.paths.dataset).await?,
            checkpoint_len: file_len(&self.paths.checkpoint).await?,
        };
        let journal_bytes = serde_json::to_vec(&journal).context("serializing commit journal")?;
        write_atomically(&self.paths.journal, &journal_bytes).await?;

        if let Err(err) = self.apply(&key, &body).await {
            match recover_journal(&self.paths).await {
                Ok(Some(settled)) => {
                    self.completed.insert(settled);
                }
                Ok(None) => {}
                Err(rollback) => warn!(
                    query = %key,
                    error = %rollback,
                    "failed commit could not be rolled back yet; journal kept"
                ),
            }
            return Err(err);
        }
        self.completed.insert(key);
        Ok(())
    }

    async fn apply(&self, key: &str, body: &[u8]) -> anyhow::Result<()> {
        append_synced(&self.paths.dataset, body).await?;
        append_synced(&self.paths.checkpoint, format!("{key}\n").as_bytes()).await?;
        fs::remove_file(&self.paths.journal)
            .await
            .with_context(|| format!("removing journal {}", self.paths.journal.display()))
    }

    pub async fn finish_run(&mut self) -> anyhow::Result<()> {
        remove_if_exists(&self.paths.checkpoint).await?;
        self.completed.clear();
        Ok(())
    }
}

/// Settle a leftover commit journal. Returns the journal's query key when that
/// commit had reached the checkpoint and its rows were kept.
async fn recover_journal(paths: &AccumulatorPaths) -> anyhow::Result<Option<String>> {
    let Some(text) = read_optional(&paths.journal).await? else {
        return Ok(None);
    };
    let journal: CommitJournal = serde_json::from_slice(&text)
        .with_context(|| format!("parsing journal {}", paths.journal.display()))?;

    let checkpointed = read_checkpoint(&paths.checkpoint)
        .await?
        .contains(&journal.query_key);
    if checkpointed {
        info!(query = %journal.query_key, "interrupted commit had completed; dropping journal");
    } else {
        warn!(
            query = %journal.query_key,
            dataset_len = journal.dataset_len,
            "rolling back interrupted commit"
        );
        truncate_to(&paths.dataset, journal.dataset_len).await?;
        truncate_to(&paths.checkpoint, journal.checkpoint_len).await?;
    }
    fs::remove_file(&paths.journal)
        .await
        .with_context(|| format!("removing journal {}", paths.journal.display()))?;
    Ok(checkpointed.then_some(journal.query_key))
}

pub async fn read_checkpoint(path: &Path) -> anyhow::Result<HashSet<String>> {
    let Some(bytes) = read_optional(path).await? else {
        return Ok(HashSet::new());
    };
    let text = String::from_utf8_lossy(&bytes);
    let mut out = HashSet::new();
    for line in text.lines() {
        match Query::from_checkpoint_key(line) {
            Some(query) => {
                out.insert(query.checkpoint_key());
            }
            None if line.trim().is_empty() => {}
            None => warn!(line, "ignoring malformed checkpoint entry"),
        }
    }
    Ok(out)
}

async fn read_optional(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

async fn file_len(path: &Path) -> anyhow::Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

async fn truncate_to(path: &Path, len: u64) -> anyhow::Result<()> {
    if file_len(path).await? <= len {
        return Ok(());
    }
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening {} for truncation", path.display()))?;
    file.set_len(len)
        .await
        .with_context(|| format!("truncating {} to {len} bytes", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))
}

async fn append_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {} for append", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    file.sync_data()
        .await
        .with_context(|| format!("syncing {}", path.display()))
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Payload,
    FailureSnapshot,
}

impl ArtifactKind {
    fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Payload => "payloads",
            ArtifactKind::FailureSnapshot => "failures",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        kind: ArtifactKind,
        captured_at: DateTime<Utc>,
        query: &Query,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(kind.dir_name())
            .join(stamp)
            .join(query.slug())
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        kind: ArtifactKind,
        captured_at: DateTime<Utc>,
        query: &Query,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(kind, captured_at, query, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes).await?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// 429 and 5xx are worth another attempt; anything else is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub retries: u32,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            retries: 3,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryBackoff {
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial.saturating_mul(multiplier).min(self.ceiling)
    }
}

/// Keeps request starts at least `min_interval` apart across all workers.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let start_at = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let start_at = next_slot.map_or(now, |slot| slot.max(now));
            *next_slot = Some(start_at + self.min_interval);
            start_at
        };
        let now = Instant::now();
        if start_at > now {
            tokio::time::sleep(start_at - now).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: RetryBackoff,
    pub min_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: RetryBackoff::default(),
            min_interval: Some(Duration::from_millis(250)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: Vec<u8>,
    },
    #[error("fetch limiter closed")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    pacer: Option<RequestPacer>,
    backoff: RetryBackoff,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.concurrency.max(1)),
            pacer: config.min_interval.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    /// Successful responses only; a non-2xx final status is [`HttpError::HttpStatus`]
    /// carrying the body.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| HttpError::Closed)?;
        let response = self
            .get_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await?;

        if response.status.is_success() {
            Ok(response)
        } else {
            Err(HttpError::HttpStatus {
                status: response.status.as_u16(),
                url: response.final_url,
                body: response.body,
            })
        }
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let mut retry = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            let result = self.get_once(url).await;
            let transient = match &result {
                Ok(response) => is_transient_status(response.status),
                Err(HttpError::Request(err)) => is_transient_error(err),
                Err(_) => false,
            };
            if !transient || retry >= self.backoff.retries {
                return result;
            }

            let delay = self.backoff.delay(retry);
            warn!(retry = retry + 1, delay_ms = delay.as_millis() as u64, "transient http failure");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}
