//! Payload parsing and the record-source boundary.
//!
//! Everything that touches the records site lives behind [`RecordSource`]:
//! the completion engine only ever sees a payload, a no-data signal, a
//! download timeout, or a [`FetchError`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uspa_core::{Lift, Query, RawRecordRow};
use uspa_storage::{HttpError, HttpFetcher};

pub const CRATE_NAME: &str = "uspa-adapters";

/// Division, Weight Class, Lift, Name, Kilos, Pounds, Date.
pub const EXPECTED_COLUMNS: usize = 7;

/// Exit status a download helper uses to report "no matching records".
pub const NO_RECORDS_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    pub rows: Vec<RawRecordRow>,
    pub dropped: usize,
}

/// Surplus fields between the first three and last three are re-joined into
/// the name. Quotes do not group fields, so a stray `"` stays on its own row.
pub fn parse_payload(bytes: &[u8]) -> ParsedPayload {
    let text = String::from_utf8_lossy(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut parsed = ParsedPayload::default();
    for record in reader.records() {
        let Ok(record) = record else {
            parsed.dropped += 1;
            continue;
        };
        let fields: Vec<&str> = record.iter().collect();
        match row_from_fields(&fields) {
            Some(row) => parsed.rows.push(row),
            None => parsed.dropped += 1,
        }
    }
    parsed
}

fn row_from_fields(fields: &[&str]) -> Option<RawRecordRow> {
    let len = fields.len();
    if len < EXPECTED_COLUMNS {
        return None;
    }
    let name = if len == EXPECTED_COLUMNS {
        fields[3].to_string()
    } else {
        fields[3..len - 3].join(", ")
    };
    let name = match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
        Some(inner) => inner.trim().to_string(),
        None => name,
    };
    Some(RawRecordRow {
        division: fields[0].to_string(),
        weight_class: fields[1].to_string(),
        lift: Lift::parse(fields[2]),
        name,
        kilos: parse_number(fields[len - 3]),
        pounds: parse_number(fields[len - 2]),
        date: text_or_none(fields[len - 1]),
    })
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

fn looks_like_html(content_type: Option<&str>, body: &[u8]) -> bool {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html")) {
        return true;
    }
    let head = String::from_utf8_lossy(&body[..body.len().min(256)]).to_ascii_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Payload(Vec<u8>),
    /// The source confirmed there is nothing to download.
    NoData,
    /// A download was started but never materialized.
    DownloadTimedOut,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("structural failure for {query}: {message}")]
    Structural {
        query: Query,
        message: String,
        snapshot: Option<Vec<u8>>,
    },
    #[error("i/o error while fetching {query}: {source}")]
    Io {
        query: Query,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn structural(query: &Query, message: impl Into<String>, snapshot: Option<Vec<u8>>) -> Self {
        FetchError::Structural {
            query: query.clone(),
            message: message.into(),
            snapshot,
        }
    }

    pub fn io(query: &Query, source: std::io::Error) -> Self {
        FetchError::Io {
            query: query.clone(),
            source,
        }
    }

    pub fn snapshot(&self) -> Option<&[u8]> {
        match self {
            FetchError::Structural { snapshot, .. } => snapshot.as_deref(),
            FetchError::Io { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One worker's exclusive connection to the records site.
#[async_trait]
pub trait RecordSource: Send {
    fn kind(&self) -> &'static str;

    async fn fetch(&mut self, query: &Query) -> Result<FetchOutcome, FetchError>;

    /// Release the session. Called once per worker on every exit path.
    async fn close(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    pub worker_id: usize,
    pub download_dir: PathBuf,
}

impl WorkerSlot {
    pub fn new(worker_id: usize, downloads_root: &Path) -> Self {
        Self {
            worker_id,
            download_dir: downloads_root.join(format!("worker-{worker_id}")),
        }
    }
}

#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn open(&self, slot: &WorkerSlot) -> Result<Box<dyn RecordSource>, AdapterError>;
}

/// Reads `<root>/<location>/<status>/<event>.csv`.
///
/// A missing file means no data; an `<event>.error` file simulates a
/// structural failure and its content becomes the snapshot.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn payload_path(&self, query: &Query) -> PathBuf {
        self.root
            .join(&query.location)
            .join(&query.status)
            .join(format!("{}.csv", query.event))
    }

    fn error_path(&self, query: &Query) -> PathBuf {
        self.payload_path(query).with_extension("error")
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    fn kind(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch(&mut self, query: &Query) -> Result<FetchOutcome, FetchError> {
        let error_path = self.error_path(query);
        if let Some(snapshot) = read_optional(&error_path)
            .await
            .map_err(|e| FetchError::io(query, e))?
        {
            let message = page_title(&String::from_utf8_lossy(&snapshot))
                .unwrap_or_else(|| "fixture marked as failing".to_string());
            return Err(FetchError::structural(query, message, Some(snapshot)));
        }

        match read_optional(&self.payload_path(query))
            .await
            .map_err(|e| FetchError::io(query, e))?
        {
            Some(bytes) => Ok(FetchOutcome::Payload(bytes)),
            None => Ok(FetchOutcome::NoData),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixtureSourceFactory {
    pub root: PathBuf,
}

#[async_trait]
impl SourceFactory for FixtureSourceFactory {
    async fn open(&self, _slot: &WorkerSlot) -> Result<Box<dyn RecordSource>, AdapterError> {
        Ok(Box::new(FixtureSource::new(self.root.clone())))
    }
}

#[derive(Debug, Clone)]
pub struct HttpCsvSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpCsvSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RecordSource for HttpCsvSource {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn fetch(&mut self, query: &Query) -> Result<FetchOutcome, FetchError> {
        let url = query.records_url(&self.base_url);
        match self.http.fetch_bytes(&url).await {
            Ok(resp) => {
                if resp.body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(FetchOutcome::NoData);
                }
                if looks_like_html(resp.content_type.as_deref(), &resp.body) {
                    let title = page_title(&String::from_utf8_lossy(&resp.body));
                    let message = match title {
                        Some(title) => format!("expected CSV, got HTML page {title:?}"),
                        None => "expected CSV, got an HTML page".to_string(),
                    };
                    return Err(FetchError::structural(query, message, Some(resp.body)));
                }
                Ok(FetchOutcome::Payload(resp.body))
            }
            Err(HttpError::HttpStatus { status: 404, .. }) => Ok(FetchOutcome::NoData),
            Err(HttpError::HttpStatus { status, url, body }) => Err(FetchError::structural(
                query,
                format!("http status {status} for {url}"),
                Some(body),
            )),
            Err(err) => Err(FetchError::structural(query, err.to_string(), None)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceFactory {
    pub http: Arc<HttpFetcher>,
    pub base_url: String,
}

#[async_trait]
impl SourceFactory for HttpSourceFactory {
    async fn open(&self, _slot: &WorkerSlot) -> Result<Box<dyn RecordSource>, AdapterError> {
        Ok(Box::new(HttpCsvSource::new(self.http.clone(), self.base_url.clone())))
    }
}

const IN_PROGRESS_EXTENSIONS: [&str; 3] = ["crdownload", "part", "tmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadWait {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DownloadWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadDirState {
    pub completed: Vec<PathBuf>,
    pub in_progress: usize,
}

#[derive(Debug, Clone)]
pub struct DownloadDir {
    path: PathBuf,
}

impl DownloadDir {
    pub async fn prepare(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn scan(&self) -> std::io::Result<DownloadDirState> {
        let mut state = DownloadDirState::default();
        let mut entries = fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            match ext.as_deref() {
                Some("csv") => state.completed.push(path),
                Some(ext) if IN_PROGRESS_EXTENSIONS.contains(&ext) => state.in_progress += 1,
                _ => {}
            }
        }
        state.completed.sort();
        Ok(state)
    }

    pub async fn clear_completed(&self) -> std::io::Result<usize> {
        let state = self.scan().await?;
        for path in &state.completed {
            fs::remove_file(path).await?;
        }
        Ok(state.completed.len())
    }

    pub async fn wait_for_download(&self, wait: DownloadWait) -> std::io::Result<Option<PathBuf>> {
        let deadline = tokio::time::Instant::now() + wait.timeout;
        loop {
            let state = self.scan().await?;
            if state.in_progress == 0 {
                if let Some(first) = state.completed.into_iter().next() {
                    return Ok(Some(first));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(wait.poll_interval).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    NoRecords,
}

#[async_trait]
pub trait DownloadTrigger: Send {
    async fn trigger(&mut self, query: &Query, download_dir: &Path)
        -> Result<TriggerOutcome, FetchError>;

    async fn shutdown(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

pub struct DownloadDirSource<T> {
    trigger: T,
    dir: DownloadDir,
    wait: DownloadWait,
}

impl<T: DownloadTrigger> DownloadDirSource<T> {
    pub fn new(trigger: T, dir: DownloadDir, wait: DownloadWait) -> Self {
        Self { trigger, dir, wait }
    }
}

#[async_trait]
impl<T: DownloadTrigger> RecordSource for DownloadDirSource<T> {
    fn kind(&self) -> &'static str {
        "download-dir"
    }

    async fn fetch(&mut self, query: &Query) -> Result<FetchOutcome, FetchError> {
        let stale = self
            .dir
            .clear_completed()
            .await
            .map_err(|e| FetchError::io(query, e))?;
        if stale > 0 {
            debug!(stale, dir = %self.dir.path().display(), "removed stale downloads");
        }

        match self.trigger.trigger(query, self.dir.path()).await? {
            TriggerOutcome::NoRecords => Ok(FetchOutcome::NoData),
            TriggerOutcome::Started => {
                let Some(path) = self
                    .dir
                    .wait_for_download(self.wait)
                    .await
                    .map_err(|e| FetchError::io(query, e))?
                else {
                    return Ok(FetchOutcome::DownloadTimedOut);
                };
                let bytes = fs::read(&path).await.map_err(|e| FetchError::io(query, e))?;
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %err, "could not remove consumed download");
                }
                Ok(FetchOutcome::Payload(bytes))
            }
        }
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        self.trigger.shutdown().await
    }
}

/// Runs an external headless-browser helper as `<program> <args..> <url> <download_dir>`.
///
/// Exit 0 means the download was started, [`NO_RECORDS_EXIT_CODE`] means the
/// page reported no records, anything else is a structural failure with
/// stderr kept as the snapshot.
#[derive(Debug, Clone)]
pub struct CommandTrigger {
    pub program: String,
    pub args: Vec<String>,
    pub base_url: String,
    pub timeout: Duration,
}

impl CommandTrigger {
    pub fn from_command_line(
        command_line: &str,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let mut parts = command_line.split_whitespace().map(ToString::to_string);
        let program = parts
            .next()
            .ok_or_else(|| AdapterError::Message("empty downloader command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            base_url: base_url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl DownloadTrigger for CommandTrigger {
    async fn trigger(
        &mut self,
        query: &Query,
        download_dir: &Path,
    ) -> Result<TriggerOutcome, FetchError> {
        let url = query.records_url(&self.base_url);
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&url)
            .arg(download_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| FetchError::io(query, e))?,
            Err(_) => {
                return Err(FetchError::structural(
                    query,
                    format!("download helper timed out after {:?}", self.timeout),
                    None,
                ))
            }
        };

        match output.status.code() {
            Some(0) => Ok(TriggerOutcome::Started),
            Some(NO_RECORDS_EXIT_CODE) => Ok(TriggerOutcome::NoRecords),
            code => Err(FetchError::structural(
                query,
                format!("download helper exited with {code:?}"),
                Some(output.stderr),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSourceFactory {
    pub trigger: CommandTrigger,
    pub wait: DownloadWait,
}

#[async_trait]
impl SourceFactory for CommandSourceFactory {
    async fn open(&self, slot: &WorkerSlot) -> Result<Box<dyn RecordSource>, AdapterError> {
        let dir = DownloadDir::prepare(&slot.download_dir).await?;
        Ok(Box::new(DownloadDirSource::new(
            self.trigger.clone(),
            dir,
            self.wait,
        )))
    }
}

async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
