//! Destination schema and batched loading of the accumulated dataset.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uspa_core::CompletedRecord;
use uspa_storage::{read_dataset, DatasetRow};

pub const CRATE_NAME: &str = "uspa-loader";

pub const DEFAULT_TABLE: &str = "uspa_records";
pub const DEFAULT_BATCH_SIZE: usize = 500;

const DESTINATION_COLUMNS: &str =
    "division, weight_class, lift, name, kilos, pounds, date, location, event, status, has_record";

/// Postgres caps a statement at 65535 bind parameters; 11 per row.
const MAX_ROWS_PER_STATEMENT: usize = 5_000;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("loader configuration: {0}")]
    Config(String),
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("batch {batch}/{total} failed with {rows_loaded} rows already loaded: {source}")]
    Batch {
        batch: usize,
        total: usize,
        rows_loaded: usize,
        #[source]
        source: Box<LoadError>,
    },
    #[error(transparent)]
    Dataset(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationRecord {
    pub division: Option<String>,
    pub weight_class: Option<String>,
    pub lift: Option<String>,
    pub name: Option<String>,
    pub kilos: Option<f64>,
    pub pounds: Option<f64>,
    pub date: Option<String>,
    pub location: String,
    pub event: String,
    pub status: String,
    pub has_record: bool,
}

impl From<CompletedRecord> for DestinationRecord {
    fn from(record: CompletedRecord) -> Self {
        Self {
            division: record.division,
            weight_class: record.weight_class,
            lift: record.lift.map(|l| l.as_str().to_string()),
            name: record.name,
            kilos: record.kilos,
            pounds: record.pounds,
            date: record.date,
            location: record.location,
            event: record.event,
            status: record.status,
            has_record: record.has_record,
        }
    }
}

impl From<&DatasetRow> for DestinationRecord {
    fn from(row: &DatasetRow) -> Self {
        row.to_record().into()
    }
}

pub fn destination_records(rows: &[DatasetRow]) -> Vec<DestinationRecord> {
    rows.iter().map(DestinationRecord::from).collect()
}

/// Table names end up in SQL text and URLs, so only `[A-Za-z0-9_]` is accepted.
pub fn validate_table_name(table: &str) -> Result<(), LoadError> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(LoadError::InvalidTable(table.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Postgres,
    Postgrest,
}

impl DestinationKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(DestinationKind::Postgres),
            "postgrest" | "supabase" => Some(DestinationKind::Postgrest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub destination: DestinationKind,
    pub database_url: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub table: String,
    pub batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            destination: DestinationKind::Postgrest,
            database_url: None,
            supabase_url: None,
            supabase_key: None,
            table: DEFAULT_TABLE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            destination: std::env::var("USPA_DESTINATION")
                .ok()
                .and_then(|v| DestinationKind::parse(&v))
                .unwrap_or(defaults.destination),
            database_url: std::env::var("DATABASE_URL").ok(),
            supabase_url: std::env::var("SUPABASE_URL").ok(),
            supabase_key: std::env::var("SUPABASE_KEY").ok(),
            table: std::env::var("USPA_TABLE").unwrap_or(defaults.table),
            batch_size: defaults.batch_size,
        }
    }
}

#[async_trait]
pub trait DestinationStore: Send + Sync {
    fn name(&self) -> &'static str;
    async fn clear_all(&self) -> Result<(), LoadError>;
    async fn insert_batch(&self, rows: &[DestinationRecord]) -> Result<(), LoadError>;
}

/// Supabase-style REST endpoint in front of Postgres.
#[derive(Debug, Clone)]
pub struct PostgrestDestination {
    client: reqwest::Client,
    base_url: String,
    key: String,
    table: String,
}

impl PostgrestDestination {
    pub fn new(
        base_url: impl Into<String>,
        key: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, LoadError> {
        let table = table.into();
        validate_table_name(&table)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|source| LoadError::Request {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
            table,
        })
    }

    pub fn truncate_url(&self) -> String {
        format!("{}/rest/v1/rpc/truncate_{}", self.base_url, self.table)
    }

    pub fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), LoadError> {
        let response = self
            .client
            .post(url)
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await
            .map_err(|source| LoadError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(LoadError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DestinationStore for PostgrestDestination {
    fn name(&self) -> &'static str {
        "postgrest"
    }

    async fn clear_all(&self) -> Result<(), LoadError> {
        self.post_json(&self.truncate_url(), &serde_json::json!({}))
            .await
    }

    async fn insert_batch(&self, rows: &[DestinationRecord]) -> Result<(), LoadError> {
        self.post_json(&self.table_url(), rows).await
    }
}

#[derive(Debug, Clone)]
pub struct PostgresDestination {
    pool: PgPool,
    table: String,
}

impl PostgresDestination {
    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, LoadError> {
        let table = table.into();
        validate_table_name(&table)?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool, table })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), LoadError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for PostgresDestination {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn clear_all(&self) -> Result<(), LoadError> {
        sqlx::query(&format!("TRUNCATE TABLE {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_batch(&self, rows: &[DestinationRecord]) -> Result<(), LoadError> {
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({DESTINATION_COLUMNS}) ", self.table));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.division.clone())
                    .push_bind(row.weight_class.clone())
                    .push_bind(row.lift.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.kilos)
                    .push_bind(row.pounds)
                    .push_bind(row.date.clone())
                    .push_bind(row.location.clone())
                    .push_bind(row.event.clone())
                    .push_bind(row.status.clone())
                    .push_bind(row.has_record);
            });
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDestination {
    rows: Mutex<Vec<DestinationRecord>>,
    inserts: AtomicUsize,
    clears: AtomicUsize,
    fail_on_insert: Option<usize>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th insert call (1-based).
    pub fn failing_on_insert(n: usize) -> Self {
        Self {
            fail_on_insert: Some(n),
            ..Self::default()
        }
    }

    pub async fn rows(&self) -> Vec<DestinationRecord> {
        self.rows.lock().await.clone()
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub async fn seed(&self, rows: Vec<DestinationRecord>) {
        self.rows.lock().await.extend(rows);
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn clear_all(&self) -> Result<(), LoadError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().await.clear();
        Ok(())
    }

    async fn insert_batch(&self, rows: &[DestinationRecord]) -> Result<(), LoadError> {
        let call = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_insert == Some(call) {
            return Err(LoadError::Status {
                url: "memory://".to_string(),
                status: 503,
                body: "injected failure".to_string(),
            });
        }
        self.rows.lock().await.extend_from_slice(rows);
        Ok(())
    }
}

pub async fn destination_from_config(
    config: &LoaderConfig,
) -> Result<Box<dyn DestinationStore>, LoadError> {
    match config.destination {
        DestinationKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| LoadError::Config("DATABASE_URL is not set".to_string()))?;
            Ok(Box::new(PostgresDestination::connect(url, config.table.clone()).await?))
        }
        DestinationKind::Postgrest => {
            let url = config
                .supabase_url
                .as_deref()
                .ok_or_else(|| LoadError::Config("SUPABASE_URL is not set".to_string()))?;
            let key = config
                .supabase_key
                .as_deref()
                .ok_or_else(|| LoadError::Config("SUPABASE_KEY is not set".to_string()))?;
            Ok(Box::new(PostgrestDestination::new(url, key, config.table.clone())?))
        }
    }
}

pub async fn migrate_from_config(config: &LoaderConfig) -> Result<(), LoadError> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| LoadError::Config("DATABASE_URL is not set".to_string()))?;
    let destination = PostgresDestination::connect(url, config.table.clone()).await?;
    destination.migrate().await?;
    info!(table = %config.table, "schema migrations applied");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub destination: String,
    pub rows_read: usize,
    pub rows_loaded: usize,
    pub batches: usize,
}

/// Clear the destination, then insert the dataset in `batch_size` chunks.
///
/// A failed batch aborts the load without undoing earlier batches; the
/// recovery path is to run the whole load again.
pub async fn load_dataset(
    dataset: &Path,
    destination: &dyn DestinationStore,
    batch_size: usize,
) -> Result<LoadSummary, LoadError> {
    if batch_size == 0 {
        return Err(LoadError::Config("batch size must be at least 1".to_string()));
    }
    let rows = read_dataset(dataset).await?;
    let records = destination_records(&rows);
    let total = records.len().div_ceil(batch_size);
    info!(
        rows = records.len(),
        batches = total,
        destination = destination.name(),
        "loading dataset"
    );

    destination.clear_all().await?;

    let mut rows_loaded = 0;
    for (idx, batch) in records.chunks(batch_size).enumerate() {
        let span = info_span!("load_batch", batch = idx + 1, total);
        let result = async {
            let result = destination.insert_batch(batch).await;
            match &result {
                Ok(()) => info!(rows = batch.len(), "[{}/{}] batch loaded", idx + 1, total),
                Err(err) => warn!(error = %err, "batch failed; earlier batches stay loaded"),
            }
            result
        }
        .instrument(span)
        .await;

        result.map_err(|source| LoadError::Batch {
            batch: idx + 1,
            total,
            rows_loaded,
            source: Box::new(source),
        })?;
        rows_loaded += batch.len();
    }

    info!(rows_loaded, "load finished");
    Ok(LoadSummary {
        destination: destination.name().to_string(),
        rows_read: rows.len(),
        rows_loaded,
        batches: total,
    })
}
