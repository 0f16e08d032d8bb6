use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uspa_loader::{
    destination_from_config, load_dataset, migrate_from_config, LoaderConfig, MemoryDestination,
};
use uspa_storage::AccumulatorPaths;
use uspa_sync::{
    source_factory_from_config, ScopeConfig, ScrapePipeline, ScrapeRunSummary, SourceKind,
    SyncConfig,
};

#[derive(Debug, Parser)]
#[command(name = "uspa-cli")]
#[command(about = "USPA records scraper and loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the configured query space into the local dataset.
    Scrape(ScrapeArgs),
    /// Replace the destination table with the local dataset.
    Load(LoadArgs),
    /// Scrape, then load if the run covered the whole query space.
    Run(ScrapeArgs),
    /// Show query-space size and checkpoint progress.
    Plan,
    /// Apply the Postgres schema.
    Migrate,
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    /// Stop after this many queries and keep the checkpoint.
    #[arg(long)]
    max_queries: Option<usize>,
    /// fixtures | http | command
    #[arg(long)]
    source: Option<String>,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Load into memory only and report what would be written.
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing() {
    let json = std::env::var("USPA_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Run(ScrapeArgs {
        max_queries: None,
        source: None,
    }));
    match command {
        Commands::Scrape(args) => {
            let summary = scrape(args).await?;
            print_scrape(&summary);
        }
        Commands::Load(args) => load(args.dry_run).await?,
        Commands::Run(args) => {
            let summary = scrape(args).await?;
            print_scrape(&summary);
            if summary.completed {
                load(false).await?;
            } else {
                warn!(
                    remaining = summary.remaining_queries,
                    "scrape incomplete; skipping load so the table is not replaced by a partial dataset"
                );
            }
        }
        Commands::Plan => {
            let plan = uspa_sync::plan_from_env().await?;
            println!(
                "queries total={} completed={} pending={}",
                plan.total_queries, plan.completed_queries, plan.pending_queries
            );
        }
        Commands::Migrate => {
            migrate_from_config(&LoaderConfig::from_env()).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn scrape(args: ScrapeArgs) -> Result<ScrapeRunSummary> {
    let mut config = SyncConfig::from_env();
    if let Some(raw) = args.source.as_deref() {
        config.source = SourceKind::parse(raw)
            .with_context(|| format!("unknown source {raw:?}; expected fixtures, http or command"))?;
    }
    config.max_queries = args.max_queries;

    let scope = ScopeConfig::load(&config.workspace_root).await?;
    let factory = source_factory_from_config(&config, &scope)?;
    let pipeline = ScrapePipeline::new(config, scope, factory)?;
    pipeline.run_once().await
}

fn print_scrape(summary: &ScrapeRunSummary) {
    println!(
        "scrape {}: run_id={} processed={} real={} vacancies={} failed={} remaining={} reports={}",
        if summary.completed { "complete" } else { "partial" },
        summary.run_id,
        summary.stats.processed_queries,
        summary.stats.real_rows,
        summary.stats.vacancy_rows,
        summary.stats.failed_queries.len(),
        summary.remaining_queries,
        summary.reports_dir
    );
}

async fn load(dry_run: bool) -> Result<()> {
    let sync_config = SyncConfig::from_env();
    let scope = ScopeConfig::load(&sync_config.workspace_root).await?;
    let mut config = LoaderConfig::from_env();
    config.batch_size = scope.batch_size;
    let dataset = AccumulatorPaths::in_dir(&sync_config.data_dir).dataset;

    let summary = if dry_run {
        let destination = MemoryDestination::new();
        load_dataset(&dataset, &destination, config.batch_size).await?
    } else {
        let destination = destination_from_config(&config).await?;
        load_dataset(&dataset, destination.as_ref(), config.batch_size).await?
    };
    info!(table = %config.table, "load complete");
    println!(
        "load complete: destination={} rows={} batches={}",
        summary.destination, summary.rows_loaded, summary.batches
    );
    Ok(())
}
