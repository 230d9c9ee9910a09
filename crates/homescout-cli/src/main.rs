use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use homescout_engine::{
    EngineConfig, RegionCoordinator, RegionRunOptions, ScrapeEngine, ScrapeOptions,
};
use homescout_storage::{HttpFetcher, LockService, MemoryStore, PgStore, RecordStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "homescout")]
#[command(about = "HomeScout listing crawler")]
struct Cli {
    /// Keep everything in memory instead of Postgres (dry run).
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One bounded scrape pass over one or all adapters.
    Scrape(ScrapeArgs),
    /// Crawl regions of one adapter with locking and pacing.
    Regions(RegionArgs),
    /// List registered adapters.
    Adapters,
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct ScrapeArgs {
    #[arg(long)]
    adapter: Option<String>,
    #[arg(long)]
    max_urls: Option<usize>,
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long = "start-url")]
    start_urls: Vec<String>,
    #[arg(long)]
    listing_type: Option<String>,
}

impl ScrapeArgs {
    fn options(&self) -> ScrapeOptions {
        let defaults = ScrapeOptions::default();
        ScrapeOptions {
            adapter_name: self.adapter.clone(),
            max_pages: self.max_pages.unwrap_or(defaults.max_pages),
            max_urls: self.max_urls.unwrap_or(defaults.max_urls),
            concurrency: self.concurrency.unwrap_or(defaults.concurrency),
            extra_start_urls: self.start_urls.clone(),
            extra_listing_type: self.listing_type.clone(),
            ..defaults
        }
    }
}

#[derive(Debug, Args)]
struct RegionArgs {
    #[arg(long)]
    adapter: String,
    #[arg(long = "region", required = true)]
    regions: Vec<String>,
    #[arg(long)]
    region_concurrency: Option<usize>,
    #[arg(long)]
    default_max_pages: Option<u32>,
    #[arg(long)]
    max_urls: Option<usize>,
    #[arg(long)]
    listing_type: Option<String>,
    #[arg(long)]
    jitter_ms: Option<u64>,
}

impl RegionArgs {
    fn options(&self) -> RegionRunOptions {
        let defaults = RegionRunOptions::default();
        RegionRunOptions {
            scrape: ScrapeOptions {
                max_urls: self.max_urls.unwrap_or(defaults.scrape.max_urls),
                extra_listing_type: self.listing_type.clone(),
                ..defaults.scrape.clone()
            },
            region_concurrency: self.region_concurrency.unwrap_or(defaults.region_concurrency),
            default_max_pages: self.default_max_pages.unwrap_or(defaults.default_max_pages),
            region_jitter_ms: self.jitter_ms,
            ..defaults
        }
    }
}

struct Stores {
    records: Arc<dyn RecordStore>,
    locks: Arc<dyn LockService>,
}

async fn open_stores(config: &EngineConfig, memory: bool) -> Result<Stores> {
    if memory {
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            records: store.clone(),
            locks: store,
        });
    }
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to postgres")?,
    );
    Ok(Stores {
        records: store.clone(),
        locks: store,
    })
}

fn build_engine(config: &EngineConfig, stores: &Stores) -> Result<ScrapeEngine> {
    let registry = config.load_registry()?;
    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    Ok(ScrapeEngine::new(registry, fetcher, stores.records.clone()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape(ScrapeArgs::default())) {
        Commands::Scrape(args) => {
            let stores = open_stores(&config, cli.memory).await?;
            let engine = build_engine(&config, &stores)?;
            let result = engine.run(args.options()).await?;
            info!(inserted = result.inserted, discovered = result.discovered, "scrape complete");
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Regions(args) => {
            let stores = open_stores(&config, cli.memory).await?;
            let engine = Arc::new(build_engine(&config, &stores)?);
            let coordinator = RegionCoordinator::new(engine, stores.locks.clone());
            let batch = coordinator
                .run_regions(&args.adapter, &args.regions, args.options())
                .await?;
            info!(inserted = batch.inserted, regions = batch.regions.len(), "regions complete");
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }
        Commands::Adapters => {
            let registry = config.load_registry()?;
            for meta in registry.metas() {
                println!("{}", meta.name);
            }
        }
        Commands::Migrate => {
            if cli.memory {
                eprintln!("nothing to migrate for the in-memory store");
                return Ok(());
            }
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}
