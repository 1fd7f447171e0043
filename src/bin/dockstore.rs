use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dockstore::settings::LOG_ENV_VAR;
use dockstore::{
    ArchivalJob, ColdStore, CsvImportOptions, CsvImporter, QueryRouter, RetentionPurge,
    Scheduler, Settings, SpotFilter, Store,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "dockstore", version, about = "Dock occupancy storage CLI")]
struct Cli {
    /// Postgres connection string. Falls back to settings, then DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show planned DDL changes without applying
    SchemaPlan,

    /// Apply DDL changes (create tables/indexes as needed)
    SchemaSync,

    /// Run the archival and retention jobs on their schedules until interrupted,
    /// then print the counters gathered in Prometheus text format
    Run,

    /// Archive every eligible day once
    Archive,

    /// Purge old raw counts once
    Purge,

    /// Print counts for a spot as JSON
    Counts {
        #[arg(long)]
        area: String,
        #[arg(long)]
        spot: String,
        /// YYYYMMDD; omit for the latest sample
        #[arg(long)]
        day: Option<String>,
    },

    /// Print open master versions as JSON
    Places {
        #[arg(long)]
        area: Option<String>,
        #[arg(long)]
        spot: Option<String>,
        #[arg(long)]
        query: Option<String>,
    },

    /// Load a headerless CSV (time, area, spot, count) into the aggregated table
    Import {
        path: PathBuf,
        #[arg(long)]
        time_format: Option<String>,
    },

    /// Pool, scraping and archive status
    Status,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[derive(Serialize)]
struct Status {
    pool: dockstore::store::PoolHealth,
    raw_rows: i64,
    scraping_healthy: bool,
    archive_days: Vec<chrono::NaiveDate>,
}

#[tokio::main]
async fn main() -> dockstore::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let url = match settings.database_url(cli.database_url) {
        Ok(u) => u,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    let store = Store::builder(url)
        .max_connections(settings.database.max_connections)
        .connect_timeout(settings.connect_timeout())
        .schema(settings.database.schema.clone())
        .build()
        .await?;
    let cold = ColdStore::new(&settings.archive.data_dir);
    let schema_config = store.schema_config().clone();

    match cli.command {
        Commands::SchemaPlan => {
            let plan = store.schema().plan(&schema_config).await?;
            print_plan(&plan);
        }
        Commands::SchemaSync => {
            let plan = store.schema().sync(&schema_config).await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::Run => {
            let mut scheduler = Scheduler::new(store.pool().clone());
            scheduler.register(
                Arc::new(ArchivalJob::new(
                    store.counts(),
                    cold,
                    settings.archival_config(),
                )),
                settings.archive_schedule()?,
            );
            let retention = settings.retention_config();
            let every = dockstore::Schedule::Every(retention.interval);
            scheduler.register(
                Arc::new(RetentionPurge::new(store.counts(), retention)),
                every,
            );
            let handle = scheduler.spawn();
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            handle.shutdown().await;
            print!("{}", dockstore::metrics::render_prometheus());
        }
        Commands::Archive => {
            let job = ArchivalJob::new(store.counts(), cold, settings.archival_config());
            let outcome = dockstore::scheduler::run_guarded(store.pool(), &job).await?;
            println!("{outcome:?}");
        }
        Commands::Purge => {
            let purge = RetentionPurge::new(store.counts(), settings.retention_config());
            let outcome = dockstore::scheduler::run_guarded(store.pool(), &purge).await?;
            println!("{outcome:?}");
        }
        Commands::Counts { area, spot, day } => {
            let router = QueryRouter::new(store.counts(), cold, settings.router_config());
            let rows = router.resolve_counts(&area, &spot, day.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Places { area, spot, query } => {
            let registry = store.registry(settings.registry_config()).await?;
            let filter = SpotFilter { area, spot, query };
            let places = registry.list_open_versions(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&places)?);
        }
        Commands::Import { path, time_format } => {
            let mut options = CsvImportOptions {
                batch_size: usize::try_from(settings.archive.batch_size).unwrap_or(5000),
                ..Default::default()
            };
            if let Some(format) = time_format {
                options.time_format = format;
            }
            let outcome = CsvImporter::new(store.counts(), options)
                .import_path(&path)
                .await?;
            println!(
                "{} rows read, {} inserted, {} already present",
                outcome.attempted,
                outcome.affected,
                outcome.skipped()
            );
        }
        Commands::Status => {
            let counts = store.counts();
            let scrape = counts.scrape_status(settings.health.min_raw_rows).await?;
            let raw_rows = match scrape {
                dockstore::ScrapeStatus::Healthy { rows } => rows,
                dockstore::ScrapeStatus::Stalled { rows, .. } => rows,
            };
            let status = Status {
                pool: store.pool_health().await?,
                raw_rows,
                scraping_healthy: scrape.is_healthy(),
                archive_days: cold.list_days().await?,
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn print_plan(plan: &dockstore::SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
