use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use refe_core::EntityKind;
use refe_storage::Catalog;
use refe_sync::{open_engine, report_recent_runs, IngestInput, RefreshScheduler, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "refe-cli")]
#[command(about = "Real estate feed ingestion and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EntityArg {
    Properties,
    Complexes,
}

impl From<EntityArg> for EntityKind {
    fn from(arg: EntityArg) -> Self {
        match arg {
            EntityArg::Properties => EntityKind::Properties,
            EntityArg::Complexes => EntityKind::Complexes,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a local payload for a declared feed.
    Ingest {
        #[arg(long)]
        feed: String,
        #[arg(long)]
        file: PathBuf,
        /// Overrides the feed's declared entity kind.
        #[arg(long, value_enum)]
        entity: Option<EntityArg>,
    },
    /// Parse a payload and show what an ingest would see, without writing.
    Preview {
        #[arg(long)]
        feed: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Refresh every due URL feed once and wait for them.
    Refresh,
    /// Run the periodic auto-refresh until interrupted.
    Schedule,
    /// Markdown digest of recent runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("REFE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

fn file_hint(path: &std::path::Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Ingest { feed, file, entity } => {
            let engine = open_engine(&config).await?;
            let feed = engine
                .catalog()
                .lock()
                .await
                .feed(&feed)
                .with_context(|| format!("unknown feed {feed}; declare it in {}", config.registry_path().display()))?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let entity = entity.map(EntityKind::from).unwrap_or(feed.entity);
            let report = engine
                .ingest(&feed, entity, IngestInput::Bytes { bytes, hint: file_hint(&file) })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Preview { feed, file, limit } => {
            let engine = open_engine(&config).await?;
            let feed = engine
                .catalog()
                .lock()
                .await
                .feed(&feed)
                .with_context(|| format!("unknown feed {feed}; declare it in {}", config.registry_path().display()))?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let preview = engine.preview(&feed, bytes, file_hint(&file), limit).await?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        Commands::Refresh => {
            let started = refe_sync::refresh_due_feeds_once_from_env().await?;
            println!("refresh complete: feeds={started}");
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set REFE_SCHEDULER_ENABLED=1 to run it");
            }
            let engine = open_engine(&config).await?;
            let scheduler = std::sync::Arc::new(RefreshScheduler::new(engine.clone()));
            let mut sched = scheduler.clone().build_job_scheduler(config.tick()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(tick_secs = config.tick_secs, "auto-refresh scheduler running");

            scheduler.refresh_due_feeds().await;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
            engine.persist().await?;
        }
        Commands::Runs { limit } => {
            let engine = open_engine(&config).await?;
            let runs = engine.catalog().lock().await.runs(None);
            println!("{}", report_recent_runs(&runs, limit));
        }
    }

    Ok(())
}
