//! epmatch - bulk episode identification
//!
//! Configuration comes from `--config`, `EPMATCH_CONFIG` or
//! `<config_dir>/epmatch/config.toml`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use epmatch_common::config::{database_path, load_config, resolve_root_folder, FixedSettings};
use epmatch_common::db::init_database;
use epmatch_common::events::EventBus;
use epmatch_common::MatchSettings;
use epmatch_core::models::{BatchOptions, BulkProgress};
use epmatch_core::services::{
    BatchProcessor, ContentStore, IdentifyHandler, MappedEntrySource, MatchOrchestrator,
    PlainTextSource, ProgressSink, StoreHandler, WorkHandler,
};
use epmatch_core::EpisodeLabel;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_BUS_CAPACITY: usize = 256;

/// Identify TV episodes from subtitle text
#[derive(Parser, Debug)]
#[clap(name = "epmatch", version)]
struct Args {
    /// Configuration file
    #[clap(long, value_name = "FILE", env = "EPMATCH_CONFIG")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identify subtitle text files against the store
    Identify {
        #[clap(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Store subtitle text files as releases of one episode
    Store {
        #[clap(long)]
        series: String,
        /// "1", "01" or "S01"
        #[clap(long)]
        season: String,
        /// "5", "05" or "E05"
        #[clap(long)]
        episode: String,
        #[clap(long)]
        title: Option<String>,
        #[clap(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Print store statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting epmatch v{}", env!("CARGO_PKG_VERSION"));

    let settings = MatchSettings::from_config(&config).context("Invalid matching configuration")?;
    let root_folder = resolve_root_folder(&config);
    let db_path = database_path(&root_folder);
    info!("Database path: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let store = Arc::new(ContentStore::new(pool).with_event_bus(event_bus.clone()));
    let options = BatchOptions::from_config(&settings.batch);

    match args.command {
        Command::Identify { files } => {
            let orchestrator = Arc::new(MatchOrchestrator::new(
                store,
                Arc::new(FixedSettings::new(settings)),
            ));
            let handler = Arc::new(IdentifyHandler::new(
                orchestrator,
                Arc::new(PlainTextSource::new()),
            ));
            run_batch(options, handler, files).await
        }
        Command::Store {
            series,
            season,
            episode,
            title,
            files,
        } => {
            let label = EpisodeLabel::new(&series, &season, &episode, title.as_deref())
                .context("Invalid episode label")?;
            info!(label = %label, files = files.len(), "Storing releases");
            let labels = files.iter().map(|path| (path.clone(), label.clone())).collect();
            let handler = Arc::new(StoreHandler::new(
                store,
                Arc::new(MappedEntrySource::new(labels)),
            ));
            run_batch(options, handler, files).await
        }
        Command::Stats => {
            let statistics = store.statistics().await?;
            let series = store.list_series().await?;
            let report = serde_json::json!({
                "statistics": statistics,
                "series": series,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Run a batch with Ctrl-C cancellation and print the result as JSON
async fn run_batch(
    options: BatchOptions,
    handler: Arc<dyn WorkHandler>,
    files: Vec<PathBuf>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling batch");
            ctrl_c_token.cancel();
        }
    });

    let sink: Arc<dyn ProgressSink> = Arc::new(|progress: BulkProgress| {
        info!(
            completed = progress.completed(),
            total = progress.total,
            percentage = %format!("{:.1}", progress.percentage()),
            current_file = progress.current_file.as_deref().unwrap_or(""),
            "Progress"
        );
    });

    let result = BatchProcessor::new(options)
        .process(handler, files, Some(sink), cancel)
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.aborted {
        bail!(
            "batch aborted: {}",
            result.abort_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}
