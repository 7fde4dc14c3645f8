use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

mod batch;
#[cfg(feature = "browser")]
mod browser;
mod collector;
mod config;
mod error;
mod extractor;
mod ledger;
mod models;
mod notify;
mod query;
mod stall;
mod surface;

use crate::collector::{Collector, Deadline};
use crate::config::{Config, ConfigArgs};
use crate::error::{AppError, Result};
use crate::ledger::UniqueKeyLedger;
use crate::models::parse_timestamp;
use crate::notify::{Notifier, notify_best_effort};
use crate::surface::{FeedSurface, SnapshotSurface};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect the search feed into batch files until the time budget runs out
    Collect {
        #[command(flatten)]
        config: ConfigArgs,

        /// Anchor date used when the history folder has no batch files yet
        #[arg(long, value_parser = parse_seed)]
        seed_date: Option<NaiveDateTime>,
    },
    /// Print the search window the next run would use
    Query {
        #[command(flatten)]
        config: ConfigArgs,

        /// Anchor date used when the history folder has no batch files yet
        #[arg(long, value_parser = parse_seed)]
        seed_date: Option<NaiveDateTime>,
    },
}

fn parse_seed(raw: &str) -> std::result::Result<NaiveDateTime, String> {
    parse_timestamp(raw).ok_or_else(|| format!("'{}' is not a date or timestamp", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Collect { config, seed_date } => collect(&config, seed_date).await,
        Commands::Query { config, seed_date } => print_window(&config, seed_date).await,
    };

    if let Err(e) = &result {
        if e.is_precondition() {
            error!("Run aborted before collection: {}", e);
        } else {
            error!("Run failed: {}", e);
        }
    }
    Ok(result?)
}

fn load_config(args: &ConfigArgs) -> Result<Config> {
    config::build_config(args).map_err(|e| AppError::Config(format!("{:#}", e)))
}

async fn print_window(args: &ConfigArgs, seed: Option<NaiveDateTime>) -> Result<()> {
    let config = load_config(args)?;
    let node_id = ledger::node_id_from_path(&config.output_dir)?;
    let window = query::build_window(config.history_dir(), config.lag_days, seed)?;
    if window.needs_summary {
        let notifier = notify::from_settings(&config.notify);
        notify_best_effort(notifier.as_ref(), window.summary_notification(&node_id)).await;
    }
    println!("{}", serde_json::to_string_pretty(&window)?);
    Ok(())
}

#[cfg(feature = "browser")]
async fn devtools_surface(url: &Url, config: &Config) -> Result<Box<dyn FeedSurface>> {
    let surface = browser::ChromeSurface::connect(url, config.timing.search_step_wait).await?;
    Ok(Box::new(surface))
}

#[cfg(not(feature = "browser"))]
async fn devtools_surface(url: &Url, _config: &Config) -> Result<Box<dyn FeedSurface>> {
    Err(AppError::Config(format!(
        "Cannot attach to {}: this build has no browser support (rebuild with --features browser)",
        url
    )))
}

async fn open_surface(config: &Config) -> Result<Box<dyn FeedSurface>> {
    if let Some(dir) = &config.snapshot_dir {
        return Ok(Box::new(SnapshotSurface::from_dir(dir)?));
    }
    match &config.devtools_url {
        Some(url) => devtools_surface(url, config).await,
        None => Err(AppError::Config(
            "No feed surface configured: pass --snapshot-dir or --devtools-url".to_string(),
        )),
    }
}

async fn collect(args: &ConfigArgs, seed: Option<NaiveDateTime>) -> Result<()> {
    let config = load_config(args)?;
    let deadline = Deadline::from_hours(config.max_run_hours)?;
    let (node_id, ledger) = UniqueKeyLedger::load_for_output(&config.output_dir)?;
    let notifier: Box<dyn Notifier> = notify::from_settings(&config.notify);
    let window = query::build_window(config.history_dir(), config.lag_days, seed)?;
    let surface = open_surface(&config).await?;

    let mut collector = Collector::new(
        &config,
        surface.as_ref(),
        notifier.as_ref(),
        node_id,
        ledger,
        window.query.clone(),
        deadline,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for the interrupt signal: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let outcome = collector.sweep(&window, shutdown).await;

    println!("{}", serde_json::to_string_pretty(&collector.summary())?);
    outcome.map(|state| info!("Run finished in state {}.", state))
}
