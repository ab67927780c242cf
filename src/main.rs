//! robin-fetch - Entry Point
//!
//! Runs search and scrape batches through the local Tor pool and prints the
//! merged results as JSON. Ctrl+C cancels the running batch.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use robin_fetch::config::{Config, LogConfig};
use robin_fetch::fetch::{CancelHandle, FetchEngine};
use robin_fetch::models::SearchHit;
use robin_fetch::search::{
    collect_hits, default_engines, order_by_health, probe_targets, scrape_tasks, search_tasks,
};

#[derive(Parser)]
#[command(name = "robin-fetch", version, about = "Anonymized concurrent fetches over Tor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every Tor instance and search engine
    Health,

    /// Query every enabled onion search engine
    Search {
        /// Search query
        query: String,

        /// Concurrent workers (defaults to one per engine)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Skip the pre-flight health check
        #[arg(long, default_value_t = false)]
        skip_health_check: bool,

        /// Also scrape every result link
        #[arg(long, default_value_t = false)]
        scrape: bool,
    },

    /// Fetch pages and extract their text
    Scrape {
        /// Page URLs; onion hosts go through Tor
        #[arg(required = true)]
        urls: Vec<String>,

        /// Concurrent workers (defaults to SCRAPE_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.log)?;

    let engine = FetchEngine::from_config(&config).context("Failed to build proxy pool")?;
    info!(
        endpoints = engine.pool().len(),
        strategy = engine.pool().strategy_name(),
        "robin-fetch started"
    );

    let (cancel_handle, cancel) = CancelHandle::new();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, cancelling batch");
        cancel_handle.cancel();
    });

    let output = match cli.command {
        Commands::Health => {
            let report = engine
                .health_monitor(config.health.clone())
                .check_pool(&probe_targets(&default_engines()))
                .await;
            serde_json::to_value(&report)?
        }

        Commands::Search {
            query,
            workers,
            skip_health_check,
            scrape,
        } => {
            let mut engines = default_engines();
            if !skip_health_check {
                let report = engine
                    .health_monitor(config.health.clone())
                    .check_pool(&probe_targets(&engines))
                    .await;
                if report.reachable_endpoints() == 0 {
                    warn!("No Tor instance answered the health check, continuing anyway");
                }
                engines = order_by_health(&engines, &report);
            }

            let tasks = search_tasks(&query, &engines, &config)?;
            let limit = workers.unwrap_or(tasks.len());
            let search = engine
                .submit_batch_with_cancel(tasks, limit, cancel.clone())
                .await;
            let hits = collect_hits(&search.successes);
            info!(hits = hits.len(), "Search finished");

            let scraped = if scrape && !hits.is_empty() && !*cancel.borrow() {
                let tasks = scrape_tasks(&hits, &config);
                Some(
                    engine
                        .submit_batch_with_cancel(tasks, config.fetch.scrape_workers, cancel)
                        .await,
                )
            } else {
                None
            };

            json!({
                "query": query,
                "search": search,
                "hits": hits,
                "scrape": scraped,
            })
        }

        Commands::Scrape { urls, workers } => {
            let hits: Vec<SearchHit> = urls
                .into_iter()
                .map(|link| SearchHit {
                    title: String::new(),
                    link,
                })
                .collect();
            let tasks = scrape_tasks(&hits, &config);
            let limit = workers.unwrap_or(config.fetch.scrape_workers);
            serde_json::to_value(engine.submit_batch_with_cancel(tasks, limit, cancel).await)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Logs go to stderr so stdout carries only the JSON output
fn init_tracing(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("robin_fetch={}", log.level)))
        .context("Invalid LOG_LEVEL")?;
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
