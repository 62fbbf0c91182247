//! kb-worker - Background pipeline worker for the knowledge bank.
//!
//! Polls the durable job queue and runs the ingest/suggest pipeline
//! stages (§4.C) out of band from the request path. This binary owns no
//! HTTP surface; it only drains jobs enqueued by whatever front plane
//! sits in front of [`knowbank::store::SqliteStore`].
//!
//! Usage:
//!   kb-worker [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Path to configuration file (default: config.toml)
//!   --concurrency <N>    Override the configured worker concurrency
//!   --log-file <PATH>    Log file path (default: stdout)

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use knowbank::{AppConfig, EmbeddingService, HttpOracleClient, IngestJobHandler, JobHandler, SuggestJobHandler, SqliteStore, WorkerPool};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug)]
struct WorkerArgs {
    config_path: PathBuf,
    concurrency: Option<usize>,
    log_file: Option<PathBuf>,
}

impl Default for WorkerArgs {
    fn default() -> Self {
        Self { config_path: PathBuf::from("config.toml"), concurrency: None, log_file: None }
    }
}

fn parse_args() -> WorkerArgs {
    let mut args = WorkerArgs::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = iter.next() {
                    args.config_path = PathBuf::from(path);
                }
            }
            "--concurrency" => {
                if let Some(n) = iter.next() {
                    if let Ok(n) = n.parse() {
                        args.concurrency = Some(n);
                    }
                }
            }
            "--log-file" => {
                if let Some(path) = iter.next() {
                    args.log_file = Some(PathBuf::from(path));
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
                print_help();
                std::process::exit(1);
            }
        }
    }

    args
}

fn print_help() {
    println!("kb-worker - Background pipeline worker for the knowledge bank");
    println!();
    println!("USAGE:");
    println!("    kb-worker [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>       Path to configuration file (default: config.toml)");
    println!("    --concurrency <N>     Override the configured worker concurrency");
    println!("    --log-file <PATH>     Log file path (default: stdout)");
    println!("    --help, -h            Print this help message");
}

fn setup_logging(log_file: Option<PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,knowbank=debug"));

    if let Some(path) = log_file {
        let file = File::create(path)?;
        tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(file)).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    }

    Ok(())
}

async fn run(args: WorkerArgs) -> anyhow::Result<()> {
    info!("Loading worker configuration from: {:?}", args.config_path);
    let mut config = if args.config_path.exists() {
        AppConfig::from_file(&args.config_path)?
    } else {
        info!("Config file not found, using default configuration");
        AppConfig::default()
    };
    if let Some(n) = args.concurrency {
        config.worker.concurrency = n;
    }
    config.validate()?;

    let store = Arc::new(SqliteStore::new(&config.store).await?);
    let oracle: Arc<dyn knowbank::Oracle> = Arc::new(HttpOracleClient::new(&config.oracle));
    let embedding = Arc::new(EmbeddingService::with_capacity(config.chunk.embedding_cache_entries));
    let chunk_config = knowbank::ChunkerConfig {
        parent_tokens: config.chunk.parent_tokens,
        child_tokens: config.chunk.child_tokens,
        child_overlap_tokens: config.chunk.child_overlap_tokens,
    };

    let handlers: Vec<Arc<dyn JobHandler>> = vec![
        Arc::new(IngestJobHandler::new(store.clone(), oracle.clone(), embedding, chunk_config)),
        Arc::new(SuggestJobHandler::new(store.clone(), oracle.clone())),
    ];

    info!(concurrency = config.worker.concurrency, "kb-worker starting");
    let pool = Arc::new(WorkerPool::new(store, handlers, config.worker.concurrency));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = pool.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, draining in-flight jobs");
    shutdown_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task panicked");
        }
    }

    info!("kb-worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    setup_logging(args.log_file.clone())?;
    info!("kb-worker v{}", knowbank::VERSION);
    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_point_at_config_toml() {
        let args = WorkerArgs::default();
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.concurrency.is_none());
    }
}
