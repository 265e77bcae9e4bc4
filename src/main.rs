use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use pezzottify_jobs::config::{AppConfig, CliConfig, EnvOverrides, FileConfig};
use pezzottify_jobs::jobs::{JobQueue, JobsDatabase, JobsSystem};
use pezzottify_jobs::metrics;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the SQLite jobs database file. Created if missing.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to a TOML config file. Values in the file override CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Start the job processor and cron scheduler.
    #[clap(long)]
    pub enabled: bool,

    /// Maximum number of jobs running at once (1-10).
    #[clap(long, default_value_t = 2)]
    pub concurrency: usize,

    /// Delay between queue polls, in milliseconds.
    #[clap(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Default age in days after which finished jobs are removed.
    #[clap(long, default_value_t = 30)]
    pub job_retention_days: u32,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_path: self.db_path.clone(),
            metrics_port: self.metrics_port,
            enabled: self.enabled,
            concurrency: self.concurrency,
            poll_interval_ms: self.poll_interval_ms,
            job_retention_days: self.job_retention_days,
        }
    }
}

async fn run_metrics_server(queue: Arc<dyn JobQueue>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(queue);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    Ok(axum::serve(listener, app).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(
        &cli_args.to_cli_config(),
        file_config,
        &EnvOverrides::from_env(),
    )?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening SQLite jobs database at {:?}...", config.db_path);
    let db = JobsDatabase::open(&config.db_path)?;
    let system = JobsSystem::new(db, config.jobs.clone());

    let status = system.initialize()?;
    info!(
        "Background jobs: enabled={}, handlers={:?}, schedules={}, pending={}",
        status.enabled,
        status.registered_handlers,
        status.active_schedules,
        status.counts.pending
    );

    let metrics_server = if config.metrics_port > 0 {
        info!("Metrics available at port {}!", config.metrics_port);
        let queue = system.queue().clone();
        let port = config.metrics_port;
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(queue, port).await {
                error!("Metrics server error: {:#}", e);
            }
        }))
    } else {
        info!("Metrics server disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if let Some(handle) = metrics_server {
        handle.abort();
    }
    if let Err(e) = system.shutdown().await {
        error!("Error during jobs shutdown: {}", e);
    }
    info!("Bye");
    Ok(())
}
