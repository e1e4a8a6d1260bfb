//! CLI entry point for the Muni times service.
//!
//! Provides subcommands for a one-off fetch of a single stop, a long-running
//! watch over every configured stop, and an API key connection check.

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use muni_times::config::{API_KEY_ENV, ServiceConfig, StopConfig};
use muni_times::entity::StopEntity;
use muni_times::fetch::connect;
use muni_times::model::{ErrorKind, Freshness};
use muni_times::orchestrator::{AuthAlarm, ConfigSnapshot, Handle, StopPoller, StopStatus};
use muni_times::output::{ArrivalRecord, append_records, print_json, print_pretty};
use std::ffi::OsStr;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const DEFAULT_TEST_STOP: &str = "13543";

#[derive(Parser)]
#[command(name = "muni_times")]
#[command(about = "Real-time arrival predictions for 511.org transit stops", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and print arrivals for one stop
    Fetch {
        /// Upstream stop code, e.g. 13543
        #[arg(value_name = "STOP_CODE")]
        stop_code: String,

        /// JSON config file
        #[arg(short, long, default_value = "muni_times.json")]
        config: String,

        /// Print the entity as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Poll every configured stop and print each update
    Watch {
        /// JSON config file
        #[arg(short, long, default_value = "muni_times.json")]
        config: String,

        /// Optional: CSV file to append arrival rows to
        #[arg(short, long)]
        output: Option<String>,

        /// Number of updates to print before exiting (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value_t = 0)]
        num_updates: usize,
    },
    /// Check that the API key is accepted
    TestConnection {
        /// Stop to query (default: first configured stop, else 13543)
        #[arg(value_name = "STOP_CODE")]
        stop_code: Option<String>,

        /// JSON config file
        #[arg(short, long, default_value = "muni_times.json")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/muni_times.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("muni_times.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            stop_code,
            config,
            json,
        } => {
            let config = with_stop(load_config(&config)?, &stop_code);
            let status = poll_stop(config.clone(), &stop_code).await?;
            let stop = config.stop(&stop_code).cloned().unwrap_or_else(|| StopConfig::new(&stop_code));
            let entity = StopEntity::from_status(&status, &stop);
            if json {
                print_json(&entity)?;
            } else {
                print_pretty(&entity);
            }
        }
        Commands::Watch {
            config,
            output,
            num_updates,
        } => {
            watch(load_config(&config)?, output.as_deref(), num_updates).await?;
        }
        Commands::TestConnection { stop_code, config } => {
            let config = load_config(&config)?;
            let stop_code = stop_code
                .or_else(|| config.stops.first().map(|s| s.stop_code.clone()))
                .unwrap_or_else(|| DEFAULT_TEST_STOP.to_string());
            let status = poll_stop(with_stop(config, &stop_code), &stop_code).await?;

            match (&status.snapshot.freshness, &status.snapshot.error) {
                (Freshness::Fresh, _) => {
                    info!(%stop_code, lines = status.snapshot.lines.len(), "Connection ok")
                }
                (_, Some(reason)) if reason.kind == ErrorKind::AuthError => {
                    bail!("API key rejected: {}", reason.message)
                }
                (_, Some(reason)) => bail!("connection test failed: {}", reason.message),
                (_, None) => bail!("connection test failed"),
            }
        }
    }

    Ok(())
}

/// Reads the config file, or builds one from the environment when there is none.
fn load_config(path: &str) -> Result<ServiceConfig> {
    if Path::new(path).exists() {
        info!(path, "Loading configuration");
        return Ok(ServiceConfig::load(path)?);
    }
    warn!(path, "Config file not found, using defaults and {}", API_KEY_ENV);
    let mut config = ServiceConfig::default();
    config.apply_env();
    Ok(config)
}

/// Adds `stop_code` to the config if it is not already configured.
fn with_stop(mut config: ServiceConfig, stop_code: &str) -> ServiceConfig {
    if config.stop(stop_code).is_none() {
        config.stops.push(StopConfig::new(stop_code));
    }
    config
}

/// Runs a single poll cycle for one stop.
#[tracing::instrument(skip(config))]
async fn poll_stop(config: ServiceConfig, stop_code: &str) -> Result<StopStatus> {
    let ctx = ConfigSnapshot::build(1, config, &connect)?;
    let Some(stop) = ctx.config.stop(stop_code).cloned() else {
        bail!("stop {stop_code} is not configured");
    };
    let mut poller = StopPoller::new(&stop, &ctx.config.agency);
    Ok(poller.poll_once(&ctx, &stop, &AuthAlarm::default()).await)
}

/// Starts the service and prints updates until Ctrl+C or `num_updates` is reached.
async fn watch(config: ServiceConfig, output: Option<&str>, num_updates: usize) -> Result<()> {
    if config.stops.is_empty() {
        bail!("no stops configured");
    }
    let handle = Handle::start(config)?;
    let mut updates = handle.subscribe();
    let mut seen = 0usize;

    if num_updates == 0 {
        info!("Watching until Ctrl+C");
    } else {
        info!(num_updates, "Watching");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            update = updates.recv() => match update {
                Ok(status) => {
                    let config = handle.config();
                    let stop = config
                        .stop(&status.snapshot.stop_code)
                        .cloned()
                        .unwrap_or_else(|| StopConfig::new(&status.snapshot.stop_code));
                    let entity = StopEntity::from_status(&status, &stop);
                    info!(
                        stop_code = %status.snapshot.stop_code,
                        state = %entity.state,
                        stale = entity.attributes.stale,
                        "Update"
                    );
                    if let Some(path) = output {
                        let rows = ArrivalRecord::from_snapshot(&status.snapshot, Utc::now());
                        if let Err(e) = append_records(path, &rows) {
                            error!(error = %e, "Failed to write CSV rows");
                        }
                    }
                    seen += 1;
                    if num_updates > 0 && seen >= num_updates {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped updates"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    print_json(&handle.diagnostics().await)?;
    handle.stop().await;
    Ok(())
}
