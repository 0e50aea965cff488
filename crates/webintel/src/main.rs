//! WebIntel: scheduled web resource monitoring
//!
//! Main binary with subcommands:
//! - `daemon`: Poll configured monitors on a schedule until interrupted
//! - `check`: Fetch one URL and print its fingerprint and analysis

use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod check;
mod daemon;
mod hooks;

use daemon::{DaemonConfig, MonitorSpec};
use webintel_monitor::{DEFAULT_FETCH_TIMEOUT, PipelineConfig};

#[derive(Parser)]
#[command(name = "webintel")]
#[command(about = "Scheduled web resource monitoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring daemon
    Daemon {
        /// Monitor to poll, as ID=URL. Repeat for several monitors.
        #[arg(
            long = "monitor",
            value_name = "ID=URL",
            env = "WEBINTEL_MONITORS",
            value_delimiter = ','
        )]
        monitors: Vec<MonitorSpec>,

        /// Seconds between the end of one poll and the start of the next
        #[arg(long, env = "WEBINTEL_INTERVAL", default_value_t = daemon::DEFAULT_INTERVAL_SECS)]
        interval: u64,

        /// Per-request fetch timeout in seconds
        #[arg(long, env = "WEBINTEL_FETCH_TIMEOUT", default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs())]
        fetch_timeout: u64,

        /// Retries of a failed poll before giving up until the next interval
        #[arg(long, env = "WEBINTEL_FETCH_RETRIES", default_value = "0")]
        fetch_retries: u32,

        /// Seconds to wait between retries
        #[arg(long, env = "WEBINTEL_RETRY_BACKOFF", default_value = "0")]
        retry_backoff: u64,

        /// Retries of a failed analysis job
        #[arg(long, env = "WEBINTEL_ANALYSIS_RETRIES", default_value = "0")]
        analysis_retries: u32,
    },

    /// Fetch a URL once and print its fingerprint and analysis as JSON
    Check {
        /// URL to fetch
        #[arg(value_name = "URL")]
        url: String,

        /// Per-request fetch timeout in seconds
        #[arg(long, env = "WEBINTEL_FETCH_TIMEOUT", default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs())]
        fetch_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webintel=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            monitors,
            interval,
            fetch_timeout,
            fetch_retries,
            retry_backoff,
            analysis_retries,
        } => {
            daemon::run(DaemonConfig {
                monitors,
                interval: Duration::from_secs(interval),
                pipeline: PipelineConfig {
                    fetch_timeout: Duration::from_secs(fetch_timeout),
                    fetch_retries,
                    fetch_backoff: Duration::from_secs(retry_backoff),
                    analysis_retries,
                    analysis_backoff: Duration::from_secs(retry_backoff),
                },
            })
            .await
        }

        Commands::Check { url, fetch_timeout } => {
            check::run(&url, Duration::from_secs(fetch_timeout)).await
        }
    }
}
