//! Sandbox Relay - streams Claude worker output to clients over SSE.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sandbox_relay::config::{Credentials, ServerConfig, WorkerConfig, DEFAULT_PORT};
use sandbox_relay::server::{self, AppState};

#[derive(Parser)]
#[command(
    name = "sandbox-relay",
    about = "Streams Claude worker output to clients over SSE",
    version
)]
struct Cli {
    /// Host address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Worker command line (program followed by fixed arguments).
    #[arg(long = "worker-cmd")]
    worker_cmd: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
    };
    let worker = cli
        .worker_cmd
        .as_deref()
        .map_or_else(WorkerConfig::default, WorkerConfig::from_command_line);

    // Credentials are read per request; warn early so the operator
    // learns about a misconfigured environment before the first 500.
    if Credentials::from_env().is_err() {
        tracing::warn!("API credentials not set; /api/generate will return 500");
    }

    tracing::info!(
        address = %config.address(),
        worker = %worker.program,
        "Starting sandbox relay"
    );

    if let Err(e) = server::run(&config, AppState::new(worker)).await {
        tracing::error!(error = %e, "Relay server failed");
        std::process::exit(1);
    }
}
