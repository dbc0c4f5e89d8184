//! swe-harness CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swe_harness::harness::HarnessConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = swe_harness::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > config log_level > "info"
    let log_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| cli.log_level.clone())
        .or_else(|| {
            cli.config_path()
                .and_then(|path| HarnessConfig::from_file(path).ok())
                .and_then(|config| config.log_level)
        })
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    swe_harness::cli::run_with_cli(cli).await
}
