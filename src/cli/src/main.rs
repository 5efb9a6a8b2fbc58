//! Tarbox CLI entry point.

use clap::Parser;
use tarbox_core::TarboxConfig;
use tracing_subscriber::EnvFilter;

use tarbox_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    // Stdout may carry archive bytes, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match TarboxConfig::load_default() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = dispatch(cli, &config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
