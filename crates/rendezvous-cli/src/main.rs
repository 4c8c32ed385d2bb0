//! `rendezvous` binary entry point

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use rendezvous_cli::{App, AppConfig, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref(), &cli.overrides())
        .context("Failed to load configuration")?;
    setup_logging(config.cli.verbose);
    debug!("Effective configuration: {:?}", config);

    App::new(config)
        .execute(cli.command)
        .await
        .context("Command failed")?;
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
