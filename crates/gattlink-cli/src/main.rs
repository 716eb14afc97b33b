//! Gattlink CLI entry point

use clap::Parser;
use tracing::{error, info};

use gattlink_cli::{
    app::GattlinkApp,
    cli::Cli,
    commands::CommandDispatcher,
    config::AppConfig,
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = AppConfig::load(cli.config.as_deref())?;

    // Override the settings directory if specified
    if let Some(data_dir) = &cli.data_dir {
        config.state.state_dir = Some(data_dir.into());
    }

    let app = GattlinkApp::start(config)?;

    if let Err(e) = CommandDispatcher::execute(cli, app).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    info!("gattlink exited successfully");
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
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
