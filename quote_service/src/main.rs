//! Main entry point for the quote server CLI.

use anyhow::{Context, Result};
use clap::Parser;
use quote_service::{cli, server, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let mut settings = Settings::load(args.config.as_deref())?;

    match args.command {
        cli::Commands::Serve { addr, workers } => {
            if let Some(addr) = addr {
                settings.set_socket_addr(addr);
            }
            if let Some(workers) = workers {
                settings.dispatcher.workers = workers;
            }
            settings.validate()?;

            telemetry::init(&settings.logging)?;
            server::serve(&settings).await
        }
        cli::Commands::ShowConfig => {
            let rendered =
                toml::to_string_pretty(&settings).context("Failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}
