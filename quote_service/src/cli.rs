//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// In-memory quote service
#[derive(Debug, Parser)]
#[command(name = "quote-server")]
#[command(about = "In-memory quote store served over HTTP")]
#[command(version)]
pub struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to (overrides server.host / server.port)
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Dispatcher worker count (overrides dispatcher.workers)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}
