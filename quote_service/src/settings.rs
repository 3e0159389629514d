//! Configuration management with file layering and environment variable support.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_size_kb: usize,
    /// Empty list disables CORS; `"*"` allows any origin
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_request_size_kb: 64,
            cors_origins: Vec::new(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1_024,
            task_timeout_ms: 5_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub dispatcher: DispatcherSettings,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, `quotes.toml` (or `path`), and `QUOTES__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default settings
            .add_source(File::from_str(
                include_str!("../config.toml"),
                FileFormat::Toml,
            ));

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("quotes").required(false)),
        };

        let config = builder
            // e.g. QUOTES__DISPATCHER__WORKERS=16
            .add_source(
                Environment::with_prefix("QUOTES")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.server.max_request_size_kb == 0 {
            return Err(anyhow!("Max request size cannot be 0"));
        }
        if self.dispatcher.workers == 0 {
            return Err(anyhow!("Dispatcher needs at least one worker"));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(anyhow!("Dispatcher queue capacity cannot be 0"));
        }
        if self.dispatcher.task_timeout_ms == 0 {
            return Err(anyhow!("Dispatcher task timeout cannot be 0"));
        }
        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => return Err(anyhow!("Unknown log format '{}', expected 'text' or 'json'", other)),
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|e| anyhow!("Invalid server host '{}': {}", self.server.host, e))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.dispatcher.workers,
            queue_capacity: self.dispatcher.queue_capacity,
            task_timeout: Duration::from_millis(self.dispatcher.task_timeout_ms),
        }
    }

    /// Apply a `--addr` override from the command line
    pub fn set_socket_addr(&mut self, addr: SocketAddr) {
        self.server.host = addr.ip().to_string();
        self.server.port = addr.port();
    }
}
