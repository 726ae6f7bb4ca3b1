//! Configuration management for the plate server.
//!
//! This module provides a configuration system that supports:
//! - Command-line arguments via clap
//! - Environment variables with `PLATE_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Environment Variables
//!
//! - `PLATE_HOST` - Server bind address (default: 0.0.0.0)
//! - `PLATE_PORT` - Server port (default: 3000)
//! - `PLATE_INDEX_URL` - Channel address of the index service
//! - `PLATE_CLIENT_NAME` - Base identity of the RPC client (default: plate_server)
//! - `PLATE_RPC_TIMEOUT_MS` - Per-attempt RPC timeout (default: 1000)
//! - `PLATE_RPC_TRIES` - RPC attempts before giving up (default: 5)
//! - `PLATE_BASE_PATH` - Mount point of the HTTP routes (default: /wwt)
//! - `PLATE_DEM_URL` - `DemUrl` advertised in WTML listings
//! - `PLATE_CORS_ORIGINS` - Allowed CORS origins, comma-separated
//! - `PLATE_BROKER_LISTEN` - Listen address of the `broker` command

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::channel::{ChannelAddress, DEFAULT_BROKER_PORT};
use crate::rpc::{DEFAULT_RPC_TIMEOUT, DEFAULT_RPC_TRIES};
use crate::server::wtml::DEFAULT_DEM_URL;
use crate::server::DEFAULT_BASE_PATH;

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default address of the index service.
pub const DEFAULT_INDEX_URL: &str = "broker://127.0.0.1:5672/index/index";

/// Default base identity of the RPC client.
pub const DEFAULT_CLIENT_NAME: &str = "plate_server";

/// Upper bound on the per-attempt RPC timeout (one minute).
pub const MAX_RPC_TIMEOUT_MS: u64 = 60_000;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Plate Server - serves versioned map tiles from plate stores.
#[derive(Parser, Debug, Clone)]
#[command(name = "plate-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve tiles over HTTP
    Serve(ServeConfig),

    /// Run a standalone message broker for `broker://` channels
    Broker(BrokerConfig),
}

/// Options of the `serve` command.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "PLATE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PLATE_PORT")]
    pub port: u16,

    /// Mount point of the status and plate routes.
    #[arg(long, default_value = DEFAULT_BASE_PATH, env = "PLATE_BASE_PATH")]
    pub base_path: String,

    // =========================================================================
    // Index Service
    // =========================================================================
    /// Channel address of the index service
    /// (`broker://`, `tcp://`, `ipc://` or `inproc://`).
    #[arg(long, default_value = DEFAULT_INDEX_URL, env = "PLATE_INDEX_URL")]
    pub index_url: String,

    /// Base identity of the RPC client; made unique per process.
    #[arg(long, default_value = DEFAULT_CLIENT_NAME, env = "PLATE_CLIENT_NAME")]
    pub client_name: String,

    /// Per-attempt RPC timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT.as_millis() as u64, env = "PLATE_RPC_TIMEOUT_MS")]
    pub rpc_timeout_ms: u64,

    /// RPC attempts before a call fails.
    #[arg(long, default_value_t = DEFAULT_RPC_TRIES, env = "PLATE_RPC_TRIES")]
    pub rpc_tries: u32,

    // =========================================================================
    // Listing Configuration
    // =========================================================================
    /// `DemUrl` advertised in WTML listings.
    #[arg(long, default_value = DEFAULT_DEM_URL, env = "PLATE_DEM_URL")]
    pub dem_url: String,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "PLATE_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        ChannelAddress::parse(&self.index_url)
            .map_err(|e| format!("Invalid index URL '{}': {}", self.index_url, e))?;

        if self.client_name.trim().is_empty() {
            return Err(
                "Client name is required. Set --client-name or PLATE_CLIENT_NAME".to_string(),
            );
        }

        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms > MAX_RPC_TIMEOUT_MS {
            return Err(format!(
                "rpc_timeout_ms must be between 1 and {MAX_RPC_TIMEOUT_MS}"
            ));
        }

        if self.rpc_tries == 0 {
            return Err("rpc_tries must be greater than 0".to_string());
        }

        if !self.base_path.is_empty() && !self.base_path.starts_with('/') {
            return Err(format!(
                "base_path must start with '/', got '{}'",
                self.base_path
            ));
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Options of the `broker` command.
#[derive(Args, Debug, Clone)]
pub struct BrokerConfig {
    /// Address to accept broker connections on.
    #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_BROKER_PORT}"), env = "PLATE_BROKER_LISTEN")]
    pub listen: String,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

// =============================================================================
// Tests
// =============================================================================
