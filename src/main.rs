//! Plate Server - serves versioned map tiles from plate stores.
//!
//! This binary starts the HTTP server or a standalone message broker.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plate_server::{
    blob::FileBlobOpener,
    channel::Broker,
    config::{BrokerConfig, Cli, Command, ServeConfig},
    index::RemoteIndex,
    server::{create_router, RouterConfig},
    tile::TileService,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Serve(config) => run_serve(config).await,
        Command::Broker(config) => run_broker(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Configuration:");
    info!("  Index service: {}", config.index_url);
    info!(
        "  RPC: timeout {}ms, {} tries",
        config.rpc_timeout_ms, config.rpc_tries
    );
    info!("  Base path: {}", config.base_path);

    let index = match RemoteIndex::connect(
        &config.index_url,
        &config.client_name,
        config.rpc_timeout(),
        config.rpc_tries,
    )
    .await
    {
        Ok(index) => index,
        Err(e) => {
            error!("Failed to connect to index service at {}: {}", config.index_url, e);
            return ExitCode::FAILURE;
        }
    };

    let tile_service = TileService::new(index, FileBlobOpener);

    // A failed first sync is not fatal; the cache resyncs on the first miss.
    match tile_service.index_cache().resync().await {
        Ok(count) => info!("  Index cache: {} store(s)", count),
        Err(e) => warn!("  Initial index sync failed: {}", e),
    }

    let router = create_router(tile_service, build_router_config(&config));

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Server listening on: http://{}", addr);
    info!("  curl http://{}{}/status", addr, config.base_path);

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config = RouterConfig::new()
        .with_base_path(&config.base_path)
        .with_dem_url(&config.dem_url)
        .with_tracing(!config.no_tracing);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config
}

// =============================================================================
// Broker Command
// =============================================================================

async fn run_broker(config: BrokerConfig) -> ExitCode {
    init_logging(config.verbose);

    let (addr, handle) = match Broker::spawn(&config.listen).await {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Failed to bind broker to {}: {}", config.listen, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Broker listening on: {}", addr);

    if let Err(e) = handle.await {
        error!("Broker stopped: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "plate_server=debug,tower_http=debug"
    } else {
        "plate_server=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
