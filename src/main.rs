//! asset-cache: distributed build-artifact cache server.
//!
//! Serves the chunked cache protocol over TCP, keeps artifacts in a
//! capacity-bounded store persisted under the storage root, and can chain
//! to an upstream cache server.

use clap::Parser;
use tracing::info;

use asset_cache::config::{Cli, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "asset_cache=debug,tower_http=debug"
    } else {
        "asset_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("asset-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?.with_cli_overrides(&cli);

    info!(
        listen = %config.server.listen_addr(),
        root = %config.storage.root.display(),
        capacity_bytes = config.storage.capacity_bytes,
        max_items = config.storage.max_items,
        eviction = ?config.storage.eviction,
        upstream = ?config.upstream.as_ref().map(|u| u.addr()),
        "Configuration loaded"
    );

    // Start the server.
    let server = asset_cache::start(config).await?;
    info!(addr = %server.local_addr(), "Cache server running");
    if let Some(admin) = server.admin_addr() {
        info!("Admin API on http://{admin}");
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    server.shutdown().await?;

    Ok(())
}
