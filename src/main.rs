//! Local forwarding proxy binary
//!
//! Parses the CLI, wires up logging and the shared options, then runs the
//! accept loop until a shutdown signal arrives.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;

use localforward::config::CliArgs;
use localforward::core::ForwardServer;
use localforward::logger::{self, log, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(LogLevel::from_str(&cli.log_level));

    log::info!(
        host = %cli.host,
        port = cli.port,
        mode = %cli.mode,
        size = cli.size,
        "Starting localforward"
    );

    let server = Arc::new(ForwardServer::new(cli.server_config(), cli.options()));

    // Setup shutdown handler
    let server_for_shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received, stopping...");
        server_for_shutdown.shutdown();
    });

    // Run server
    server.serve().await
}
