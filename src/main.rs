//! # drover
//!
//! Entry point of the demo engine.
//!
//! 1. **Tracing** - `RUST_LOG` filter, `info` by default
//! 2. **Configuration** - `--config` file or `DROVER_*` variables
//! 3. **Engine** - in-memory store, Value/Operator metamodel, worker pool
//! 4. **Shutdown** - Ctrl+C stops the pool and waits for the workers

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use drover::{Cli, DemoEngine, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if cli.dump_metamodel {
        let types = drover_demo::demo_types();
        let model = drover_demo::demo_metamodel(&types).context("Demo metamodel is invalid")?;
        print!("{}", model.dump());
        return Ok(());
    }

    let start_time = Instant::now();
    let config = load_config(&cli)?;
    info!(workers = config.workers, "drover starting");

    let engine = DemoEngine::start(config, cli.seed.as_deref(), cli.watch).await?;
    info!("drover started in {:?}. Press Ctrl+C to stop.", start_time.elapsed());

    wait_for_shutdown().await;
    engine.shutdown().await;
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
