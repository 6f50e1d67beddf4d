//! pando-agent - one storage agent of a Pando mesh
//!
//! Usage:
//!   pando-agent --bind 10.0.0.5,0
//!   pando-agent --bind 10.0.0.6,0 --seed 10.0.0.5,0 --memory-gb 4
//!   pando-agent --config agent.yaml
//!
//! Logging follows `RUST_LOG` (default `info`) and goes to stderr.
//! SIGINT/SIGTERM stop the agent at its next poll.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

use pando::{spawn_agent, AgentArgs, AgentConfig, FilterCatalog, TcpTransport};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = AgentArgs::parse();
    let config = AgentConfig::from_args(&args).context("loading agent config")?;
    let budget = config.memory_budget();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        seed = ?config.seed.map(|s| s.to_string()),
        budget_bytes = budget.bytes,
        budget_detected = budget.detected,
        bundles = ?config.filter_bundles,
        "starting pando-agent"
    );

    let handle = spawn_agent(&config, Arc::new(TcpTransport::new()), Arc::new(FilterCatalog::builtin()))
        .with_context(|| format!("starting agent at {}", config.bind))?;

    let flag = handle.shutdown_flag();
    signal_hook::flag::register(SIGINT, Arc::clone(&flag)).context("registering SIGINT")?;
    signal_hook::flag::register(SIGTERM, flag).context("registering SIGTERM")?;

    handle.join().context("agent stopped with an error")?;
    tracing::info!("pando-agent exited");
    Ok(())
}
