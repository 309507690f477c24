//! Guidance Core
//!
//! Multi-sensor fusion, trajectory guidance, and an event-bridge pub/sub
//! client wired together behind one lifecycle-managed orchestrator.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bridge;
mod config;
mod control;
mod error;
mod fusion;
mod guidance;
mod math;
mod mission;
mod models;
mod planner;
mod sensors;

use config::Config;
use guidance::GuidanceOrchestrator;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guidance_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("starting guidance core");

    let config = Config::from_env();
    info!(?config, "loaded configuration");

    let orchestrator = GuidanceOrchestrator::new(config);

    if let Err(e) = orchestrator.start().await {
        error!(error = %e, "failed to start guidance core");
        return ExitCode::FAILURE;
    }

    info!("guidance core operational");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install signal handler");
        return ExitCode::FAILURE;
    }

    info!("shutdown signal received");
    if let Err(e) = orchestrator.stop().await {
        error!(error = %e, "error during shutdown");
        return ExitCode::FAILURE;
    }

    info!("guidance core shut down cleanly");
    ExitCode::SUCCESS
}
