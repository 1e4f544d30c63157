mod aggregator;
mod cache;
mod config;
mod error;
mod event;
mod handlers;
mod ingestor;
mod pruner;
mod ranker;
mod recovery;
mod registry;
mod reporter;
mod snapshot;
mod storage;
mod tally;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use aggregator::Aggregator;
use config::{Args, AggregatorConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AggregatorConfig::from(Args::parse());
    let shutting_down = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&shutting_down));

    let aggregator = match Aggregator::new(config, shutting_down) {
        Ok(aggregator) => aggregator,
        Err(e) => {
            tracing::error!(error = %e, "failed to open storage, exiting");
            return std::process::ExitCode::FAILURE;
        }
    };

    match aggregator.run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "aggregator exited with error");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Registers SIGINT/SIGTERM to flip the shutdown flag directly, without a
/// dedicated handler thread. The aggregator's own select loop notices the
/// flag on its next iteration and drains.
fn install_signal_handlers(shutting_down: Arc<AtomicBool>) {
    for sig in signal_hook::consts::TERM_SIGNALS {
        if let Err(e) = signal_hook::flag::register(*sig, Arc::clone(&shutting_down)) {
            tracing::warn!(error = %e, signal = sig, "failed to install signal handler");
        }
    }
}
