//! Implementation of `tally worker` command.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::info;

use crate::cli::commands::helpers::{open_services_with, StoreOptions};

/// Run the reconcile worker in the foreground.
///
/// Runs until killed, or for `run_for` when given.
#[tracing::instrument(skip(opts))]
pub fn run_worker(
    opts: &StoreOptions,
    drain_interval: Duration,
    sweep_interval: Duration,
    initial_sweep: bool,
    run_for: Option<Duration>,
) -> Result<()> {
    let mut config = opts.config();
    config.drain_interval = drain_interval;
    config.sweep_interval = sweep_interval;
    config.sweep_on_start = initial_sweep;

    let services = open_services_with(opts, config)?;
    let worker = services.spawn_worker()?;

    let deadline = run_for.map(|limit| Instant::now() + limit);
    while !worker.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }

    worker.stop()?;
    info!("worker exited");
    Ok(())
}
