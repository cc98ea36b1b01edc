//! tally - vote reconciliation and score upkeep

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod output;

use cli::commands::helpers::StoreOptions;
use cli::commands::{
    run_init, run_recompute, run_reconcile, run_show, run_vote, run_worker, ReconcileTarget,
};
use cli::{Cli, Commands, LogFormat};
use output::OutputFormat;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let format = OutputFormat::from_json_flag(cli.json);
    let opts = StoreOptions {
        db: cli.db,
        redis_url: cli.redis_url,
        counter_timeout: Duration::from_millis(cli.counter_timeout_ms),
    };

    match cli.command {
        Commands::Init => run_init(&opts, format)?,

        Commands::Vote {
            voter_id,
            entity_id,
            intent,
        } => run_vote(&opts, voter_id, entity_id, intent, format)?,

        Commands::Show { entity_id, voter } => run_show(&opts, entity_id, voter, format)?,

        Commands::Reconcile {
            entity,
            dirty,
            batch,
        } => {
            let target = match (entity, dirty) {
                (Some(entity_id), _) => ReconcileTarget::Entity(entity_id),
                (None, true) => ReconcileTarget::Dirty { batch },
                (None, false) => ReconcileTarget::All,
            };
            run_reconcile(&opts, target, format)?;
        }

        Commands::Recompute { entity_id } => run_recompute(&opts, entity_id, format)?,

        Commands::Worker {
            drain_interval,
            sweep_interval,
            no_initial_sweep,
            run_for,
        } => run_worker(
            &opts,
            Duration::from_secs(drain_interval),
            Duration::from_secs(sweep_interval),
            !no_initial_sweep,
            run_for.map(Duration::from_secs),
        )?,
    }

    Ok(())
}

/// Logs go to stderr so stdout stays parseable. `RUST_LOG` overrides the
/// default filter.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,tally_core=info,tally=info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
