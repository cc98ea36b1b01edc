//! Implementation of `tally reconcile` command.

use anyhow::Result;
use serde::Serialize;

use tally_core::core::ReconcileSummary;

use crate::cli::commands::helpers::{open_services, StoreOptions};
use crate::output::{Formatter, OutputFormat};

/// What to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTarget {
    /// Full sweep over every entity.
    All,
    /// One entity.
    Entity(i64),
    /// Up to `batch` entities from the pending-sync set.
    Dirty { batch: usize },
}

#[derive(Serialize)]
struct SummaryOutput {
    scope: &'static str,
    entities_checked: u64,
    entities_corrected: u64,
    entities_failed: u64,
    duration_ms: u64,
}

impl SummaryOutput {
    fn new(scope: &'static str, summary: &ReconcileSummary) -> Self {
        Self {
            scope,
            entities_checked: summary.entities_checked,
            entities_corrected: summary.entities_corrected,
            entities_failed: summary.entities_failed,
            duration_ms: u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Serialize)]
struct EntityOutput {
    entity_id: i64,
    upvotes: u64,
    downvotes: u64,
    aggregate_corrected: bool,
    cache_corrected: bool,
}

/// Run the reconcile command.
#[tracing::instrument(skip(opts, format))]
pub fn run_reconcile(opts: &StoreOptions, target: ReconcileTarget, format: OutputFormat) -> Result<()> {
    let services = open_services(opts)?;
    let formatter = Formatter::new(format);

    match target {
        ReconcileTarget::All => {
            let summary = services.reconcile_all()?;
            formatter.print(&SummaryOutput::new("all", &summary))
        }
        ReconcileTarget::Dirty { batch } => {
            let summary = services.drain_dirty(batch)?;
            formatter.print(&SummaryOutput::new("dirty", &summary))
        }
        ReconcileTarget::Entity(entity_id) => {
            let outcome = services.reconcile(entity_id)?;
            formatter.print(&EntityOutput {
                entity_id: outcome.entity_id,
                upvotes: outcome.counts.upvotes,
                downvotes: outcome.counts.downvotes,
                aggregate_corrected: outcome.aggregate_corrected,
                cache_corrected: outcome.cache_corrected,
            })
        }
    }
}
