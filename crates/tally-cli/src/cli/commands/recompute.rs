//! Implementation of `tally recompute` command.

use anyhow::Result;
use serde::Serialize;

use tally_core::scoring::ValidationMode;

use crate::cli::commands::helpers::{open_services, StoreOptions};
use crate::output::{Formatter, OutputFormat};

#[derive(Serialize)]
struct RecomputeOutput {
    entity_id: i64,
    total_score: f64,
    validation_score: f64,
    validation_mode: ValidationMode,
    ai_validation_score: Option<f64>,
    badge_count: usize,
    badge_points: f64,
    entered_hybrid: bool,
}

/// Run the recompute command.
#[tracing::instrument(skip(opts, format))]
pub fn run_recompute(opts: &StoreOptions, entity_id: i64, format: OutputFormat) -> Result<()> {
    let services = open_services(opts)?;
    let report = services.recompute_total(entity_id)?;

    Formatter::new(format).print(&RecomputeOutput {
        entity_id,
        total_score: report.scores.total,
        validation_score: report.scores.validation,
        validation_mode: report.scores.mode,
        ai_validation_score: report.scores.ai_validation,
        badge_count: report.breakdown.badge_count,
        badge_points: report.breakdown.badge_points,
        entered_hybrid: report.entered_hybrid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands::helpers::{fixtures::seeded, open_record};
    use tally_core::record::RecordStore;
    use tally_core::scoring::BadgeType;

    #[test]
    fn test_recompute_with_badge() {
        let (_dir, opts) = seeded(0, 1);
        let record = open_record(&opts.db, &opts.config()).unwrap();
        record.set_component_scores(1, 20.0, 25.0, 18.0, 10.0).unwrap();
        record.award_badge(1, BadgeType::Tier2).unwrap();

        run_recompute(&opts, 1, OutputFormat::Json).unwrap();

        let scores = record.load_scores(1).unwrap().unwrap();
        assert_eq!(scores.mode, ValidationMode::Hybrid);
        assert!((scores.total - 76.0).abs() < 1e-9);
    }
}
