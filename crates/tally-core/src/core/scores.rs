//! Score service: keep `total_score` and the validation component in step
//! with badges and AI validation results.

use serde::Serialize;
use tracing::info;

use crate::model::EntityId;
use crate::notify::{ChangeEvent, ChangePublisher};
use crate::record::RecordStore;
use crate::scoring::{rebalance, EntityScores, ScoreBreakdown, ValidationMode, VALIDATION_MAX};

use super::{validate_id, CoreError, CoreResult};

/// Result of a score recompute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreReport {
    pub entity_id: EntityId,
    pub scores: EntityScores,
    pub breakdown: ScoreBreakdown,
    pub entered_hybrid: bool,
}

impl ScoreReport {
    #[must_use]
    pub const fn total_score(&self) -> f64 {
        self.scores.total
    }
}

/// Service for score operations.
pub struct ScoreService<'a> {
    record: &'a dyn RecordStore,
    publisher: &'a dyn ChangePublisher,
}

impl<'a> ScoreService<'a> {
    pub(crate) fn new(record: &'a dyn RecordStore, publisher: &'a dyn ChangePublisher) -> Self {
        Self { record, publisher }
    }

    /// Re-blend validation with the entity's current badges and recompute
    /// the total. Call after any badge or component change.
    pub fn recompute_total(&self, entity_id: EntityId) -> CoreResult<ScoreReport> {
        validate_id("entity_id", entity_id)?;
        let current = self.load(entity_id)?;
        self.apply(entity_id, &current)
    }

    /// Store a fresh AI validation score (`0..=30`) and recompute.
    pub fn record_ai_validation(&self, entity_id: EntityId, score: f64) -> CoreResult<ScoreReport> {
        validate_id("entity_id", entity_id)?;
        if !score.is_finite() || !(0.0..=VALIDATION_MAX).contains(&score) {
            return Err(CoreError::invalid(format!(
                "AI validation score must be within 0..={VALIDATION_MAX}, got {score}"
            )));
        }

        let current = self.load(entity_id)?;
        let updated = EntityScores {
            validation: match current.mode {
                ValidationMode::AiOnly => score,
                ValidationMode::Hybrid => current.validation,
            },
            ai_validation: Some(score),
            ..current
        };
        self.apply(entity_id, &updated)
    }

    fn load(&self, entity_id: EntityId) -> CoreResult<EntityScores> {
        self.record
            .load_scores(entity_id)?
            .ok_or(CoreError::EntityNotFound { entity_id })
    }

    fn apply(&self, entity_id: EntityId, current: &EntityScores) -> CoreResult<ScoreReport> {
        let badges = self.record.list_badges(entity_id)?;
        let rebalanced = rebalance(current, &badges);

        self.record
            .store_scores(entity_id, &rebalanced.scores, &rebalanced.breakdown)?;

        if rebalanced.entered_hybrid {
            info!(
                entity_id,
                ai_validation = rebalanced.breakdown.ai_score,
                badges = badges.len(),
                "entity switched to hybrid validation"
            );
        }
        self.publisher.publish(ChangeEvent::ScoreChanged {
            entity_id,
            total_score: rebalanced.scores.total,
        });

        Ok(ScoreReport {
            entity_id,
            scores: rebalanced.scores,
            breakdown: rebalanced.breakdown,
            entered_hybrid: rebalanced.entered_hybrid,
        })
    }
}
