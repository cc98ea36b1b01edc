//! Score composition: badge table, validation blending and total clamping.
//!
//! Everything here is pure. The [`crate::core::scores`] service loads rows,
//! calls [`rebalance`] and persists the result.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EntityId, ParseEnumError};

/// Upper bound of the validation component (and of the AI producer's scale).
pub const VALIDATION_MAX: f64 = 30.0;

/// Validation points reserved for badges once an entity is in hybrid mode.
pub const BADGE_BUDGET: f64 = 20.0;

/// Upper bound of `total_score`.
pub const TOTAL_MAX: f64 = 100.0;

/// Human-awarded badge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeType {
    Tier1,
    Tier2,
    Tier3,
    Tier4,
    Demerit,
}

impl BadgeType {
    pub const ALL: [Self; 5] = [
        Self::Tier1,
        Self::Tier2,
        Self::Tier3,
        Self::Tier4,
        Self::Demerit,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
            Self::Tier3 => "tier3",
            Self::Tier4 => "tier4",
            Self::Demerit => "demerit",
        }
    }

    /// Display name used by the product.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Tier1 => "platinum",
            Self::Tier2 => "gold",
            Self::Tier3 => "silver",
            Self::Tier4 => "bronze",
            Self::Demerit => "demerit",
        }
    }

    /// Validation points a badge of this kind is worth.
    #[must_use]
    pub const fn points(self) -> f64 {
        match self {
            Self::Tier1 => 20.0,
            Self::Tier2 => 15.0,
            Self::Tier3 => 10.0,
            Self::Tier4 => 5.0,
            Self::Demerit => -10.0,
        }
    }
}

impl fmt::Display for BadgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BadgeType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|badge| badge.as_str() == s || badge.label() == s)
            .ok_or_else(|| ParseEnumError::new("badge type", s))
    }
}

/// A badge row as read from the system of record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Badge {
    pub badge_id: i64,
    pub entity_id: EntityId,
    pub badge_type: BadgeType,
    pub points: f64,
    pub created_at: DateTime<Utc>,
}

/// How the validation component is produced.
///
/// `AiOnly` until the first badge lands, then `Hybrid` for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    AiOnly,
    Hybrid,
}

impl ValidationMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AiOnly => "ai_only",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_only" => Ok(Self::AiOnly),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(ParseEnumError::new("validation mode", other)),
        }
    }
}

/// Score columns of one entity aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntityScores {
    pub quality: f64,
    pub verification: f64,
    pub validation: f64,
    pub community: f64,
    pub total: f64,
    pub mode: ValidationMode,
    /// Last AI-derived validation score on its native `0..=30` scale.
    pub ai_validation: Option<f64>,
}

impl EntityScores {
    /// Sum of the four components, clamped to `[0, TOTAL_MAX]`.
    #[must_use]
    pub fn component_sum(&self) -> f64 {
        clamp_total(self.quality + self.verification + self.validation + self.community)
    }
}

/// Audit record of how the validation component was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub mode: ValidationMode,
    pub ai_score: f64,
    pub ai_contribution: f64,
    pub badge_count: usize,
    pub badge_points: f64,
    pub badge_contribution: f64,
    pub validation: f64,
    pub total: f64,
}

/// Result of [`rebalance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rebalanced {
    pub scores: EntityScores,
    pub breakdown: ScoreBreakdown,
    /// True when this rebalance moved the entity from `AiOnly` to `Hybrid`.
    pub entered_hybrid: bool,
}

/// Blend an AI validation score with badge points.
///
/// Badges claim up to `badge_cap` points; the AI score is rescaled from
/// `0..=VALIDATION_MAX` into whatever budget is left. Demerits (negative
/// points) eat into the AI share. The result is clamped to
/// `[0, VALIDATION_MAX]`.
#[must_use]
pub fn blend(ai_score: f64, badge_points: f64, badge_cap: f64) -> f64 {
    let cap = badge_cap.clamp(0.0, VALIDATION_MAX);
    let ai = ai_score.clamp(0.0, VALIDATION_MAX);
    let badge = badge_points.min(cap);
    let ai_share = ai * (VALIDATION_MAX - cap) / VALIDATION_MAX;
    (badge + ai_share).clamp(0.0, VALIDATION_MAX)
}

/// Recompute validation and total for an entity given its current badges.
#[must_use]
pub fn rebalance(current: &EntityScores, badges: &[Badge]) -> Rebalanced {
    let entered_hybrid = current.mode == ValidationMode::AiOnly && !badges.is_empty();
    let mode = if entered_hybrid {
        ValidationMode::Hybrid
    } else {
        current.mode
    };

    // While AI-only the validation column is the AI score. Once hybrid, the
    // captured AI score is rescaled instead of the blended column.
    let ai_score = match current.mode {
        ValidationMode::AiOnly => current.validation,
        ValidationMode::Hybrid => current.ai_validation.unwrap_or(0.0),
    };

    let badge_points: f64 = badges.iter().map(|badge| badge.points).sum();

    let (validation, ai_contribution, badge_contribution) = match mode {
        ValidationMode::AiOnly => {
            let validation = ai_score.clamp(0.0, VALIDATION_MAX);
            (validation, validation, 0.0)
        }
        ValidationMode::Hybrid => {
            let validation = blend(ai_score, badge_points, BADGE_BUDGET);
            let ai_share = blend(ai_score, 0.0, BADGE_BUDGET);
            (validation, ai_share, validation - ai_share)
        }
    };

    let mut scores = EntityScores {
        validation,
        mode,
        ai_validation: Some(ai_score),
        ..*current
    };
    scores.total = scores.component_sum();

    Rebalanced {
        breakdown: ScoreBreakdown {
            mode,
            ai_score,
            ai_contribution,
            badge_count: badges.len(),
            badge_points,
            badge_contribution,
            validation,
            total: scores.total,
        },
        scores,
        entered_hybrid,
    }
}

fn clamp_total(total: f64) -> f64 {
    total.clamp(0.0, TOTAL_MAX)
}
