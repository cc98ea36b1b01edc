//! Domain types shared by the counter store, the system of record and the
//! service layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a votable entity (project or itinerary).
pub type EntityId = i64;

/// Identifier of a voter (user).
pub type VoterId = i64;

/// A string did not name a known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Direction of a stored vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Up,
    Down,
}

impl VoteType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(ParseEnumError::new("vote type", other)),
        }
    }
}

/// What a voter asked for.
///
/// Re-sending the type already on record is a no-op; withdrawing a vote is
/// always the explicit `Retract` intent, never a repeated `Up`/`Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum VoteIntent {
    Up,
    Down,
    Retract,
}

impl VoteIntent {
    /// The vote that should be on record once this intent is applied.
    #[must_use]
    pub const fn target(self) -> Option<VoteType> {
        match self {
            Self::Up => Some(VoteType::Up),
            Self::Down => Some(VoteType::Down),
            Self::Retract => None,
        }
    }
}

impl fmt::Display for VoteIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
            Self::Retract => f.write_str("retract"),
        }
    }
}

impl FromStr for VoteIntent {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "retract" | "none" => Ok(Self::Retract),
            _ => Err(ParseEnumError::new("vote intent", s)),
        }
    }
}

/// Signed change to an entity's tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoteDelta {
    pub up: i64,
    pub down: i64,
}

impl VoteDelta {
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.up == 0 && self.down == 0
    }

    fn bump(&mut self, vote: VoteType, by: i64) {
        match vote {
            VoteType::Up => self.up += by,
            VoteType::Down => self.down += by,
        }
    }
}

/// Up/down tallies for one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    pub upvotes: u64,
    pub downvotes: u64,
}

impl VoteCounts {
    #[must_use]
    pub const fn new(upvotes: u64, downvotes: u64) -> Self {
        Self { upvotes, downvotes }
    }

    /// Apply a delta, saturating at zero.
    #[must_use]
    pub const fn apply(self, delta: VoteDelta) -> Self {
        Self {
            upvotes: self.upvotes.saturating_add_signed(delta.up),
            downvotes: self.downvotes.saturating_add_signed(delta.down),
        }
    }
}

/// Counts plus the requesting voter's own vote, as returned to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteState {
    pub upvotes: u64,
    pub downvotes: u64,
    pub your_vote: Option<VoteType>,
}

impl VoteState {
    #[must_use]
    pub const fn new(counts: VoteCounts, your_vote: Option<VoteType>) -> Self {
        Self {
            upvotes: counts.upvotes,
            downvotes: counts.downvotes,
            your_vote,
        }
    }

    #[must_use]
    pub const fn counts(&self) -> VoteCounts {
        VoteCounts::new(self.upvotes, self.downvotes)
    }
}

/// Before/after view of one voter's vote on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTransition {
    pub previous: Option<VoteType>,
    pub current: Option<VoteType>,
}

impl VoteTransition {
    #[must_use]
    pub const fn resolve(previous: Option<VoteType>, intent: VoteIntent) -> Self {
        Self {
            previous,
            current: intent.target(),
        }
    }

    #[must_use]
    pub fn is_change(&self) -> bool {
        self.previous != self.current
    }

    /// Counter delta implied by this transition.
    #[must_use]
    pub fn delta(&self) -> VoteDelta {
        let mut delta = VoteDelta::default();
        if !self.is_change() {
            return delta;
        }
        if let Some(previous) = self.previous {
            delta.bump(previous, -1);
        }
        if let Some(current) = self.current {
            delta.bump(current, 1);
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_parsing() {
        assert_eq!("up".parse::<VoteIntent>().unwrap(), VoteIntent::Up);
        assert_eq!(" Down ".parse::<VoteIntent>().unwrap(), VoteIntent::Down);
        assert_eq!("retract".parse::<VoteIntent>().unwrap(), VoteIntent::Retract);
        assert_eq!("none".parse::<VoteIntent>().unwrap(), VoteIntent::Retract);

        let err = "sideways".parse::<VoteIntent>().unwrap_err();
        assert_eq!(err.value, "sideways");
    }

    #[test]
    fn test_vote_type_roundtrip_strings() {
        assert_eq!(VoteType::Up.to_string(), "up");
        assert_eq!("down".parse::<VoteType>().unwrap(), VoteType::Down);
        assert!("UP".parse::<VoteType>().is_err());
        assert_eq!(VoteType::Up.opposite(), VoteType::Down);
    }

    #[test]
    fn test_transition_deltas() {
        let first = VoteTransition::resolve(None, VoteIntent::Up);
        assert_eq!(first.delta(), VoteDelta { up: 1, down: 0 });

        let flip = VoteTransition::resolve(Some(VoteType::Up), VoteIntent::Down);
        assert_eq!(flip.delta(), VoteDelta { up: -1, down: 1 });

        let retract = VoteTransition::resolve(Some(VoteType::Down), VoteIntent::Retract);
        assert_eq!(retract.delta(), VoteDelta { up: 0, down: -1 });

        let repeat = VoteTransition::resolve(Some(VoteType::Up), VoteIntent::Up);
        assert!(!repeat.is_change());
        assert!(repeat.delta().is_zero());

        let retract_nothing = VoteTransition::resolve(None, VoteIntent::Retract);
        assert!(retract_nothing.delta().is_zero());
    }

    #[test]
    fn test_counts_saturate_at_zero() {
        let counts = VoteCounts::new(0, 2).apply(VoteDelta { up: -1, down: -1 });
        assert_eq!(counts, VoteCounts::new(0, 1));
    }
}
