//! System of record: canonical vote rows and entity aggregate columns.
//!
//! The trait is the contract the persistence layer fulfils; [`SqliteRecord`]
//! is the shipped implementation.

mod sqlite;

pub use sqlite::SqliteRecord;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{EntityId, VoteCounts, VoteDelta, VoteIntent, VoteTransition, VoteType, VoterId};
use crate::scoring::{Badge, EntityScores, ScoreBreakdown};

/// A stored vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteRow {
    pub vote_id: i64,
    pub voter_id: VoterId,
    pub entity_id: EntityId,
    pub vote_type: VoteType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a vote write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteWrite {
    /// The transaction committed (or had nothing to do).
    Applied(VoteTransition),
    /// A concurrent insert for the same (voter, entity) won the uniqueness
    /// race. Nothing was written; retrying will see that row and update it.
    Conflict,
}

/// Transactional access to votes, aggregates, scores and badges.
pub trait RecordStore: Send + Sync {
    fn entity_exists(&self, entity_id: EntityId) -> Result<bool>;

    fn voter_exists(&self, voter_id: VoterId) -> Result<bool>;

    fn find_vote(&self, voter_id: VoterId, entity_id: EntityId) -> Result<Option<VoteRow>>;

    /// Every vote a voter holds, for warming membership caches.
    fn votes_by_voter(&self, voter_id: VoterId) -> Result<Vec<(EntityId, VoteType)>>;

    /// Read the current row, apply `intent` and commit, all in one transaction.
    fn apply_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        intent: VoteIntent,
    ) -> Result<VoteWrite>;

    /// Authoritative tallies computed from vote rows.
    fn count_votes(&self, entity_id: EntityId) -> Result<VoteCounts>;

    /// Denormalized `upvotes`/`downvotes` columns, `None` if the entity is unknown.
    fn aggregate_counts(&self, entity_id: EntityId) -> Result<Option<VoteCounts>>;

    /// Incrementally adjust the aggregate columns (never below zero).
    fn adjust_aggregate_counts(&self, entity_id: EntityId, delta: VoteDelta) -> Result<()>;

    /// Overwrite the aggregate columns.
    fn write_aggregate_counts(&self, entity_id: EntityId, counts: VoteCounts) -> Result<()>;

    /// Entity ids greater than `after`, ascending, at most `limit`.
    fn entity_page(&self, after: EntityId, limit: usize) -> Result<Vec<EntityId>>;

    fn load_scores(&self, entity_id: EntityId) -> Result<Option<EntityScores>>;

    /// Persist score columns together with the audit breakdown.
    fn store_scores(
        &self,
        entity_id: EntityId,
        scores: &EntityScores,
        breakdown: &ScoreBreakdown,
    ) -> Result<()>;

    fn list_badges(&self, entity_id: EntityId) -> Result<Vec<Badge>>;
}
