//! Counter store for single-host deployments without Redis.
//!
//! Tallies and memberships live in process memory and start cold in every
//! process. The pending-sync set is kept in the SQLite record, so a mark left
//! by `tally vote` is still there for the next `tally reconcile --dirty` or
//! worker drain.

use std::sync::Arc;

use super::{CounterStore, MemoryCounterStore, StoreError, StoreResult};
use crate::model::{EntityId, VoteCounts, VoteDelta, VoteType, VoterId};
use crate::record::SqliteRecord;

/// In-process tallies with a durable pending-sync set.
#[derive(Debug)]
pub struct LocalCounterStore {
    cache: MemoryCounterStore,
    record: Arc<SqliteRecord>,
}

impl LocalCounterStore {
    #[must_use]
    pub fn new(record: Arc<SqliteRecord>) -> Self {
        Self {
            cache: MemoryCounterStore::new(),
            record,
        }
    }

    /// The in-memory half holding tallies and memberships.
    #[must_use]
    pub const fn cache(&self) -> &MemoryCounterStore {
        &self.cache
    }
}

fn pending_error(err: &anyhow::Error) -> StoreError {
    StoreError::Unavailable(format!("pending-sync table: {err:#}"))
}

impl CounterStore for LocalCounterStore {
    fn get_vote_state(&self, entity_id: EntityId) -> StoreResult<Option<VoteCounts>> {
        self.cache.get_vote_state(entity_id)
    }

    fn set_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<()> {
        self.cache.set_vote_state(entity_id, counts)
    }

    fn seed_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<VoteCounts> {
        self.cache.seed_vote_state(entity_id, counts)
    }

    fn apply_vote_delta(
        &self,
        entity_id: EntityId,
        delta: VoteDelta,
    ) -> StoreResult<Option<VoteCounts>> {
        self.cache.apply_vote_delta(entity_id, delta)
    }

    fn get_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
    ) -> StoreResult<Option<VoteType>> {
        self.cache.get_voter_vote(voter_id, entity_id)
    }

    fn record_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        vote_type: VoteType,
    ) -> StoreResult<()> {
        self.cache.record_voter_vote(voter_id, entity_id, vote_type)
    }

    fn clear_voter_vote(&self, voter_id: VoterId, entity_id: EntityId) -> StoreResult<()> {
        self.cache.clear_voter_vote(voter_id, entity_id)
    }

    fn voter_loaded(&self, voter_id: VoterId) -> StoreResult<bool> {
        self.cache.voter_loaded(voter_id)
    }

    fn load_voter(&self, voter_id: VoterId, votes: &[(EntityId, VoteType)]) -> StoreResult<()> {
        self.cache.load_voter(voter_id, votes)
    }

    fn mark_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        self.record
            .mark_pending(entity_id)
            .map_err(|e| pending_error(&e))
    }

    fn pop_dirty_batch(&self, max_n: usize) -> StoreResult<Vec<EntityId>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        self.record
            .pop_pending(max_n)
            .map_err(|e| pending_error(&e))
    }

    fn clear_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        self.record
            .clear_pending(entity_id)
            .map_err(|e| pending_error(&e))
    }

    fn dirty_len(&self) -> StoreResult<usize> {
        self.record.pending_len().map_err(|e| pending_error(&e))
    }
}
