//! Counter store double that lets tests interleave work with a service call.

use std::sync::{Arc, Mutex};

use super::{CounterStore, MemoryCounterStore, StoreResult};
use crate::model::{EntityId, VoteCounts, VoteDelta, VoteType, VoterId};

type Hook = Box<dyn FnOnce() + Send>;

/// Wraps a [`MemoryCounterStore`] and runs one-shot hooks inside selected
/// calls.
pub(crate) struct HookedCounter {
    pub(crate) inner: Arc<MemoryCounterStore>,
    before_read: Mutex<Option<Hook>>,
    after_delta: Mutex<Option<Hook>>,
}

impl HookedCounter {
    pub(crate) fn new(inner: Arc<MemoryCounterStore>) -> Self {
        Self {
            inner,
            before_read: Mutex::new(None),
            after_delta: Mutex::new(None),
        }
    }

    /// Run `hook` at the start of the next `get_vote_state`.
    pub(crate) fn before_next_read(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_read.lock().unwrap() = Some(Box::new(hook));
    }

    /// Run `hook` after the next `apply_vote_delta` has done its work.
    pub(crate) fn after_next_delta(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_delta.lock().unwrap() = Some(Box::new(hook));
    }

    fn fire(slot: &Mutex<Option<Hook>>) {
        let hook = slot.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl CounterStore for HookedCounter {
    fn get_vote_state(&self, entity_id: EntityId) -> StoreResult<Option<VoteCounts>> {
        Self::fire(&self.before_read);
        self.inner.get_vote_state(entity_id)
    }

    fn set_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<()> {
        self.inner.set_vote_state(entity_id, counts)
    }

    fn seed_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<VoteCounts> {
        self.inner.seed_vote_state(entity_id, counts)
    }

    fn apply_vote_delta(
        &self,
        entity_id: EntityId,
        delta: VoteDelta,
    ) -> StoreResult<Option<VoteCounts>> {
        let result = self.inner.apply_vote_delta(entity_id, delta);
        Self::fire(&self.after_delta);
        result
    }

    fn get_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
    ) -> StoreResult<Option<VoteType>> {
        self.inner.get_voter_vote(voter_id, entity_id)
    }

    fn record_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        vote_type: VoteType,
    ) -> StoreResult<()> {
        self.inner.record_voter_vote(voter_id, entity_id, vote_type)
    }

    fn clear_voter_vote(&self, voter_id: VoterId, entity_id: EntityId) -> StoreResult<()> {
        self.inner.clear_voter_vote(voter_id, entity_id)
    }

    fn voter_loaded(&self, voter_id: VoterId) -> StoreResult<bool> {
        self.inner.voter_loaded(voter_id)
    }

    fn load_voter(&self, voter_id: VoterId, votes: &[(EntityId, VoteType)]) -> StoreResult<()> {
        self.inner.load_voter(voter_id, votes)
    }

    fn mark_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        self.inner.mark_dirty(entity_id)
    }

    fn pop_dirty_batch(&self, max_n: usize) -> StoreResult<Vec<EntityId>> {
        self.inner.pop_dirty_batch(max_n)
    }

    fn clear_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        self.inner.clear_dirty(entity_id)
    }

    fn dirty_len(&self) -> StoreResult<usize> {
        self.inner.dirty_len()
    }
}
