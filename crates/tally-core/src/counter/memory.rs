//! In-process counter store backed by sharded concurrent maps.
//!
//! Used by tests and by single-process deployments without Redis. Per-key
//! atomicity comes from holding a `DashMap` shard guard for the whole
//! read-modify-write.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

use super::{CounterStore, StoreError, StoreResult};
use crate::model::{EntityId, VoteCounts, VoteDelta, VoteType, VoterId};

#[derive(Debug, Default)]
struct Membership {
    up: HashSet<EntityId>,
    down: HashSet<EntityId>,
    loaded: bool,
}

impl Membership {
    fn set_mut(&mut self, vote_type: VoteType) -> &mut HashSet<EntityId> {
        match vote_type {
            VoteType::Up => &mut self.up,
            VoteType::Down => &mut self.down,
        }
    }
}

/// Counter store living in process memory.
#[derive(Debug)]
pub struct MemoryCounterStore {
    tallies: DashMap<EntityId, VoteCounts>,
    voters: DashMap<VoterId, Membership>,
    dirty: Mutex<BTreeSet<EntityId>>,
    available: AtomicBool,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tallies: DashMap::new(),
            voters: DashMap::new(),
            dirty: Mutex::new(BTreeSet::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails fast.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Forget all cached tallies and memberships (the pending-sync set stays).
    pub fn flush(&self) {
        self.tallies.clear();
        self.voters.clear();
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    fn dirty_set(&self) -> StoreResult<std::sync::MutexGuard<'_, BTreeSet<EntityId>>> {
        self.dirty
            .lock()
            .map_err(|_| StoreError::Unavailable("pending-sync lock poisoned".to_string()))
    }
}

impl CounterStore for MemoryCounterStore {
    fn get_vote_state(&self, entity_id: EntityId) -> StoreResult<Option<VoteCounts>> {
        self.ensure_available()?;
        Ok(self.tallies.get(&entity_id).map(|counts| *counts))
    }

    fn set_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<()> {
        self.ensure_available()?;
        self.tallies.insert(entity_id, counts);
        Ok(())
    }

    fn seed_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<VoteCounts> {
        self.ensure_available()?;
        let held = *self.tallies.entry(entity_id).or_insert(counts);
        Ok(held)
    }

    fn apply_vote_delta(
        &self,
        entity_id: EntityId,
        delta: VoteDelta,
    ) -> StoreResult<Option<VoteCounts>> {
        self.ensure_available()?;
        Ok(self.tallies.get_mut(&entity_id).map(|mut counts| {
            *counts = counts.apply(delta);
            *counts
        }))
    }

    fn get_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
    ) -> StoreResult<Option<VoteType>> {
        self.ensure_available()?;
        Ok(self.voters.get(&voter_id).and_then(|membership| {
            if membership.up.contains(&entity_id) {
                Some(VoteType::Up)
            } else if membership.down.contains(&entity_id) {
                Some(VoteType::Down)
            } else {
                None
            }
        }))
    }

    fn record_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        vote_type: VoteType,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        let mut membership = self.voters.entry(voter_id).or_default();
        membership.set_mut(vote_type.opposite()).remove(&entity_id);
        membership.set_mut(vote_type).insert(entity_id);
        Ok(())
    }

    fn clear_voter_vote(&self, voter_id: VoterId, entity_id: EntityId) -> StoreResult<()> {
        self.ensure_available()?;
        if let Some(mut membership) = self.voters.get_mut(&voter_id) {
            membership.up.remove(&entity_id);
            membership.down.remove(&entity_id);
        }
        Ok(())
    }

    fn voter_loaded(&self, voter_id: VoterId) -> StoreResult<bool> {
        self.ensure_available()?;
        Ok(self
            .voters
            .get(&voter_id)
            .is_some_and(|membership| membership.loaded))
    }

    fn load_voter(&self, voter_id: VoterId, votes: &[(EntityId, VoteType)]) -> StoreResult<()> {
        self.ensure_available()?;
        let mut membership = Membership {
            loaded: true,
            ..Membership::default()
        };
        for &(entity_id, vote_type) in votes {
            membership.set_mut(vote_type).insert(entity_id);
        }
        self.voters.insert(voter_id, membership);
        Ok(())
    }

    fn mark_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        self.ensure_available()?;
        self.dirty_set()?.insert(entity_id);
        Ok(())
    }

    fn pop_dirty_batch(&self, max_n: usize) -> StoreResult<Vec<EntityId>> {
        self.ensure_available()?;
        let mut dirty = self.dirty_set()?;
        let mut batch = Vec::with_capacity(max_n.min(dirty.len()));
        while batch.len() < max_n {
            match dirty.pop_first() {
                Some(entity_id) => batch.push(entity_id),
                None => break,
            }
        }
        Ok(batch)
    }

    fn clear_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        self.ensure_available()?;
        self.dirty_set()?.remove(&entity_id);
        Ok(())
    }

    fn dirty_len(&self) -> StoreResult<usize> {
        self.ensure_available()?;
        Ok(self.dirty_set()?.len())
    }
}
