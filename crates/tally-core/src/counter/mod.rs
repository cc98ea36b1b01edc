//! Counter store: the fast, auxiliary side of the write-through cache.
//!
//! Holds three kinds of data, none of which is a source of truth:
//!
//! - per-entity tallies (`{upvotes, downvotes}`)
//! - per-voter membership sets (entities upvoted / downvoted)
//! - the pending-sync set of entities whose tallies moved since the last
//!   write-through
//!
//! Every call fails fast with a [`StoreError`]. Callers treat that as a
//! cache outage and fall back to the system of record.

mod local;
mod memory;
mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

pub use self::local::LocalCounterStore;
pub use self::memory::MemoryCounterStore;
pub use self::redis_store::RedisCounterStore;

use std::time::Duration;

use thiserror::Error;

use crate::model::{EntityId, VoteCounts, VoteDelta, VoteType, VoterId};

/// Result type for counter store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Counter store failures. All of them are transient from the core's view.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the call.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured timeout.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value could not be interpreted.
    #[error("corrupt counter store value at {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

/// Operations the vote engine and reconciler need from the cache.
///
/// Mutations are atomic per key; implementations rely on the backend's own
/// primitives rather than application-level locks.
pub trait CounterStore: Send + Sync {
    /// Cached tallies, or `None` on a miss.
    fn get_vote_state(&self, entity_id: EntityId) -> StoreResult<Option<VoteCounts>>;

    /// Overwrite the cached tallies.
    fn set_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<()>;

    /// Fill a miss with `counts`, leaving tallies that are already cached
    /// untouched. Returns what the cache holds afterwards.
    fn seed_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<VoteCounts>;

    /// Atomically add `delta` to cached tallies that already exist.
    ///
    /// Returns `None` without creating anything when the entity is not
    /// cached, so a miss is never turned into a tally counted from zero.
    fn apply_vote_delta(
        &self,
        entity_id: EntityId,
        delta: VoteDelta,
    ) -> StoreResult<Option<VoteCounts>>;

    /// The voter's cached vote on an entity. Only meaningful once
    /// [`voter_loaded`](Self::voter_loaded) is true.
    fn get_voter_vote(&self, voter_id: VoterId, entity_id: EntityId)
        -> StoreResult<Option<VoteType>>;

    /// Put the entity in the voter's `vote_type` set and out of the other one.
    fn record_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        vote_type: VoteType,
    ) -> StoreResult<()>;

    /// Remove the entity from both of the voter's sets.
    fn clear_voter_vote(&self, voter_id: VoterId, entity_id: EntityId) -> StoreResult<()>;

    /// Whether the voter's membership sets were warmed from the system of record.
    fn voter_loaded(&self, voter_id: VoterId) -> StoreResult<bool>;

    /// Replace the voter's membership with `votes` and mark it loaded.
    fn load_voter(&self, voter_id: VoterId, votes: &[(EntityId, VoteType)]) -> StoreResult<()>;

    /// Add an entity to the pending-sync set.
    fn mark_dirty(&self, entity_id: EntityId) -> StoreResult<()>;

    /// Remove and return up to `max_n` pending entities.
    fn pop_dirty_batch(&self, max_n: usize) -> StoreResult<Vec<EntityId>>;

    /// Drop an entity from the pending-sync set.
    fn clear_dirty(&self, entity_id: EntityId) -> StoreResult<()>;

    /// Number of pending entities.
    fn dirty_len(&self) -> StoreResult<usize>;
}

/// Key layout shared by backends that address data by string key.
#[derive(Debug, Clone)]
pub(crate) struct Keys {
    namespace: String,
}

impl Keys {
    pub(crate) fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    pub(crate) fn votes(&self, entity_id: EntityId) -> String {
        format!("{}:votes:{entity_id}", self.namespace)
    }

    pub(crate) fn voter_set(&self, voter_id: VoterId, vote_type: VoteType) -> String {
        format!("{}:voter:{voter_id}:{vote_type}", self.namespace)
    }

    pub(crate) fn voter_loaded(&self, voter_id: VoterId) -> String {
        format!("{}:voter:{voter_id}:loaded", self.namespace)
    }

    pub(crate) fn dirty(&self) -> String {
        format!("{}:dirty", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("tally");
        assert_eq!(keys.votes(12), "tally:votes:12");
        assert_eq!(keys.voter_set(5, VoteType::Up), "tally:voter:5:up");
        assert_eq!(keys.voter_set(5, VoteType::Down), "tally:voter:5:down");
        assert_eq!(keys.voter_loaded(5), "tally:voter:5:loaded");
        assert_eq!(keys.dirty(), "tally:dirty");
    }
}
