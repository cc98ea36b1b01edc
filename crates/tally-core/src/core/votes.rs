//! Vote service: cast votes and read vote state.
//!
//! The system of record decides every transition. The counter store is
//! updated after commit and is allowed to fail; when it does, counts are read
//! from the record instead and reconciliation repairs the cache later.

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::config::TallyConfig;
use crate::counter::{CounterStore, StoreResult};
use crate::model::{EntityId, VoteCounts, VoteIntent, VoteState, VoteTransition, VoteType, VoterId};
use crate::notify::{ChangeEvent, ChangePublisher};
use crate::record::{RecordStore, VoteWrite};

use super::{validate_id, CoreError, CoreResult};

/// Service for vote operations.
pub struct VoteService<'a> {
    record: &'a dyn RecordStore,
    counter: &'a dyn CounterStore,
    publisher: &'a dyn ChangePublisher,
    config: &'a TallyConfig,
}

impl<'a> VoteService<'a> {
    pub(crate) fn new(
        record: &'a dyn RecordStore,
        counter: &'a dyn CounterStore,
        publisher: &'a dyn ChangePublisher,
        config: &'a TallyConfig,
    ) -> Self {
        Self {
            record,
            counter,
            publisher,
            config,
        }
    }

    /// Cast, switch or retract a vote.
    ///
    /// Repeating the vote already on record changes nothing and returns the
    /// current state. Returns `CoreError::PersistenceFailure` when the record
    /// could not be written; in that case nothing was recorded.
    pub fn cast(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        intent: VoteIntent,
    ) -> CoreResult<VoteState> {
        validate_id("voter_id", voter_id)?;
        validate_id("entity_id", entity_id)?;
        self.require_entity(entity_id)?;
        self.require_voter(voter_id)?;

        let transition = self.write_vote(voter_id, entity_id, intent)?;
        if !transition.is_change() {
            debug!(voter_id, entity_id, %intent, "vote unchanged");
            let counts = self.counts(entity_id)?;
            return Ok(VoteState::new(counts, transition.current));
        }

        // Committed from here on: nothing below may fail the call.
        if let Err(e) = self
            .record
            .adjust_aggregate_counts(entity_id, transition.delta())
        {
            warn!(entity_id, error = %e, "aggregate columns not updated, left for reconciliation");
        }

        let counts = self.update_cache(voter_id, entity_id, transition);

        self.publisher
            .publish(ChangeEvent::vote_changed(entity_id, counts));

        info!(
            voter_id,
            entity_id,
            previous = ?transition.previous,
            current = ?transition.current,
            upvotes = counts.upvotes,
            downvotes = counts.downvotes,
            "vote recorded"
        );

        Ok(VoteState::new(counts, transition.current))
    }

    /// Parse a raw intent string and cast it.
    pub fn cast_str(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        intent: &str,
    ) -> CoreResult<VoteState> {
        let intent: VoteIntent = intent.parse()?;
        self.cast(voter_id, entity_id, intent)
    }

    /// Current counts for an entity, plus the voter's own vote when a voter
    /// is given.
    pub fn state(&self, entity_id: EntityId, voter_id: Option<VoterId>) -> CoreResult<VoteState> {
        validate_id("entity_id", entity_id)?;
        if let Some(voter_id) = voter_id {
            validate_id("voter_id", voter_id)?;
        }

        let counts = self.counts(entity_id)?;
        let your_vote = match voter_id {
            Some(voter_id) => self.voter_vote(voter_id, entity_id)?,
            None => None,
        };
        Ok(VoteState::new(counts, your_vote))
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn require_entity(&self, entity_id: EntityId) -> CoreResult<()> {
        if self.record.entity_exists(entity_id)? {
            Ok(())
        } else {
            Err(CoreError::EntityNotFound { entity_id })
        }
    }

    fn require_voter(&self, voter_id: VoterId) -> CoreResult<()> {
        if self.record.voter_exists(voter_id)? {
            Ok(())
        } else {
            Err(CoreError::VoterNotFound { voter_id })
        }
    }

    /// Commit the vote, retrying after losing an insert race.
    fn write_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        intent: VoteIntent,
    ) -> CoreResult<VoteTransition> {
        let attempts = self.config.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.record.apply_vote(voter_id, entity_id, intent) {
                Ok(VoteWrite::Applied(transition)) => return Ok(transition),
                Ok(VoteWrite::Conflict) => {
                    debug!(voter_id, entity_id, attempt, "concurrent first vote, retrying");
                }
                Err(source) => {
                    return Err(CoreError::PersistenceFailure {
                        voter_id,
                        entity_id,
                        source,
                    })
                }
            }
        }

        warn!(voter_id, entity_id, attempts, "vote conflict retries exhausted");
        Err(CoreError::PersistenceFailure {
            voter_id,
            entity_id,
            source: anyhow!("gave up after {attempts} conflicting attempts"),
        })
    }

    /// Push a committed transition into the counter store and return the
    /// counts to report.
    ///
    /// The entity is marked pending after the last cache write, so whichever
    /// reconcile picks the mark up also sees that write.
    fn update_cache(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        transition: VoteTransition,
    ) -> VoteCounts {
        let cached = absorb(
            entity_id,
            "apply delta",
            self.counter.apply_vote_delta(entity_id, transition.delta()),
        )
        .flatten();
        let counts = cached.unwrap_or_else(|| self.seed_after_commit(entity_id, transition));

        let membership = match transition.current {
            Some(vote_type) => self
                .counter
                .record_voter_vote(voter_id, entity_id, vote_type),
            None => self.counter.clear_voter_vote(voter_id, entity_id),
        };
        absorb(entity_id, "update membership", membership);
        absorb(entity_id, "mark dirty", self.counter.mark_dirty(entity_id));

        counts
    }

    /// Counts for a committed vote that missed the cache.
    ///
    /// The committed rows are seeded into the cache unless a concurrent
    /// writer filled it first; either way the reply is what the cache holds
    /// afterwards. If the rows cannot be counted, the aggregate columns
    /// (already adjusted for this vote) stand in.
    fn seed_after_commit(&self, entity_id: EntityId, transition: VoteTransition) -> VoteCounts {
        match self.record.count_votes(entity_id) {
            Ok(counts) => absorb(
                entity_id,
                "seed tallies",
                self.counter.seed_vote_state(entity_id, counts),
            )
            .unwrap_or(counts),
            Err(e) => {
                warn!(entity_id, error = %e, "vote rows not countable after commit, reporting aggregate columns");
                match self.record.aggregate_counts(entity_id) {
                    Ok(Some(counts)) => counts,
                    Ok(None) | Err(_) => {
                        warn!(entity_id, "aggregate columns unreadable, reporting this vote alone");
                        VoteCounts::default().apply(transition.delta())
                    }
                }
            }
        }
    }

    /// Cached counts, falling back to an authoritative count on a miss.
    fn counts(&self, entity_id: EntityId) -> CoreResult<VoteCounts> {
        let cached = absorb(entity_id, "read tallies", self.counter.get_vote_state(entity_id));
        if let Some(Some(counts)) = cached {
            return Ok(counts);
        }

        self.require_entity(entity_id)?;
        let counts = self.record.count_votes(entity_id)?;
        if cached.is_none() {
            return Ok(counts);
        }
        Ok(absorb(
            entity_id,
            "populate tallies",
            self.counter.seed_vote_state(entity_id, counts),
        )
        .unwrap_or(counts))
    }

    fn voter_vote(&self, voter_id: VoterId, entity_id: EntityId) -> CoreResult<Option<VoteType>> {
        match self.counter.voter_loaded(voter_id) {
            Ok(true) => match self.counter.get_voter_vote(voter_id, entity_id) {
                Ok(vote) => return Ok(vote),
                Err(e) => warn!(voter_id, entity_id, error = %e, "membership read failed"),
            },
            Ok(false) => {
                self.require_voter(voter_id)?;
                let votes = self.record.votes_by_voter(voter_id)?;
                if let Err(e) = self.counter.load_voter(voter_id, &votes) {
                    warn!(voter_id, error = %e, "membership warm-up failed");
                }
                return Ok(votes
                    .iter()
                    .find(|(id, _)| *id == entity_id)
                    .map(|(_, vote_type)| *vote_type));
            }
            Err(e) => warn!(voter_id, error = %e, "membership check failed"),
        }

        Ok(self
            .record
            .find_vote(voter_id, entity_id)?
            .map(|row| row.vote_type))
    }
}

/// Log a counter store failure and carry on without the value.
fn absorb<T>(entity_id: EntityId, op: &'static str, result: StoreResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(entity_id, op, error = %e, "counter store degraded");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::TallyServices;
    use crate::counter::testing::HookedCounter;
    use crate::counter::MemoryCounterStore;
    use crate::model::VoteDelta;
    use crate::notify::ChannelPublisher;
    use crate::record::{SqliteRecord, VoteRow};
    use crate::scoring::{Badge, EntityScores, ScoreBreakdown};

    struct Harness {
        record: Arc<SqliteRecord>,
        counter: Arc<MemoryCounterStore>,
        publisher: Arc<ChannelPublisher>,
        services: TallyServices,
    }

    /// Record that cannot count vote rows; everything else passes through.
    struct UncountableRecord(Arc<SqliteRecord>);

    impl RecordStore for UncountableRecord {
        fn entity_exists(&self, entity_id: EntityId) -> anyhow::Result<bool> {
            self.0.entity_exists(entity_id)
        }

        fn voter_exists(&self, voter_id: VoterId) -> anyhow::Result<bool> {
            self.0.voter_exists(voter_id)
        }

        fn find_vote(&self, voter_id: VoterId, entity_id: EntityId) -> anyhow::Result<Option<VoteRow>> {
            self.0.find_vote(voter_id, entity_id)
        }

        fn votes_by_voter(&self, voter_id: VoterId) -> anyhow::Result<Vec<(EntityId, VoteType)>> {
            self.0.votes_by_voter(voter_id)
        }

        fn apply_vote(
            &self,
            voter_id: VoterId,
            entity_id: EntityId,
            intent: VoteIntent,
        ) -> anyhow::Result<VoteWrite> {
            self.0.apply_vote(voter_id, entity_id, intent)
        }

        fn count_votes(&self, _entity_id: EntityId) -> anyhow::Result<VoteCounts> {
            Err(anyhow!("count query failed"))
        }

        fn aggregate_counts(&self, entity_id: EntityId) -> anyhow::Result<Option<VoteCounts>> {
            self.0.aggregate_counts(entity_id)
        }

        fn adjust_aggregate_counts(&self, entity_id: EntityId, delta: VoteDelta) -> anyhow::Result<()> {
            self.0.adjust_aggregate_counts(entity_id, delta)
        }

        fn write_aggregate_counts(&self, entity_id: EntityId, counts: VoteCounts) -> anyhow::Result<()> {
            self.0.write_aggregate_counts(entity_id, counts)
        }

        fn entity_page(&self, after: EntityId, limit: usize) -> anyhow::Result<Vec<EntityId>> {
            self.0.entity_page(after, limit)
        }

        fn load_scores(&self, entity_id: EntityId) -> anyhow::Result<Option<EntityScores>> {
            self.0.load_scores(entity_id)
        }

        fn store_scores(
            &self,
            entity_id: EntityId,
            scores: &EntityScores,
            breakdown: &ScoreBreakdown,
        ) -> anyhow::Result<()> {
            self.0.store_scores(entity_id, scores, breakdown)
        }

        fn list_badges(&self, entity_id: EntityId) -> anyhow::Result<Vec<Badge>> {
            self.0.list_badges(entity_id)
        }
    }

    fn harness() -> Harness {
        let record = Arc::new(SqliteRecord::open_in_memory().unwrap());
        record.init_schema().unwrap();
        record.insert_entity(1).unwrap();
        for voter in [10, 11] {
            record.insert_voter(voter).unwrap();
        }
        let counter = Arc::new(MemoryCounterStore::new());
        let publisher = Arc::new(ChannelPublisher::new());
        let services = TallyServices::new(
            record.clone(),
            counter.clone(),
            publisher.clone(),
            TallyConfig::default(),
        );
        Harness {
            record,
            counter,
            publisher,
            services,
        }
    }

    #[test]
    fn test_first_vote_seeds_cache_from_record() {
        let h = harness();
        let state = h.services.votes().cast(10, 1, VoteIntent::Up).unwrap();

        assert_eq!(state.counts(), VoteCounts::new(1, 0));
        assert_eq!(state.your_vote, Some(VoteType::Up));
        assert_eq!(h.counter.get_vote_state(1).unwrap(), Some(VoteCounts::new(1, 0)));
        assert_eq!(h.counter.get_voter_vote(10, 1).unwrap(), Some(VoteType::Up));
        assert_eq!(h.counter.dirty_len().unwrap(), 1);
        assert_eq!(h.record.aggregate_counts(1).unwrap(), Some(VoteCounts::new(1, 0)));
    }

    #[test]
    fn test_repeat_vote_is_noop() {
        let h = harness();
        let rx = h.publisher.subscribe();
        let votes = h.services.votes();

        votes.cast(10, 1, VoteIntent::Down).unwrap();
        let again = votes.cast(10, 1, VoteIntent::Down).unwrap();

        assert_eq!(again.counts(), VoteCounts::new(0, 1));
        assert_eq!(again.your_vote, Some(VoteType::Down));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_retract_and_flip() {
        let h = harness();
        let votes = h.services.votes();

        votes.cast(10, 1, VoteIntent::Up).unwrap();
        let flipped = votes.cast(10, 1, VoteIntent::Down).unwrap();
        assert_eq!(flipped.counts(), VoteCounts::new(0, 1));

        let retracted = votes.cast(10, 1, VoteIntent::Retract).unwrap();
        assert_eq!(retracted.counts(), VoteCounts::new(0, 0));
        assert_eq!(retracted.your_vote, None);
        assert_eq!(h.counter.get_voter_vote(10, 1).unwrap(), None);

        let nothing = votes.cast(11, 1, VoteIntent::Retract).unwrap();
        assert_eq!(nothing.counts(), VoteCounts::new(0, 0));
    }

    #[test]
    fn test_validation_and_not_found() {
        let h = harness();
        let votes = h.services.votes();

        assert!(matches!(
            votes.cast(0, 1, VoteIntent::Up),
            Err(CoreError::InvalidArgument { .. })
        ));
        assert!(matches!(
            votes.cast(10, 99, VoteIntent::Up),
            Err(CoreError::EntityNotFound { entity_id: 99 })
        ));
        assert!(matches!(
            votes.cast(99, 1, VoteIntent::Up),
            Err(CoreError::VoterNotFound { voter_id: 99 })
        ));
        assert!(matches!(
            votes.cast_str(10, 1, "sideways"),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_counter_outage_falls_back_to_record() {
        let h = harness();
        h.counter.set_available(false);

        let state = h.services.votes().cast(10, 1, VoteIntent::Up).unwrap();
        assert_eq!(state.counts(), VoteCounts::new(1, 0));

        let read = h.services.votes().state(1, Some(10)).unwrap();
        assert_eq!(read.counts(), VoteCounts::new(1, 0));
        assert_eq!(read.your_vote, Some(VoteType::Up));
    }

    #[test]
    fn test_state_warms_unloaded_voter() {
        let h = harness();
        h.services.votes().cast(11, 1, VoteIntent::Down).unwrap();
        h.counter.flush();

        let state = h.services.votes().state(1, Some(11)).unwrap();
        assert_eq!(state.counts(), VoteCounts::new(0, 1));
        assert_eq!(state.your_vote, Some(VoteType::Down));
        assert!(h.counter.voter_loaded(11).unwrap());
        assert_eq!(h.counter.get_vote_state(1).unwrap(), Some(VoteCounts::new(0, 1)));
    }

    #[test]
    fn test_committed_vote_is_reported_when_rows_cannot_be_counted() {
        let h = harness();
        let rx = h.publisher.subscribe();
        let services = TallyServices::new(
            Arc::new(UncountableRecord(h.record.clone())),
            h.counter.clone(),
            h.publisher.clone(),
            TallyConfig::default(),
        );

        let state = services.votes().cast(10, 1, VoteIntent::Up).unwrap();

        // Reported from the aggregate columns, which already include the vote.
        assert_eq!(state.counts(), VoteCounts::new(1, 0));
        assert_eq!(state.your_vote, Some(VoteType::Up));
        assert_eq!(h.record.count_votes(1).unwrap(), VoteCounts::new(1, 0));
        assert_eq!(h.counter.get_vote_state(1).unwrap(), None);
        assert_eq!(h.counter.dirty_len().unwrap(), 1);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_seed_keeps_tallies_filled_by_concurrent_writer() {
        let h = harness();
        let hooked = Arc::new(HookedCounter::new(h.counter.clone()));
        let racer = h.counter.clone();
        // Another writer fills the cache between this vote's miss and its seed.
        hooked.after_next_delta(move || racer.set_vote_state(1, VoteCounts::new(5, 0)).unwrap());
        let services = TallyServices::new(
            h.record.clone(),
            hooked,
            h.publisher.clone(),
            TallyConfig::default(),
        );

        let state = services.votes().cast(10, 1, VoteIntent::Up).unwrap();
        assert_eq!(state.counts(), VoteCounts::new(5, 0));
        assert_eq!(h.counter.get_vote_state(1).unwrap(), Some(VoteCounts::new(5, 0)));
        assert_eq!(h.counter.dirty_len().unwrap(), 1);

        // The pending mark brings the cache back to the rows.
        services.drain_dirty(10).unwrap();
        assert_eq!(h.counter.get_vote_state(1).unwrap(), Some(VoteCounts::new(1, 0)));
    }
}
