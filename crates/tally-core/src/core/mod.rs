//! Service layer for tally-core.
//!
//! Provides typed, high-level APIs for voting, reconciliation and score
//! aggregation. The stores are injected, so the same services run against
//! SQLite and Redis in production and against in-memory fakes in tests.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use tally_core::config::TallyConfig;
//! use tally_core::core::TallyServices;
//! use tally_core::counter::MemoryCounterStore;
//! use tally_core::model::VoteIntent;
//! use tally_core::notify::LogPublisher;
//! use tally_core::record::SqliteRecord;
//!
//! let record = SqliteRecord::open_in_memory().unwrap();
//! record.init_schema().unwrap();
//! record.insert_voter(1).unwrap();
//! record.insert_entity(7).unwrap();
//!
//! let services = TallyServices::new(
//!     Arc::new(record),
//!     Arc::new(MemoryCounterStore::new()),
//!     Arc::new(LogPublisher),
//!     TallyConfig::default(),
//! );
//!
//! let state = services.cast_vote(1, 7, VoteIntent::Up).unwrap();
//! assert_eq!(state.upvotes, 1);
//! ```

pub mod errors;
pub mod reconcile;
pub mod scores;
pub mod votes;

pub use errors::{CoreError, CoreResult};
pub use reconcile::{ReconcileOutcome, ReconcileSummary, ReconcileWorker};
pub use scores::ScoreReport;

use std::sync::Arc;

use crate::config::TallyConfig;
use crate::counter::CounterStore;
use crate::model::{EntityId, VoteIntent, VoteState, VoterId};
use crate::notify::ChangePublisher;
use crate::record::RecordStore;

/// Facade providing all tally service APIs.
///
/// Cheap to clone; clones share the same stores.
#[derive(Clone)]
pub struct TallyServices {
    record: Arc<dyn RecordStore>,
    counter: Arc<dyn CounterStore>,
    publisher: Arc<dyn ChangePublisher>,
    config: TallyConfig,
}

impl TallyServices {
    #[must_use]
    pub fn new(
        record: Arc<dyn RecordStore>,
        counter: Arc<dyn CounterStore>,
        publisher: Arc<dyn ChangePublisher>,
        config: TallyConfig,
    ) -> Self {
        Self {
            record,
            counter,
            publisher,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TallyConfig {
        &self.config
    }

    /// Access vote operations.
    #[must_use]
    pub fn votes(&self) -> votes::VoteService<'_> {
        votes::VoteService::new(
            self.record.as_ref(),
            self.counter.as_ref(),
            self.publisher.as_ref(),
            &self.config,
        )
    }

    /// Access reconciliation operations.
    #[must_use]
    pub fn reconciler(&self) -> reconcile::Reconciler<'_> {
        reconcile::Reconciler::new(
            self.record.as_ref(),
            self.counter.as_ref(),
            self.publisher.as_ref(),
            &self.config,
        )
    }

    /// Access score operations.
    #[must_use]
    pub fn scores(&self) -> scores::ScoreService<'_> {
        scores::ScoreService::new(self.record.as_ref(), self.publisher.as_ref())
    }

    // ------------------------------------------------------------------------
    // Shortcuts for the external operations
    // ------------------------------------------------------------------------

    pub fn cast_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        intent: VoteIntent,
    ) -> CoreResult<VoteState> {
        self.votes().cast(voter_id, entity_id, intent)
    }

    pub fn get_vote_state(
        &self,
        entity_id: EntityId,
        voter_id: Option<VoterId>,
    ) -> CoreResult<VoteState> {
        self.votes().state(entity_id, voter_id)
    }

    pub fn reconcile(&self, entity_id: EntityId) -> CoreResult<ReconcileOutcome> {
        self.reconciler().reconcile(entity_id)
    }

    pub fn reconcile_all(&self) -> CoreResult<ReconcileSummary> {
        self.reconciler().reconcile_all()
    }

    pub fn drain_dirty(&self, max_n: usize) -> CoreResult<ReconcileSummary> {
        self.reconciler().drain_dirty(max_n)
    }

    pub fn recompute_total(&self, entity_id: EntityId) -> CoreResult<ScoreReport> {
        self.scores().recompute_total(entity_id)
    }

    pub fn record_ai_validation(&self, entity_id: EntityId, score: f64) -> CoreResult<ScoreReport> {
        self.scores().record_ai_validation(entity_id, score)
    }

    /// Start a background reconcile worker sharing these stores.
    pub fn spawn_worker(&self) -> CoreResult<ReconcileWorker> {
        ReconcileWorker::spawn(self.clone())
    }
}

/// Ids are positive; anything else is a malformed request.
pub(crate) fn validate_id(field: &str, id: i64) -> CoreResult<()> {
    if id > 0 {
        Ok(())
    } else {
        Err(CoreError::invalid(format!("{field} must be positive, got {id}")))
    }
}
