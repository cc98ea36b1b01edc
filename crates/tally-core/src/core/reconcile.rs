//! Reconciliation: recompute tallies from vote rows and repair drift in the
//! aggregate columns and the counter store.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TallyConfig;
use crate::counter::CounterStore;
use crate::model::{EntityId, VoteCounts};
use crate::notify::{ChangeEvent, ChangePublisher};
use crate::record::RecordStore;

use super::{validate_id, CoreError, CoreResult, TallyServices};

/// What reconciling one entity found and fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub entity_id: EntityId,
    /// Authoritative counts, now written everywhere that diverged.
    pub counts: VoteCounts,
    pub aggregate_corrected: bool,
    pub cache_corrected: bool,
}

impl ReconcileOutcome {
    #[must_use]
    pub const fn corrected(&self) -> bool {
        self.aggregate_corrected || self.cache_corrected
    }
}

/// Totals for a batch of reconciliations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub entities_checked: u64,
    pub entities_corrected: u64,
    pub entities_failed: u64,
    pub duration: Duration,
}

impl ReconcileSummary {
    fn record(&mut self, result: &CoreResult<ReconcileOutcome>) {
        self.entities_checked += 1;
        match result {
            Ok(outcome) if outcome.corrected() => self.entities_corrected += 1,
            Ok(_) => {}
            Err(_) => self.entities_failed += 1,
        }
    }
}

/// Service for reconciliation operations.
pub struct Reconciler<'a> {
    record: &'a dyn RecordStore,
    counter: &'a dyn CounterStore,
    publisher: &'a dyn ChangePublisher,
    config: &'a TallyConfig,
}

impl<'a> Reconciler<'a> {
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

    /// Bring one entity's aggregate columns and cached tallies in line with
    /// its vote rows.
    ///
    /// The entity leaves the pending-sync set before its rows are counted, so
    /// a vote that commits during the check marks it again and the next drain
    /// picks it up. On failure the entity is put back unless it no longer
    /// exists. A cached miss is left alone.
    pub fn reconcile(&self, entity_id: EntityId) -> CoreResult<ReconcileOutcome> {
        validate_id("entity_id", entity_id)?;

        if let Err(e) = self.counter.clear_dirty(entity_id) {
            debug!(entity_id, error = %e, "could not clear pending-sync entry");
        }

        let outcome = self.repair(entity_id).map_err(|e| {
            if !e.is_not_found() {
                self.leave_dirty(entity_id);
            }
            e
        })?;

        if outcome.corrected() {
            self.publisher
                .publish(ChangeEvent::vote_changed(entity_id, outcome.counts));
        }
        Ok(outcome)
    }

    fn repair(&self, entity_id: EntityId) -> CoreResult<ReconcileOutcome> {
        let aggregate = self
            .record
            .aggregate_counts(entity_id)?
            .ok_or(CoreError::EntityNotFound { entity_id })?;
        let counts = self.record.count_votes(entity_id)?;

        let aggregate_corrected = aggregate != counts;
        if aggregate_corrected {
            warn!(
                entity_id,
                stored_up = aggregate.upvotes,
                stored_down = aggregate.downvotes,
                upvotes = counts.upvotes,
                downvotes = counts.downvotes,
                "aggregate drift detected"
            );
            self.record.write_aggregate_counts(entity_id, counts)?;
        }

        let cache_corrected = match self.counter.get_vote_state(entity_id)? {
            Some(cached) if cached != counts => {
                warn!(
                    entity_id,
                    cached_up = cached.upvotes,
                    cached_down = cached.downvotes,
                    upvotes = counts.upvotes,
                    downvotes = counts.downvotes,
                    "cache drift detected"
                );
                self.counter.set_vote_state(entity_id, counts)?;
                true
            }
            _ => false,
        };

        Ok(ReconcileOutcome {
            entity_id,
            counts,
            aggregate_corrected,
            cache_corrected,
        })
    }

    /// Reconcile every entity, a page at a time, alongside live traffic.
    ///
    /// A failing entity is logged and counted; it never stops the sweep.
    pub fn reconcile_all(&self) -> CoreResult<ReconcileSummary> {
        let started = Instant::now();
        let page_size = self.config.sweep_page_size.max(1);
        let mut summary = ReconcileSummary::default();
        let mut after: EntityId = 0;

        loop {
            let page = self.record.entity_page(after, page_size)?;
            let Some(&last) = page.last() else {
                break;
            };
            for entity_id in page.iter().copied() {
                let result = self.reconcile(entity_id);
                if let Err(e) = &result {
                    warn!(entity_id, error = %e, "reconcile failed, continuing sweep");
                }
                summary.record(&result);
            }
            if page.len() < page_size {
                break;
            }
            after = last;
        }

        summary.duration = started.elapsed();
        info!(
            checked = summary.entities_checked,
            corrected = summary.entities_corrected,
            failed = summary.entities_failed,
            duration_ms = u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
            "full reconciliation finished"
        );
        Ok(summary)
    }

    /// Reconcile up to `max_n` entities from the pending-sync set.
    ///
    /// Entities that fail go back into the set (see [`Self::reconcile`]).
    pub fn drain_dirty(&self, max_n: usize) -> CoreResult<ReconcileSummary> {
        let started = Instant::now();
        let batch = self.counter.pop_dirty_batch(max_n)?;
        let mut summary = ReconcileSummary::default();

        for entity_id in batch {
            let result = self.reconcile(entity_id);
            if let Err(e) = &result {
                warn!(entity_id, error = %e, "reconcile of pending entity failed");
            }
            summary.record(&result);
        }

        summary.duration = started.elapsed();
        if summary.entities_checked > 0 {
            debug!(
                checked = summary.entities_checked,
                corrected = summary.entities_corrected,
                failed = summary.entities_failed,
                "pending-sync batch drained"
            );
        }
        Ok(summary)
    }

    fn leave_dirty(&self, entity_id: EntityId) {
        if let Err(e) = self.counter.mark_dirty(entity_id) {
            warn!(entity_id, error = %e, "could not keep entity pending");
        }
    }
}

// ============================================================================
// Background worker
// ============================================================================

/// Background thread that drains the pending-sync set and runs periodic
/// full sweeps.
///
/// Stop it with [`ReconcileWorker::stop`]; dropping the handle also stops the
/// loop at its next wake-up.
pub struct ReconcileWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl ReconcileWorker {
    /// Start the worker on its own thread.
    pub fn spawn(services: TallyServices) -> CoreResult<Self> {
        let (shutdown, signal) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("tally-reconcile".to_string())
            .spawn(move || {
                let config = services.config().clone();
                let full_batch = u64::try_from(config.dirty_batch_size).unwrap_or(u64::MAX);
                let mut next_sweep = if config.sweep_on_start {
                    Instant::now()
                } else {
                    Instant::now() + config.sweep_interval
                };
                info!(
                    drain_interval_ms = u64::try_from(config.drain_interval.as_millis()).unwrap_or(u64::MAX),
                    sweep_interval_s = config.sweep_interval.as_secs(),
                    "reconcile worker started"
                );

                loop {
                    if Instant::now() >= next_sweep {
                        if let Err(e) = services.reconcile_all() {
                            warn!(error = %e, "full reconciliation aborted");
                        }
                        next_sweep = Instant::now() + config.sweep_interval;
                    }

                    // A full batch means more is probably waiting.
                    let wait = match services.drain_dirty(config.dirty_batch_size) {
                        Ok(summary) if summary.entities_checked >= full_batch => Duration::ZERO,
                        Ok(_) => config.drain_interval,
                        Err(e) => {
                            warn!(error = %e, "pending-sync drain failed");
                            config.drain_interval
                        }
                    };

                    match signal.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("reconcile worker stopped");
            })
            .map_err(|e| CoreError::Internal(anyhow!("failed to spawn reconcile worker: {e}")))?;

        Ok(Self { shutdown, handle })
    }

    /// Ask the worker to stop and wait for it.
    pub fn stop(self) -> CoreResult<()> {
        // A send error means the thread already exited.
        let _ = self.shutdown.send(());
        self.handle
            .join()
            .map_err(|_| CoreError::Internal(anyhow!("reconcile worker panicked")))
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::counter::testing::HookedCounter;
    use crate::counter::{LocalCounterStore, MemoryCounterStore};
    use crate::model::VoteIntent;
    use crate::notify::LogPublisher;
    use crate::record::SqliteRecord;

    fn setup(entities: i64) -> (Arc<SqliteRecord>, Arc<MemoryCounterStore>, TallyServices) {
        let record = Arc::new(SqliteRecord::open_in_memory().unwrap());
        record.init_schema().unwrap();
        record.insert_voter(1).unwrap();
        for id in 1..=entities {
            record.insert_entity(id).unwrap();
        }
        let counter = Arc::new(MemoryCounterStore::new());
        let config = TallyConfig {
            sweep_page_size: 2,
            ..TallyConfig::default()
        };
        let services = TallyServices::new(record.clone(), counter.clone(), Arc::new(LogPublisher), config);
        (record, counter, services)
    }

    #[test]
    fn test_reconcile_repairs_both_sides() {
        let (record, counter, services) = setup(1);
        services.cast_vote(1, 1, VoteIntent::Up).unwrap();

        record.write_aggregate_counts(1, VoteCounts::new(5, 5)).unwrap();
        counter.set_vote_state(1, VoteCounts::new(0, 3)).unwrap();

        let outcome = services.reconcile(1).unwrap();
        assert!(outcome.aggregate_corrected);
        assert!(outcome.cache_corrected);
        assert_eq!(record.aggregate_counts(1).unwrap(), Some(VoteCounts::new(1, 0)));
        assert_eq!(counter.get_vote_state(1).unwrap(), Some(VoteCounts::new(1, 0)));
        assert_eq!(counter.dirty_len().unwrap(), 0);
    }

    #[test]
    fn test_vote_landing_during_check_stays_pending() {
        let record = Arc::new(SqliteRecord::open_in_memory().unwrap());
        record.init_schema().unwrap();
        record.insert_entity(1).unwrap();
        for voter in [1, 2] {
            record.insert_voter(voter).unwrap();
        }
        let counter = Arc::new(MemoryCounterStore::new());
        let hooked = Arc::new(HookedCounter::new(Arc::clone(&counter)));
        let live = TallyServices::new(
            record.clone(),
            counter.clone(),
            Arc::new(LogPublisher),
            TallyConfig::default(),
        );
        let checking = TallyServices::new(
            record.clone(),
            hooked.clone(),
            Arc::new(LogPublisher),
            TallyConfig::default(),
        );

        live.cast_vote(1, 1, VoteIntent::Up).unwrap();
        // Voter 2 commits after the rows were counted but before the cache is read.
        let voter_two = live.clone();
        hooked.before_next_read(move || {
            voter_two.cast_vote(2, 1, VoteIntent::Up).unwrap();
        });

        let outcome = checking.reconcile(1).unwrap();
        assert_eq!(outcome.counts, VoteCounts::new(1, 0));
        assert_eq!(counter.dirty_len().unwrap(), 1);

        let drained = checking.drain_dirty(10).unwrap();
        assert_eq!(drained.entities_checked, 1);
        let truth = VoteCounts::new(2, 0);
        assert_eq!(record.count_votes(1).unwrap(), truth);
        assert_eq!(record.aggregate_counts(1).unwrap(), Some(truth));
        assert_eq!(counter.get_vote_state(1).unwrap(), Some(truth));
        assert_eq!(counter.dirty_len().unwrap(), 0);
    }

    #[test]
    fn test_failed_reconcile_stays_pending() {
        let record = Arc::new(SqliteRecord::open_in_memory().unwrap());
        record.init_schema().unwrap();
        record.insert_entity(1).unwrap();
        let counter = Arc::new(LocalCounterStore::new(Arc::clone(&record)));
        let services = TallyServices::new(
            record.clone(),
            counter.clone(),
            Arc::new(LogPublisher),
            TallyConfig::default(),
        );
        counter.mark_dirty(1).unwrap();
        counter.cache().set_available(false);

        let summary = services.drain_dirty(10).unwrap();
        assert_eq!(summary.entities_failed, 1);
        assert_eq!(counter.dirty_len().unwrap(), 1);
    }

    #[test]
    fn test_cache_miss_is_not_drift() {
        let (_record, counter, services) = setup(1);
        let outcome = services.reconcile(1).unwrap();
        assert!(!outcome.corrected());
        assert_eq!(counter.get_vote_state(1).unwrap(), None);
    }

    #[test]
    fn test_cache_outage_keeps_entity_pending() {
        let (record, counter, services) = setup(1);
        record.write_aggregate_counts(1, VoteCounts::new(2, 0)).unwrap();
        counter.set_available(false);

        assert!(matches!(
            services.reconcile(1),
            Err(CoreError::TransientStore(_))
        ));
        // Aggregate side is fixed regardless.
        assert_eq!(record.aggregate_counts(1).unwrap(), Some(VoteCounts::new(0, 0)));
    }

    #[test]
    fn test_sweep_pages_through_everything() {
        let (record, _counter, services) = setup(5);
        record.write_aggregate_counts(3, VoteCounts::new(1, 0)).unwrap();
        record.write_aggregate_counts(5, VoteCounts::new(0, 1)).unwrap();

        let summary = services.reconcile_all().unwrap();
        assert_eq!(summary.entities_checked, 5);
        assert_eq!(summary.entities_corrected, 2);
        assert_eq!(summary.entities_failed, 0);
    }

    #[test]
    fn test_drain_dirty_requeues_failures() {
        let (_record, counter, services) = setup(2);
        counter.mark_dirty(1).unwrap();
        counter.mark_dirty(2).unwrap();
        counter.mark_dirty(99).unwrap();

        let summary = services.drain_dirty(10).unwrap();
        assert_eq!(summary.entities_checked, 3);
        assert_eq!(summary.entities_failed, 1);
        // Unknown entity 99 is dropped rather than requeued.
        assert_eq!(counter.dirty_len().unwrap(), 0);
    }

    #[test]
    fn test_worker_drains_and_stops() {
        let (record, counter, services) = setup(1);
        services.cast_vote(1, 1, VoteIntent::Up).unwrap();
        record.write_aggregate_counts(1, VoteCounts::new(9, 9)).unwrap();

        let worker = services.spawn_worker().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while record.aggregate_counts(1).unwrap() != Some(VoteCounts::new(1, 0)) {
            assert!(Instant::now() < deadline, "worker never reconciled");
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop().unwrap();
        assert_eq!(counter.dirty_len().unwrap(), 0);
    }
}
