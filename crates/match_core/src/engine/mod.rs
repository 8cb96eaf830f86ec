//! Matching engine: drives requests from `pending` to a terminal state.
//!
//! The engine is shared (`Arc<MatchingEngine>`) between any number of worker
//! threads calling [`MatchingEngine::tick`], plus the threads that deliver
//! rider submissions, driver heartbeats and driver decisions. Request state is
//! serialised per request; driver state is serialised per driver inside the
//! registry; the index is read-mostly behind an `RwLock`.
//!
//! Per request:
//!
//! ```text
//! pending ──propose──▶ proposed ──accept──▶ matched ──complete──▶ completed
//!    ▲                    │
//!    └──reject/timeout────┘      pending|proposed ──cancel──▶ cancelled
//!                                pending|proposed ──expire──▶ expired
//! ```

mod recovery;
mod resolution;
mod round;
mod slot;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::{Clock, DeadlineTimers, SystemClock};
use crate::collaborators::{NotificationDispatcher, Noop, RiderFeedback, TripLifecycle};
use crate::config::MatchingConfig;
use crate::error::{MatchError, Result};
use crate::geo::Coordinate;
use crate::ledger::{AppendOutcome, LedgerEntry, LedgerEvent, LedgerStore, MatchLedger, MemoryLedgerStore};
use crate::queue::RequestQueue;
use crate::registry::{DriverRegistry, RegistryCounts, ReleaseOutcome};
use crate::spatial::{GeoIndex, UpsertOutcome};
use crate::telemetry::{MatchCounts, MatchTelemetry};
use crate::types::{
    AttemptId, AttemptState, Availability, DriverId, DriverState, MatchAttempt, NewRideRequest,
    RequestEvent, RequestId, RequestState, RideRequest,
};

pub use resolution::DecisionOutcome;
pub use round::RoundOutcome;

use slot::{Effects, NotifyScope, RequestRecord, RequestSlot};

/// What one [`MatchingEngine::tick`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Decision deadlines that fired.
    pub deadlines_fired: usize,
    /// Outcome for the request taken off the queue, if any.
    pub round: Option<RoundOutcome>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.deadlines_fired == 0 && self.round.is_none()
    }
}

pub struct MatchingEngine {
    config: MatchingConfig,
    clock: Arc<dyn Clock>,
    index: RwLock<GeoIndex>,
    registry: DriverRegistry,
    queue: RequestQueue,
    ledger: MatchLedger,
    timers: DeadlineTimers,
    requests: DashMap<RequestId, Arc<RequestSlot>>,
    attempt_owner: DashMap<AttemptId, RequestId>,
    notifier: Arc<dyn NotificationDispatcher>,
    trips: Arc<dyn TripLifecycle>,
    feedback: Arc<dyn RiderFeedback>,
    telemetry: MatchTelemetry,
    next_request_id: AtomicU64,
    next_attempt_id: AtomicU64,
}

impl std::fmt::Debug for MatchingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchingEngine")
            .field("config", &self.config)
            .field("requests", &self.requests.len())
            .field("queued", &self.queue.len())
            .field("drivers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

pub struct MatchingEngineBuilder {
    config: MatchingConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationDispatcher>,
    trips: Arc<dyn TripLifecycle>,
    feedback: Arc<dyn RiderFeedback>,
    store: Box<dyn LedgerStore>,
}

impl MatchingEngineBuilder {
    pub fn new(config: MatchingConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(Noop),
            trips: Arc::new(Noop),
            feedback: Arc::new(Noop),
            store: Box::new(MemoryLedgerStore::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_trip_lifecycle(mut self, trips: Arc<dyn TripLifecycle>) -> Self {
        self.trips = trips;
        self
    }

    pub fn with_rider_feedback(mut self, feedback: Arc<dyn RiderFeedback>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_ledger_store(mut self, store: impl LedgerStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    /// Validate the configuration, open the ledger and replay whatever it holds.
    pub fn build(self) -> Result<MatchingEngine> {
        self.config.validate()?;
        let resolution = self.config.resolution()?;
        let ledger = MatchLedger::open(self.store, self.config.persistence_retry)?;
        let engine = MatchingEngine {
            queue: RequestQueue::new(self.config.max_wait_ms),
            index: RwLock::new(GeoIndex::new(resolution)),
            registry: DriverRegistry::new(),
            ledger,
            timers: DeadlineTimers::new(),
            requests: DashMap::new(),
            attempt_owner: DashMap::new(),
            notifier: self.notifier,
            trips: self.trips,
            feedback: self.feedback,
            clock: self.clock,
            telemetry: MatchTelemetry::new(),
            next_request_id: AtomicU64::new(1),
            next_attempt_id: AtomicU64::new(1),
            config: self.config,
        };
        engine.replay_ledger();
        Ok(engine)
    }
}

impl MatchingEngine {
    pub fn builder(config: MatchingConfig) -> MatchingEngineBuilder {
        MatchingEngineBuilder::new(config)
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Accept a rider submission. Malformed input is rejected before queueing.
    pub fn submit_request(&self, new_request: NewRideRequest) -> Result<RequestId> {
        let id = RequestId(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let request = RideRequest {
            id,
            rider: new_request.rider,
            pickup: new_request.pickup,
            dropoff: new_request.dropoff,
            priority: new_request.priority,
            created_at: self.clock.now_ms(),
            state: RequestState::Pending,
        };
        request.validate()?;

        self.persist(LedgerEntry {
            request_id: id,
            attempt_seq: 0,
            at_ms: request.created_at,
            event: LedgerEvent::RequestSubmitted {
                rider: request.rider.clone(),
                pickup: request.pickup,
                dropoff: request.dropoff,
                priority: request.priority,
            },
        })?;

        // Recorded before queueing so a worker never dequeues an unknown id.
        let entry = RequestRecord::new(request.clone());
        self.requests.insert(id, Arc::new(RequestSlot::new(entry)));
        self.queue.enqueue(&request)?;
        self.telemetry.record_submitted();
        debug!(request = %id, "request submitted");
        Ok(id)
    }

    /// Cancel a request that is not matched yet, releasing any held driver.
    /// Cancelling an already cancelled request is a no-op.
    pub fn cancel_request(&self, id: RequestId) -> Result<RequestState> {
        let slot = self.slot(id)?;
        slot.cancel_requested.store(true, Ordering::SeqCst);
        let mut record = slot.record.lock();
        let current = record.request.state;
        if current == RequestState::Cancelled {
            return Ok(current);
        }
        let next = match current.apply(RequestEvent::Cancel) {
            Ok(next) => next,
            Err(err) => {
                slot.cancel_requested.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let now = self.clock.now_ms();
        if let Err(err) = self.persist(LedgerEntry {
            request_id: id,
            attempt_seq: record.current_seq(),
            at_ms: now,
            event: LedgerEvent::RequestStateChanged {
                from: current,
                to: next,
            },
        }) {
            slot.cancel_requested.store(false, Ordering::SeqCst);
            return Err(err);
        }

        if let Some(active) = record.proposed_attempt() {
            self.resolve_attempt(&mut record, active.id, AttemptState::Cancelled, now)?;
            self.release_driver(active.driver_id, active.id, now);
        }
        record.request.state = next;
        self.queue.remove(id);
        self.telemetry.record_cancelled();
        info!(request = %id, from = %current, "request cancelled");
        Ok(next)
    }

    /// Record a driver heartbeat position. Unknown drivers are registered offline.
    pub fn update_driver_position(
        &self,
        driver: DriverId,
        coordinate: Coordinate,
        timestamp: u64,
    ) -> Result<UpsertOutcome> {
        coordinate.validate()?;
        let outcome = self.index.write().upsert(driver, coordinate, timestamp)?;
        self.registry.ensure_registered(driver, self.clock.now_ms());
        if outcome == UpsertOutcome::Stale {
            debug!(%driver, timestamp, "stale position update ignored");
        }
        Ok(outcome)
    }

    /// Apply a driver-reported availability change. A driver dropping offline
    /// while holding a proposal is treated as rejecting it.
    pub fn update_driver_availability(
        &self,
        driver: DriverId,
        availability: Availability,
    ) -> Result<DriverState> {
        if NotifyScope::is_active() {
            return Err(MatchError::Reentrant {
                operation: "availability changes",
            });
        }
        let now = self.clock.now_ms();
        let change = self.registry.set_availability(driver, availability, now)?;
        if let Some(attempt) = change.aborted {
            info!(%driver, %attempt, "driver went offline while holding a proposal");
            self.withdraw_attempt(attempt)?;
        }
        Ok(change.state)
    }

    /// Remove a driver's position from the index (driver deregistered).
    pub fn forget_driver_position(&self, driver: DriverId) -> bool {
        self.index.write().remove(driver).is_some()
    }

    /// Move a matched request to `completed` and free its driver.
    pub fn complete_trip(&self, id: RequestId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock();
        let current = record.request.state;
        let next = current.apply(RequestEvent::Complete)?;
        let accepted = record
            .attempts
            .iter()
            .rev()
            .find(|a| a.state == AttemptState::Accepted)
            .copied()
            .ok_or_else(|| MatchError::IllegalTransition {
                entity: "request",
                from: current.to_string(),
                event: "Complete without an accepted attempt".into(),
            })?;

        let now = self.clock.now_ms();
        self.persist(LedgerEntry {
            request_id: id,
            attempt_seq: accepted.seq,
            at_ms: now,
            event: LedgerEvent::RequestStateChanged {
                from: current,
                to: next,
            },
        })?;
        if let Err(err) = self.registry.complete_trip(accepted.driver_id, accepted.id, now) {
            warn!(request = %id, driver = %accepted.driver_id, error = %err, "driver was not on this trip");
        }
        record.request.state = next;
        info!(request = %id, driver = %accepted.driver_id, "trip completed");
        Ok(())
    }

    /// Fire due decision deadlines, then run one matching round.
    pub fn tick(&self) -> Result<TickReport> {
        let deadlines_fired = self.fire_due_deadlines();
        let round = self.process_next()?;
        Ok(TickReport {
            deadlines_fired,
            round,
        })
    }

    /// Tick until nothing is due at the current clock reading, or `max_steps`.
    pub fn run_until_idle(&self, max_steps: usize) -> Result<usize> {
        let mut steps = 0;
        while steps < max_steps {
            let report = self.tick()?;
            if report.is_idle() {
                break;
            }
            steps += 1;
        }
        Ok(steps)
    }

    /// Earliest future instant at which a timer fires or a parked request wakes.
    pub fn next_wakeup(&self) -> Option<u64> {
        match (self.timers.next_deadline(), self.queue.next_parked_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn request(&self, id: RequestId) -> Option<RideRequest> {
        let slot = self.slot(id).ok()?;
        let request = slot.record.lock().request.clone();
        Some(request)
    }

    pub fn attempts(&self, id: RequestId) -> Vec<MatchAttempt> {
        let Ok(slot) = self.slot(id) else {
            return Vec::new();
        };
        let attempts = slot.record.lock().attempts.clone();
        attempts
    }

    pub fn attempt(&self, id: AttemptId) -> Option<MatchAttempt> {
        let request = self.attempt_owner.get(&id).map(|r| *r.value())?;
        self.attempts(request).into_iter().find(|a| a.id == id)
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.requests.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn driver_state(&self, driver: DriverId) -> Option<DriverState> {
        self.registry.state(driver)
    }

    pub fn registry_counts(&self) -> RegistryCounts {
        self.registry.state_counts()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn telemetry(&self) -> MatchCounts {
        self.telemetry.snapshot()
    }

    pub fn ledger(&self) -> &MatchLedger {
        &self.ledger
    }

    fn slot(&self, id: RequestId) -> Result<Arc<RequestSlot>> {
        if NotifyScope::is_active() {
            return Err(MatchError::Reentrant {
                operation: "request updates",
            });
        }
        // Clone out of the map so no shard lock is held while the slot is locked.
        self.requests
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| MatchError::request_not_found(id))
    }

    fn allocate_attempt_id(&self) -> AttemptId {
        AttemptId(self.next_attempt_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Durable write; fails only after the ledger exhausted its retries.
    fn persist(&self, entry: LedgerEntry) -> Result<()> {
        match self.ledger.append(entry)? {
            AppendOutcome::Written { retries } => {
                for _ in 0..retries {
                    self.telemetry.record_persistence_retry();
                }
            }
            AppendOutcome::Duplicate => {}
        }
        Ok(())
    }

    /// Bookkeeping write whose loss only degrades recovery fidelity.
    fn persist_best_effort(&self, entry: LedgerEntry) {
        let request = entry.request_id;
        if let Err(err) = self.persist(entry) {
            warn!(%request, error = %err, "ledger bookkeeping write lost");
        }
    }

    fn release_driver(&self, driver: DriverId, attempt: AttemptId, now: u64) {
        if self.registry.release(driver, attempt, now) == ReleaseOutcome::Stale {
            self.telemetry.record_stale_release();
        }
    }

    fn dispatch(&self, effects: Effects) {
        for event in effects.matched {
            self.trips.matched(event);
        }
        for (request, rider, reason) in effects.no_match {
            self.feedback.no_match(request, &rider, &reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryOrdering;
    use crate::types::Decision;
    use crate::test_helpers::{offset_km, test_config, TestHarness, TEST_ORIGIN};

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let err = MatchingEngine::builder(MatchingConfig::default().with_candidate_breadth(0))
            .build()
            .expect_err("zero breadth");
        assert!(matches!(err, MatchError::Invalid(_)));
    }

    #[test]
    fn candidate_breadth_bounds_a_round() {
        let h = TestHarness::new(test_config().with_candidate_breadth(1)).expect("engine");
        let near = h.add_driver(1, offset_km(TEST_ORIGIN, 0.5, 0.0)).expect("near");
        h.add_driver(2, offset_km(TEST_ORIGIN, 1.0, 0.0)).expect("far");
        h.notifier.fail_for(near);
        h.submit("rider-a", TEST_ORIGIN).expect("submit");

        let report = h.engine.tick().expect("tick");

        assert!(matches!(report.round, Some(RoundOutcome::Requeued { retries: 1, .. })));
        assert_eq!(h.notifier.sent().len(), 0);
    }

    #[test]
    fn back_ordering_lets_newer_requests_go_first() {
        let h = TestHarness::new(test_config().with_retry_ordering(RetryOrdering::Back))
            .expect("engine");
        h.add_driver(1, offset_km(TEST_ORIGIN, 0.5, 0.0)).expect("d1");
        h.add_driver(2, offset_km(TEST_ORIGIN, 1.0, 0.0)).expect("d2");
        let older = h.submit("rider-a", TEST_ORIGIN).expect("older");
        let newer = h.submit("rider-b", TEST_ORIGIN).expect("newer");

        let Some(RoundOutcome::Proposed { attempt, .. }) = h.engine.tick().expect("tick").round
        else {
            panic!("expected a proposal");
        };
        h.engine
            .record_driver_decision(attempt, Decision::Reject)
            .expect("reject");

        let Some(RoundOutcome::Proposed { request, .. }) = h.engine.tick().expect("tick").round
        else {
            panic!("expected a proposal");
        };
        assert_eq!(request, newer);
        assert_ne!(request, older);
    }

    #[test]
    fn next_wakeup_tracks_the_earliest_deadline() {
        let h = TestHarness::new(test_config().with_decision_window_ms(5_000)).expect("engine");
        h.add_driver(1, offset_km(TEST_ORIGIN, 0.5, 0.0)).expect("d1");
        assert_eq!(h.engine.next_wakeup(), None);
        h.submit("rider-a", TEST_ORIGIN).expect("submit");
        h.engine.tick().expect("tick");
        assert_eq!(h.engine.next_wakeup(), Some(h.engine.now_ms() + 5_000));
    }
}
