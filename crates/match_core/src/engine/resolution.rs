//! Driver decisions, decision deadlines and withdrawn proposals.

use tracing::{debug, info, warn};

use crate::collaborators::MatchedEvent;
use crate::error::{MatchError, Result};
use crate::ledger::{LedgerEntry, LedgerEvent};
use crate::types::{AttemptId, AttemptState, Decision, MatchAttempt, RequestEvent};

use super::round::RoundOutcome;
use super::slot::{Effects, NotifyScope, RequestRecord};
use super::MatchingEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// The request is matched to this driver.
    Matched,
    /// The driver declined; the request went back for another round.
    Rejected,
    /// The attempt had already been resolved; the decision changed nothing.
    AlreadyResolved(AttemptState),
}

impl MatchingEngine {
    /// Apply a driver's answer to a proposal. Replaying a decision is a no-op.
    pub fn record_driver_decision(
        &self,
        attempt_id: AttemptId,
        decision: Decision,
    ) -> Result<DecisionOutcome> {
        let request = self
            .attempt_owner
            .get(&attempt_id)
            .map(|owner| *owner.value())
            .ok_or_else(|| MatchError::attempt_not_found(attempt_id))?;
        let slot = self.slot(request)?;

        let mut effects = Effects::default();
        let outcome = {
            let mut record = slot.record.lock();
            self.apply_decision(&mut record, attempt_id, decision, &mut effects)
        };
        self.dispatch(effects);
        outcome
    }

    fn apply_decision(
        &self,
        record: &mut RequestRecord,
        attempt_id: AttemptId,
        decision: Decision,
        effects: &mut Effects,
    ) -> Result<DecisionOutcome> {
        let attempt = record
            .attempt(attempt_id)
            .copied()
            .ok_or_else(|| MatchError::attempt_not_found(attempt_id))?;
        if attempt.state.is_terminal() {
            self.telemetry.record_replayed_decision();
            debug!(attempt = %attempt_id, state = %attempt.state, ?decision, "decision for resolved attempt ignored");
            return Ok(DecisionOutcome::AlreadyResolved(attempt.state));
        }

        let now = self.clock.now_ms();
        if now >= attempt.deadline {
            self.time_out(record, attempt, now, effects)?;
            return Err(MatchError::Expired {
                request: attempt.request_id,
                attempt: Some(attempt_id),
            });
        }

        match decision {
            Decision::Accept => self.accept(record, attempt, now, effects),
            Decision::Reject => {
                self.resolve_attempt(record, attempt_id, AttemptState::Rejected, now)?;
                self.release_driver(attempt.driver_id, attempt_id, now);
                record.excluded.insert(attempt.driver_id);
                self.telemetry.record_rejected();
                debug!(request = %attempt.request_id, driver = %attempt.driver_id, "proposal rejected");
                self.retry_after_attempt(record, now, effects)?;
                Ok(DecisionOutcome::Rejected)
            }
        }
    }

    fn accept(
        &self,
        record: &mut RequestRecord,
        attempt: MatchAttempt,
        now: u64,
        effects: &mut Effects,
    ) -> Result<DecisionOutcome> {
        let request = attempt.request_id;
        let driver = attempt.driver_id;
        let from = record.request.state;
        let to = from.apply(RequestEvent::Accept)?;

        if let Err(err) = self.registry.confirm_trip(driver, attempt.id, now) {
            // The reservation is gone, typically because the driver went offline.
            warn!(%request, %driver, attempt = %attempt.id, error = %err, "accepted proposal no longer holds the driver");
            self.resolve_attempt(record, attempt.id, AttemptState::Cancelled, now)?;
            record.excluded.insert(driver);
            self.retry_after_attempt(record, now, effects)?;
            return Err(err);
        }

        let durable = self
            .persist(LedgerEntry {
                request_id: request,
                attempt_seq: attempt.seq,
                at_ms: now,
                event: LedgerEvent::AttemptResolved {
                    attempt_id: attempt.id,
                    driver_id: driver,
                    state: AttemptState::Accepted,
                },
            })
            .and_then(|()| {
                self.persist(LedgerEntry {
                    request_id: request,
                    attempt_seq: attempt.seq,
                    at_ms: now,
                    event: LedgerEvent::RequestStateChanged { from, to },
                })
            });
        if let Err(err) = durable {
            // Never matched without a durable record: free the driver and retry.
            warn!(%request, %driver, error = %err, "match not durable, releasing driver");
            if let Err(undo) = self.registry.complete_trip(driver, attempt.id, now) {
                warn!(%request, %driver, error = %undo, "could not free driver after failed write");
            }
            self.resolve_attempt(record, attempt.id, AttemptState::Cancelled, now)?;
            self.retry_after_attempt(record, now, effects)?;
            return Err(err);
        }

        self.mark_attempt(record, attempt.id, AttemptState::Accepted)?;
        record.request.state = to;
        self.telemetry.record_accepted();
        effects.matched.push(MatchedEvent {
            request_id: request,
            driver_id: driver,
            attempt_id: attempt.id,
            matched_at: now,
        });
        info!(%request, %driver, attempt = %attempt.id, "request matched");
        Ok(DecisionOutcome::Matched)
    }

    /// Fire every decision deadline due at the current time.
    pub fn fire_due_deadlines(&self) -> usize {
        if NotifyScope::is_active() {
            return 0;
        }
        let now = self.clock.now_ms();
        self.timers
            .pop_due(now)
            .into_iter()
            .filter(|attempt| self.fire_deadline(*attempt, now))
            .count()
    }

    fn fire_deadline(&self, attempt_id: AttemptId, now: u64) -> bool {
        let Some(request) = self.attempt_owner.get(&attempt_id).map(|o| *o.value()) else {
            return false;
        };
        let Ok(slot) = self.slot(request) else {
            return false;
        };

        let mut effects = Effects::default();
        let fired = {
            let mut record = slot.record.lock();
            match record.attempt(attempt_id).copied() {
                Some(attempt) if attempt.state == AttemptState::Proposed => {
                    match self.time_out(&mut record, attempt, now, &mut effects) {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(%request, attempt = %attempt_id, error = %err, "deadline could not be applied");
                            false
                        }
                    }
                }
                _ => false,
            }
        };
        self.dispatch(effects);
        fired
    }

    fn time_out(
        &self,
        record: &mut RequestRecord,
        attempt: MatchAttempt,
        now: u64,
        effects: &mut Effects,
    ) -> Result<()> {
        self.resolve_attempt(record, attempt.id, AttemptState::TimedOut, now)?;
        self.release_driver(attempt.driver_id, attempt.id, now);
        record.excluded.insert(attempt.driver_id);
        self.telemetry.record_timed_out();
        debug!(request = %attempt.request_id, driver = %attempt.driver_id, "proposal timed out");
        self.retry_after_attempt(record, now, effects)?;
        Ok(())
    }

    /// A reserved driver went offline: treat the proposal as rejected.
    pub(super) fn withdraw_attempt(&self, attempt_id: AttemptId) -> Result<()> {
        let Some(request) = self.attempt_owner.get(&attempt_id).map(|o| *o.value()) else {
            return Ok(());
        };
        let slot = self.slot(request)?;

        let mut effects = Effects::default();
        let result = {
            let mut record = slot.record.lock();
            match record.attempt(attempt_id).copied() {
                Some(attempt) if attempt.state == AttemptState::Proposed => {
                    self.withdraw(&mut record, attempt, &mut effects)
                }
                _ => Ok(()),
            }
        };
        self.dispatch(effects);
        result
    }

    fn withdraw(
        &self,
        record: &mut RequestRecord,
        attempt: MatchAttempt,
        effects: &mut Effects,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        // The registry already dropped the reservation; nothing to release.
        self.resolve_attempt(record, attempt.id, AttemptState::Rejected, now)?;
        record.excluded.insert(attempt.driver_id);
        self.telemetry.record_rejected();
        self.retry_after_attempt(record, now, effects)?;
        Ok(())
    }

    /// Move the request back to pending and requeue it, or exhaust it.
    fn retry_after_attempt(
        &self,
        record: &mut RequestRecord,
        now: u64,
        effects: &mut Effects,
    ) -> Result<RoundOutcome> {
        let request = record.id();
        self.transition_best_effort(record, RequestEvent::Retry, now)?;
        record.retries += 1;
        if record.retries > self.config.retry_limit {
            return self.exhaust(record, now, effects);
        }
        self.persist_best_effort(LedgerEntry {
            request_id: request,
            attempt_seq: record.current_seq(),
            at_ms: now,
            event: LedgerEvent::RequestRequeued {
                retries: record.retries,
            },
        });
        self.queue.requeue(record.queued(), self.config.retry_ordering);
        Ok(RoundOutcome::Requeued {
            request,
            retries: record.retries,
            ready_at: now,
        })
    }

    /// Proposal withdrawn mid-round (notification failed): back to pending
    /// without spending a retry, so the round can try the next candidate.
    pub(super) fn fall_back(&self, record: &mut RequestRecord, now: u64) {
        if let Err(err) = self.transition_best_effort(record, RequestEvent::Retry, now) {
            warn!(request = %record.id(), error = %err, "could not return request to pending");
        }
    }

    /// Resolve an attempt, recording the outcome as bookkeeping.
    pub(super) fn resolve_attempt(
        &self,
        record: &mut RequestRecord,
        attempt_id: AttemptId,
        to: AttemptState,
        now: u64,
    ) -> Result<MatchAttempt> {
        let attempt = record
            .attempt(attempt_id)
            .copied()
            .ok_or_else(|| MatchError::attempt_not_found(attempt_id))?;
        attempt.state.resolve(to)?;
        self.persist_best_effort(LedgerEntry {
            request_id: record.id(),
            attempt_seq: attempt.seq,
            at_ms: now,
            event: LedgerEvent::AttemptResolved {
                attempt_id,
                driver_id: attempt.driver_id,
                state: to,
            },
        });
        self.mark_attempt(record, attempt_id, to)
    }

    fn mark_attempt(
        &self,
        record: &mut RequestRecord,
        attempt_id: AttemptId,
        to: AttemptState,
    ) -> Result<MatchAttempt> {
        let attempt = record
            .attempt_mut(attempt_id)
            .ok_or_else(|| MatchError::attempt_not_found(attempt_id))?;
        attempt.state = attempt.state.resolve(to)?;
        self.timers.cancel(attempt_id);
        Ok(*attempt)
    }
}
