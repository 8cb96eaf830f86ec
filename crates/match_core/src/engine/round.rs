//! One matching round: dequeue, search, reserve, propose.

use tracing::{debug, info, warn};

use crate::config::RetryOrdering;
use crate::error::{MatchError, Result};
use crate::ledger::{LedgerEntry, LedgerEvent};
use crate::queue::{Dequeued, QueuedRequest};
use crate::spatial::Candidate;
use crate::types::{
    AttemptId, AttemptState, DriverId, MatchAttempt, RequestEvent, RequestId, RequestState,
    RequestSummary,
};

use super::slot::{Effects, NotifyScope, RequestRecord, RequestSlot};
use super::MatchingEngine;

/// What happened to the request taken off the queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoundOutcome {
    /// A driver was reserved and notified.
    Proposed {
        request: RequestId,
        attempt: AttemptId,
        driver: DriverId,
    },
    /// No driver could be reserved; the request waits until `ready_at`.
    Requeued {
        request: RequestId,
        retries: u32,
        ready_at: u64,
    },
    /// No driver could be reserved and the retry limit is spent.
    Exhausted { request: RequestId, retries: u32 },
    /// The request overstayed the maximum wait.
    Expired { request: RequestId },
    /// The request was no longer pending, or a cancellation for it was in
    /// flight (it is queued again until that cancellation lands).
    Skipped { request: RequestId },
}

/// Why a reserved candidate did not end up proposed.
enum ProposeFailure {
    /// The driver could not be reached; try the next candidate.
    Notify,
    /// The proposal could not be made durable; give up on this round.
    Persist(MatchError),
}

impl MatchingEngine {
    /// Take the next request off the queue and run one round for it.
    pub fn process_next(&self) -> Result<Option<RoundOutcome>> {
        if NotifyScope::is_active() {
            return Err(MatchError::Reentrant {
                operation: "matching rounds",
            });
        }
        let now = self.clock.now_ms();
        let Some(item) = self.queue.dequeue_next(now) else {
            return Ok(None);
        };
        let outcome = match item {
            Dequeued::Expired(entry) => self.expire_overdue(entry, now),
            Dequeued::Ready(entry) => self.run_round(entry.request_id, now)?,
        };
        Ok(Some(outcome))
    }

    fn run_round(&self, id: RequestId, now: u64) -> Result<RoundOutcome> {
        let Ok(slot) = self.slot(id) else {
            warn!(request = %id, "queued request has no record");
            return Ok(RoundOutcome::Skipped { request: id });
        };
        let mut effects = Effects::default();
        let outcome = {
            let mut record = slot.record.lock();
            self.match_round(&slot, &mut record, now, &mut effects)
        };
        self.dispatch(effects);
        outcome
    }

    fn match_round(
        &self,
        slot: &RequestSlot,
        record: &mut RequestRecord,
        now: u64,
        effects: &mut Effects,
    ) -> Result<RoundOutcome> {
        let request = record.id();
        if record.request.state != RequestState::Pending {
            return Ok(RoundOutcome::Skipped { request });
        }
        if slot.is_cancel_requested() {
            return Ok(self.yield_to_cancel(record));
        }

        // The iterator owns its snapshot, so the index lock is released here.
        let nearest = self.index.read().query_nearest(
            record.request.pickup,
            self.config.search_radius_km,
            usize::MAX,
            &record.excluded,
        )?;
        let candidates = nearest
            .filter(|c| self.registry.is_available(c.driver_id))
            .take(self.config.candidate_breadth);

        for candidate in candidates {
            if slot.is_cancel_requested() {
                return Ok(self.yield_to_cancel(record));
            }

            let attempt_id = self.allocate_attempt_id();
            // Registered before reserving so a concurrent offline report can find it.
            self.attempt_owner.insert(attempt_id, request);
            match self.registry.try_reserve(candidate.driver_id, attempt_id, now) {
                Ok(()) => {}
                Err(MatchError::Conflict { .. } | MatchError::NotFound { .. }) => {
                    self.attempt_owner.remove(&attempt_id);
                    self.telemetry.record_conflict();
                    debug!(%request, driver = %candidate.driver_id, "reservation lost, trying next candidate");
                    continue;
                }
                Err(err) => {
                    self.attempt_owner.remove(&attempt_id);
                    return Err(err);
                }
            }

            match self.propose(record, candidate, attempt_id, now) {
                Ok(attempt) => {
                    return Ok(RoundOutcome::Proposed {
                        request,
                        attempt: attempt.id,
                        driver: attempt.driver_id,
                    })
                }
                Err(ProposeFailure::Notify) => continue,
                Err(ProposeFailure::Persist(err)) => {
                    warn!(%request, error = %err, "proposal not durable, retrying later");
                    break;
                }
            }
        }

        self.requeue_after_empty_round(record, now, effects)
    }

    /// Record and announce a proposal for a driver already reserved under `attempt_id`.
    fn propose(
        &self,
        record: &mut RequestRecord,
        candidate: Candidate,
        attempt_id: AttemptId,
        now: u64,
    ) -> std::result::Result<MatchAttempt, ProposeFailure> {
        let request = record.id();
        let driver = candidate.driver_id;
        let attempt = MatchAttempt {
            id: attempt_id,
            request_id: request,
            driver_id: driver,
            seq: record.current_seq() + 1,
            proposed_at: now,
            deadline: now.saturating_add(self.config.decision_window_ms),
            state: AttemptState::Proposed,
        };
        let from = record.request.state;

        let recorded = from.apply(RequestEvent::Propose).and_then(|to| {
            self.persist(LedgerEntry {
                request_id: request,
                attempt_seq: attempt.seq,
                at_ms: now,
                event: LedgerEvent::AttemptProposed {
                    attempt_id,
                    driver_id: driver,
                    deadline_ms: attempt.deadline,
                },
            })?;
            Ok(to)
        });
        let to = match recorded {
            Ok(to) => to,
            Err(err) => {
                self.attempt_owner.remove(&attempt_id);
                self.release_driver(driver, attempt_id, now);
                return Err(ProposeFailure::Persist(err));
            }
        };
        if let Err(err) = self.persist(LedgerEntry {
            request_id: request,
            attempt_seq: attempt.seq,
            at_ms: now,
            event: LedgerEvent::RequestStateChanged { from, to },
        }) {
            // The attempt is on record already: keep it, withdrawn, so its
            // sequence number is never handed out twice.
            record.attempts.push(MatchAttempt {
                state: AttemptState::Cancelled,
                ..attempt
            });
            self.persist_best_effort(LedgerEntry {
                request_id: request,
                attempt_seq: attempt.seq,
                at_ms: now,
                event: LedgerEvent::AttemptResolved {
                    attempt_id,
                    driver_id: driver,
                    state: AttemptState::Cancelled,
                },
            });
            self.release_driver(driver, attempt_id, now);
            return Err(ProposeFailure::Persist(err));
        }

        record.attempts.push(attempt);
        record.request.state = to;
        self.timers.arm(attempt_id, attempt.deadline);
        self.telemetry.record_proposal();

        let summary = RequestSummary {
            request_id: request,
            pickup: record.request.pickup,
            dropoff: record.request.dropoff,
            pickup_distance_km: candidate.distance_km,
            deadline: attempt.deadline,
        };
        let sent = {
            let _scope = NotifyScope::enter();
            self.notifier.notify_driver(driver, attempt_id, &summary)
        };
        if let Err(err) = sent {
            warn!(%request, %driver, attempt = %attempt_id, error = %err, "driver notification failed");
            self.telemetry.record_notification_failure();
            if let Err(err) = self.resolve_attempt(record, attempt_id, AttemptState::Cancelled, now) {
                warn!(%request, attempt = %attempt_id, error = %err, "could not withdraw proposal");
            }
            self.release_driver(driver, attempt_id, now);
            record.excluded.insert(driver);
            self.fall_back(record, now);
            return Err(ProposeFailure::Notify);
        }

        debug!(
            %request,
            %driver,
            attempt = %attempt_id,
            distance_km = candidate.distance_km,
            deadline = attempt.deadline,
            "proposal sent"
        );
        Ok(attempt)
    }

    /// A cancellation is waiting for the lock. The request goes back to the
    /// retry lane: a successful cancel removes it again, a failed one leaves
    /// it to be matched.
    fn yield_to_cancel(&self, record: &RequestRecord) -> RoundOutcome {
        let request = record.id();
        self.queue.requeue(record.queued(), RetryOrdering::Front);
        debug!(%request, "round yielded to a pending cancellation");
        RoundOutcome::Skipped { request }
    }

    /// No candidate could be reserved: back off, or give up past the retry limit.
    fn requeue_after_empty_round(
        &self,
        record: &mut RequestRecord,
        now: u64,
        effects: &mut Effects,
    ) -> Result<RoundOutcome> {
        let request = record.id();
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
        let ready_at = now.saturating_add(self.config.retry_backoff.delay_ms(record.retries));
        self.queue
            .park(record.queued(), ready_at, self.config.retry_ordering);
        debug!(%request, retries = record.retries, ready_at, "no driver reserved, backing off");
        Ok(RoundOutcome::Requeued {
            request,
            retries: record.retries,
            ready_at,
        })
    }

    /// Retry limit spent: the request expires and the rider hears "no match".
    pub(super) fn exhaust(
        &self,
        record: &mut RequestRecord,
        now: u64,
        effects: &mut Effects,
    ) -> Result<RoundOutcome> {
        let request = record.id();
        let retries = record.retries;
        self.transition_best_effort(record, RequestEvent::Expire, now)?;
        self.queue.remove(request);
        self.telemetry.record_exhausted();
        self.telemetry.record_expired();
        effects.no_match.push((
            request,
            record.request.rider.clone(),
            MatchError::Exhausted { request, retries },
        ));
        info!(%request, retries, "retry limit reached, request expired");
        Ok(RoundOutcome::Exhausted { request, retries })
    }

    fn expire_overdue(&self, entry: QueuedRequest, now: u64) -> RoundOutcome {
        let request = entry.request_id;
        let Ok(slot) = self.slot(request) else {
            return RoundOutcome::Skipped { request };
        };
        let mut effects = Effects::default();
        let outcome = {
            let mut record = slot.record.lock();
            if record.request.state != RequestState::Pending {
                RoundOutcome::Skipped { request }
            } else {
                match self.transition_best_effort(&mut record, RequestEvent::Expire, now) {
                    Ok(()) => {
                        self.telemetry.record_expired();
                        effects.no_match.push((
                            request,
                            record.request.rider.clone(),
                            MatchError::Expired {
                                request,
                                attempt: None,
                            },
                        ));
                        info!(%request, waited_ms = now.saturating_sub(entry.created_at), "request exceeded max wait");
                        RoundOutcome::Expired { request }
                    }
                    Err(err) => {
                        warn!(%request, error = %err, "could not expire request");
                        RoundOutcome::Skipped { request }
                    }
                }
            }
        };
        self.dispatch(effects);
        outcome
    }

    /// Apply a request transition whose ledger record is bookkeeping only.
    pub(super) fn transition_best_effort(
        &self,
        record: &mut RequestRecord,
        event: RequestEvent,
        now: u64,
    ) -> Result<()> {
        let from = record.request.state;
        let to = from.apply(event)?;
        self.persist_best_effort(LedgerEntry {
            request_id: record.id(),
            attempt_seq: record.current_seq(),
            at_ms: now,
            event: LedgerEvent::RequestStateChanged { from, to },
        });
        record.request.state = to;
        Ok(())
    }
}
