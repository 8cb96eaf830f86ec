//! Rebuild engine state from the match ledger after a restart.
//!
//! Durable history is folded per request in append order. Drivers are
//! restored as reserved or on trip when the ledger says they were; everything
//! else about drivers comes back with their next heartbeat.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use crate::ledger::{LedgerEntry, LedgerEvent};
use crate::types::{AttemptState, DriverState, MatchAttempt, RequestId, RequestState, RideRequest};

use super::slot::{RequestRecord, RequestSlot};
use super::MatchingEngine;

#[derive(Debug, Default)]
struct ReplaySummary {
    requests: usize,
    pending: usize,
    proposed: usize,
    matched: usize,
}

fn fold(entries: &[LedgerEntry]) -> (BTreeMap<RequestId, RequestRecord>, u64) {
    let mut records: BTreeMap<RequestId, RequestRecord> = BTreeMap::new();
    let mut max_attempt = 0;

    for entry in entries {
        let id = entry.request_id;
        if let LedgerEvent::RequestSubmitted {
            rider,
            pickup,
            dropoff,
            priority,
        } = &entry.event
        {
            records.entry(id).or_insert_with(|| {
                RequestRecord::new(RideRequest {
                    id,
                    rider: rider.clone(),
                    pickup: *pickup,
                    dropoff: *dropoff,
                    priority: *priority,
                    created_at: entry.at_ms,
                    state: RequestState::Pending,
                })
            });
            continue;
        }

        let Some(record) = records.get_mut(&id) else {
            warn!(request = %id, kind = entry.event.kind_code(), "ledger entry for unknown request skipped");
            continue;
        };
        match &entry.event {
            LedgerEvent::RequestSubmitted { .. } => {}
            LedgerEvent::RequestStateChanged { to, .. } => record.request.state = *to,
            LedgerEvent::RequestRequeued { retries } => {
                record.retries = record.retries.max(*retries);
            }
            LedgerEvent::AttemptProposed {
                attempt_id,
                driver_id,
                deadline_ms,
            } => {
                max_attempt = max_attempt.max(attempt_id.0);
                if record.attempt(*attempt_id).is_none() {
                    record.attempts.push(MatchAttempt {
                        id: *attempt_id,
                        request_id: id,
                        driver_id: *driver_id,
                        seq: entry.attempt_seq,
                        proposed_at: entry.at_ms,
                        deadline: *deadline_ms,
                        state: AttemptState::Proposed,
                    });
                }
            }
            LedgerEvent::AttemptResolved {
                attempt_id,
                driver_id,
                state,
            } => {
                if let Some(attempt) = record.attempt_mut(*attempt_id) {
                    attempt.state = *state;
                }
                if matches!(state, AttemptState::Rejected | AttemptState::TimedOut) {
                    record.excluded.insert(*driver_id);
                }
            }
        }
    }
    (records, max_attempt)
}

impl MatchingEngine {
    pub(super) fn replay_ledger(&self) {
        let entries = self.ledger.entries();
        if entries.is_empty() {
            return;
        }
        let (records, max_attempt) = fold(&entries);
        let now = self.clock.now_ms();
        let mut summary = ReplaySummary::default();
        let mut max_request = 0;

        for (id, mut record) in records {
            max_request = max_request.max(id.0);
            summary.requests += 1;

            // Only the latest proposal of a proposed request is still live.
            let live = match record.request.state {
                RequestState::Proposed => record.proposed_attempt().map(|a| a.id),
                _ => None,
            };
            for attempt in record.attempts.iter_mut() {
                if attempt.state == AttemptState::Proposed && Some(attempt.id) != live {
                    attempt.state = AttemptState::Cancelled;
                }
            }

            match record.request.state {
                RequestState::Proposed => match record.proposed_attempt() {
                    Some(attempt) => {
                        self.registry.restore(
                            attempt.driver_id,
                            DriverState::Reserved(attempt.id),
                            now,
                        );
                        self.timers.arm(attempt.id, attempt.deadline);
                        summary.proposed += 1;
                    }
                    None => record.request.state = RequestState::Pending,
                },
                RequestState::Matched => {
                    if let Some(attempt) = record
                        .attempts
                        .iter()
                        .rev()
                        .find(|a| a.state == AttemptState::Accepted)
                    {
                        self.registry
                            .restore(attempt.driver_id, DriverState::OnTrip(attempt.id), now);
                    }
                    summary.matched += 1;
                }
                _ => {}
            }

            for attempt in &record.attempts {
                self.attempt_owner.insert(attempt.id, id);
            }
            if record.request.state == RequestState::Pending {
                if let Err(err) = self.queue.enqueue(&record.request) {
                    warn!(request = %id, error = %err, "recovered request could not be queued");
                } else {
                    summary.pending += 1;
                }
            }
            self.requests.insert(id, Arc::new(RequestSlot::new(record)));
        }

        self.next_request_id.store(max_request + 1, Ordering::SeqCst);
        self.next_attempt_id.store(max_attempt + 1, Ordering::SeqCst);
        info!(
            entries = entries.len(),
            requests = summary.requests,
            pending = summary.pending,
            proposed = summary.proposed,
            matched = summary.matched,
            "match ledger replayed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::types::{DriverId, RequestPriority, AttemptId};

    fn at(request: u64, seq: u32, at_ms: u64, event: LedgerEvent) -> LedgerEntry {
        LedgerEntry {
            request_id: RequestId(request),
            attempt_seq: seq,
            at_ms,
            event,
        }
    }

    fn submitted() -> LedgerEvent {
        LedgerEvent::RequestSubmitted {
            rider: "rider-1".into(),
            pickup: Coordinate::new(52.52, 13.40),
            dropoff: Coordinate::new(52.50, 13.30),
            priority: RequestPriority::Normal,
        }
    }

    #[test]
    fn fold_tracks_attempts_and_exclusions() {
        let entries = vec![
            at(1, 0, 10, submitted()),
            at(
                1,
                1,
                20,
                LedgerEvent::AttemptProposed {
                    attempt_id: AttemptId(4),
                    driver_id: DriverId(9),
                    deadline_ms: 50,
                },
            ),
            at(
                1,
                1,
                20,
                LedgerEvent::RequestStateChanged {
                    from: RequestState::Pending,
                    to: RequestState::Proposed,
                },
            ),
            at(
                1,
                1,
                30,
                LedgerEvent::AttemptResolved {
                    attempt_id: AttemptId(4),
                    driver_id: DriverId(9),
                    state: AttemptState::Rejected,
                },
            ),
            at(
                1,
                1,
                30,
                LedgerEvent::RequestStateChanged {
                    from: RequestState::Proposed,
                    to: RequestState::Pending,
                },
            ),
            at(1, 1, 30, LedgerEvent::RequestRequeued { retries: 1 }),
        ];

        let (records, max_attempt) = fold(&entries);
        let record = &records[&RequestId(1)];
        assert_eq!(max_attempt, 4);
        assert_eq!(record.request.state, RequestState::Pending);
        assert_eq!(record.request.created_at, 10);
        assert_eq!(record.retries, 1);
        assert_eq!(record.attempts[0].state, AttemptState::Rejected);
        assert!(record.excluded.contains(&DriverId(9)));
    }

    #[test]
    fn fold_skips_entries_without_a_submission() {
        let entries = vec![at(
            7,
            0,
            5,
            LedgerEvent::RequestStateChanged {
                from: RequestState::Pending,
                to: RequestState::Cancelled,
            },
        )];
        let (records, _) = fold(&entries);
        assert!(records.is_empty());
    }
}
