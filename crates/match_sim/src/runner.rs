//! Event-driven simulation loop around a shared [`MatchingEngine`].
//!
//! The loop owns the clock: it delivers everything due at the current instant
//! (rider submissions, driver answers, rider cancellations, trip completions),
//! lets the worker pool drain the engine, then jumps to the next due instant.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use anyhow::{anyhow, Context};
use match_core::clock::{Clock, ManualClock};
use match_core::collaborators::{MatchedEvent, RiderFeedback, TripLifecycle};
use match_core::registry::RegistryCounts;
use match_core::telemetry::MatchCounts;
use match_core::types::{AttemptState, Availability, NewRideRequest, RequestId, RiderId};
use match_core::{MatchError, MatchingEngine};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::decision::SimulatedDrivers;
use crate::scenario::Scenario;

/// Collects matched events and no-match notices raised by the engine.
#[derive(Debug, Default)]
pub struct TripBoard {
    matched: Mutex<Vec<MatchedEvent>>,
    no_match: Mutex<u64>,
}

impl TripBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_matched(&self) -> Vec<MatchedEvent> {
        std::mem::take(&mut *self.matched.lock())
    }

    pub fn no_match_notices(&self) -> u64 {
        *self.no_match.lock()
    }
}

impl TripLifecycle for TripBoard {
    fn matched(&self, event: MatchedEvent) {
        self.matched.lock().push(event);
    }
}

impl RiderFeedback for TripBoard {
    fn no_match(&self, request_id: RequestId, rider: &RiderId, reason: &MatchError) {
        debug!(request = %request_id, %rider, %reason, "rider told no driver was found");
        *self.no_match.lock() += 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunParams {
    /// Worker threads calling `tick` concurrently.
    pub workers: usize,
    /// Average driving speed used for trip durations.
    pub trip_speed_kmh: f64,
    /// Stop after this much simulated time even if work remains.
    pub end_after_ms: u64,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            workers: 4,
            trip_speed_kmh: 25.0,
            end_after_ms: 4 * 60 * 60 * 1000,
        }
    }
}

/// KPIs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub counts: MatchCounts,
    pub drivers: RegistryCounts,
    pub completed_trips: u64,
    pub rider_cancels: u64,
    pub no_match_notices: u64,
    /// Mean time from submission to match, over matched requests.
    pub mean_time_to_match_ms: Option<f64>,
    pub simulated_ms: u64,
    pub steps: u64,
}

pub struct Simulation<'a> {
    engine: &'a MatchingEngine,
    clock: &'a ManualClock,
    drivers: &'a SimulatedDrivers,
    board: &'a TripBoard,
    params: RunParams,
}

impl<'a> Simulation<'a> {
    pub fn new(
        engine: &'a MatchingEngine,
        clock: &'a ManualClock,
        drivers: &'a SimulatedDrivers,
        board: &'a TripBoard,
        params: RunParams,
    ) -> Self {
        Self {
            engine,
            clock,
            drivers,
            board,
            params,
        }
    }

    pub fn run(&self, scenario: &Scenario) -> anyhow::Result<RunSummary> {
        let start = self.clock.now_ms();
        let stop_at = start.saturating_add(self.params.end_after_ms);
        for (driver, position) in &scenario.drivers {
            self.engine
                .update_driver_position(*driver, *position, start)
                .with_context(|| format!("placing driver {driver}"))?;
            self.engine
                .update_driver_availability(*driver, Availability::Available)
                .with_context(|| format!("bringing driver {driver} online"))?;
        }

        let mut arrivals = scenario.arrivals.iter().peekable();
        let mut cancels: BinaryHeap<Reverse<(u64, RequestId)>> = BinaryHeap::new();
        let mut completions: BinaryHeap<Reverse<(u64, RequestId)>> = BinaryHeap::new();
        let mut completed_trips = 0u64;
        let mut rider_cancels = 0u64;
        let mut match_waits: Vec<u64> = Vec::new();
        let mut steps = 0u64;

        loop {
            let now = self.clock.now_ms();
            steps += 1;

            while let Some(arrival) = arrivals.next_if(|a| start + a.at_ms <= now) {
                let new_request =
                    NewRideRequest::new(arrival.rider.clone(), arrival.pickup, arrival.dropoff)
                        .with_priority(arrival.priority);
                match self.engine.submit_request(new_request) {
                    Ok(id) => {
                        if let Some(patience) = arrival.patience_ms {
                            cancels.push(Reverse((now + patience, id)));
                        }
                    }
                    Err(err) => warn!(rider = %arrival.rider, error = %err, "submission refused"),
                }
            }

            for pending in self.drivers.take_due(now) {
                if let Err(err) = self
                    .engine
                    .record_driver_decision(pending.attempt, pending.decision)
                {
                    debug!(attempt = %pending.attempt, driver = %pending.driver, error = %err, "decision not applied");
                }
            }

            while let Some(Reverse((_, request))) = cancels.pop_if_due(now) {
                match self.engine.cancel_request(request) {
                    Ok(_) => rider_cancels += 1,
                    Err(MatchError::IllegalTransition { .. }) => {}
                    Err(err) => warn!(%request, error = %err, "rider cancellation failed"),
                }
            }

            while let Some(Reverse((_, request))) = completions.pop_if_due(now) {
                self.complete(request, now)?;
                completed_trips += 1;
            }

            self.drain_with_workers()?;

            for event in self.board.take_matched() {
                let Some(request) = self.engine.request(event.request_id) else {
                    continue;
                };
                match_waits.push(event.matched_at.saturating_sub(request.created_at));
                let trip_km = request.pickup.distance_km(&request.dropoff);
                let hours = trip_km / self.params.trip_speed_kmh.max(1.0);
                let duration_ms = (hours * 3_600_000.0).ceil() as u64;
                completions.push(Reverse((event.matched_at + duration_ms.max(1), event.request_id)));
            }

            let next = [
                arrivals.peek().map(|a| start + a.at_ms),
                self.drivers.next_due(),
                cancels.peek().map(|Reverse((at, _))| *at),
                completions.peek().map(|Reverse((at, _))| *at),
                self.engine.next_wakeup(),
            ]
            .into_iter()
            .flatten()
            .min();

            let Some(next) = next else {
                break;
            };
            if next >= stop_at {
                warn!(simulated_ms = now - start, "simulation end time reached with work left");
                break;
            }
            self.clock.set(next.max(now + 1));
        }

        let mean_time_to_match_ms = (!match_waits.is_empty())
            .then(|| match_waits.iter().sum::<u64>() as f64 / match_waits.len() as f64);
        let summary = RunSummary {
            counts: self.engine.telemetry(),
            drivers: self.engine.registry_counts(),
            completed_trips,
            rider_cancels,
            no_match_notices: self.board.no_match_notices(),
            mean_time_to_match_ms,
            simulated_ms: self.clock.now_ms() - start,
            steps,
        };
        info!(
            steps,
            simulated_ms = summary.simulated_ms,
            completed_trips,
            "simulation finished"
        );
        Ok(summary)
    }

    /// Finish the trip and leave the driver at the dropoff point.
    fn complete(&self, request: RequestId, now: u64) -> anyhow::Result<()> {
        let driver = self
            .engine
            .attempts(request)
            .into_iter()
            .find(|a| a.state == AttemptState::Accepted)
            .map(|a| a.driver_id);
        self.engine
            .complete_trip(request)
            .with_context(|| format!("completing trip for {request}"))?;
        if let (Some(driver), Some(ride)) = (driver, self.engine.request(request)) {
            self.engine
                .update_driver_position(driver, ride.dropoff, now)
                .with_context(|| format!("moving driver {driver} to dropoff"))?;
        }
        Ok(())
    }

    fn drain_with_workers(&self) -> anyhow::Result<()> {
        let workers = self.params.workers.max(1);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| scope.spawn(|| self.engine.run_until_idle(usize::MAX)))
                .collect();
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| anyhow!("matching worker panicked"))??;
            }
            Ok(())
        })
    }
}

trait PopDue<T> {
    fn pop_if_due(&mut self, now: u64) -> Option<Reverse<(u64, T)>>;
}

impl<T: Ord> PopDue<T> for BinaryHeap<Reverse<(u64, T)>> {
    fn pop_if_due(&mut self, now: u64) -> Option<Reverse<(u64, T)>> {
        match self.peek() {
            Some(Reverse((at, _))) if *at <= now => self.pop(),
            _ => None,
        }
    }
}
