//! Simulated driver apps: receive proposals and answer them later.

use match_core::collaborators::{NotificationDispatcher, NotifyError};
use match_core::types::{AttemptId, Decision, DriverId, RequestSummary};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Driver behaviour: stochastic logit model for accept/reject decisions.
#[derive(Debug, Clone, Copy)]
pub struct DriverDecisionConfig {
    /// Seed for RNG (for reproducibility).
    pub seed: u64,
    /// Penalty per km of pickup distance (longer pickup distance decreases acceptance).
    pub pickup_distance_penalty: f64,
    /// Bonus per km of trip distance (longer trips increase acceptance).
    pub trip_distance_bonus: f64,
    /// Base acceptance score before factors are applied.
    pub base_acceptance_score: f64,
    /// Share of proposals the driver never answers.
    pub no_response_share: f64,
    /// Share of notifications that fail to reach the driver app.
    pub unreachable_share: f64,
    /// Slowest answer a driver gives, in ms.
    pub max_response_ms: u64,
}

impl Default for DriverDecisionConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            pickup_distance_penalty: -0.8,
            trip_distance_bonus: 0.1,
            base_acceptance_score: 1.0,
            no_response_share: 0.05,
            unreachable_share: 0.01,
            max_response_ms: 12_000,
        }
    }
}

impl DriverDecisionConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_base_acceptance_score(mut self, score: f64) -> Self {
        self.base_acceptance_score = score;
        self
    }

    pub fn with_no_response_share(mut self, share: f64) -> Self {
        self.no_response_share = share.clamp(0.0, 1.0);
        self
    }
}

/// A decision the simulated driver will deliver once `decide_at` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDecision {
    pub decide_at: u64,
    pub attempt: AttemptId,
    pub driver: DriverId,
    pub decision: Decision,
}

fn logit_accepts_stochastic(score: f64, rng: &mut StdRng) -> bool {
    let probability = 1.0 / (1.0 + (-score).exp());
    rng.gen::<f64>() < probability
}

/// Notification endpoint standing in for every driver app.
///
/// Answers are decided at notification time and parked in an inbox; the
/// simulation loop delivers them through the engine when they fall due.
#[derive(Debug)]
pub struct SimulatedDrivers {
    config: DriverDecisionConfig,
    decision_window_ms: u64,
    inbox: Mutex<Vec<PendingDecision>>,
}

impl SimulatedDrivers {
    pub fn new(config: DriverDecisionConfig, decision_window_ms: u64) -> Self {
        Self {
            config,
            decision_window_ms,
            inbox: Mutex::new(Vec::new()),
        }
    }

    /// Remove and return every decision due at `now`, oldest first.
    pub fn take_due(&self, now: u64) -> Vec<PendingDecision> {
        let mut inbox = self.inbox.lock();
        let (mut due, rest): (Vec<_>, Vec<_>) =
            inbox.drain(..).partition(|d| d.decide_at <= now);
        *inbox = rest;
        due.sort_by_key(|d| (d.decide_at, d.attempt));
        due
    }

    pub fn next_due(&self) -> Option<u64> {
        self.inbox.lock().iter().map(|d| d.decide_at).min()
    }

    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }

    fn score(&self, summary: &RequestSummary) -> f64 {
        let trip_km = summary.pickup.distance_km(&summary.dropoff);
        self.config.base_acceptance_score
            + summary.pickup_distance_km * self.config.pickup_distance_penalty
            + trip_km * self.config.trip_distance_bonus
    }
}

impl NotificationDispatcher for SimulatedDrivers {
    fn notify_driver(
        &self,
        driver: DriverId,
        attempt: AttemptId,
        summary: &RequestSummary,
    ) -> Result<(), NotifyError> {
        // One stream per attempt keeps runs reproducible regardless of thread interleaving.
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(attempt.0));
        if rng.gen_bool(self.config.unreachable_share) {
            return Err(NotifyError::Unreachable(format!("driver {driver} app offline")));
        }
        if rng.gen_bool(self.config.no_response_share) {
            return Ok(());
        }

        let decision = if logit_accepts_stochastic(self.score(summary), &mut rng) {
            Decision::Accept
        } else {
            Decision::Reject
        };
        let proposed_at = summary.deadline.saturating_sub(self.decision_window_ms);
        let delay = rng.gen_range(500..=self.config.max_response_ms.max(500));
        self.inbox.lock().push(PendingDecision {
            decide_at: proposed_at + delay,
            attempt,
            driver,
            decision,
        });
        Ok(())
    }
}
