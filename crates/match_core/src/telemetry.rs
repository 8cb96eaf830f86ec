//! Telemetry / KPIs: counters updated by the engine from any worker thread.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MatchTelemetry {
    submitted: AtomicU64,
    proposals: AtomicU64,
    reservation_conflicts: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
    exhausted: AtomicU64,
    notification_failures: AtomicU64,
    stale_releases: AtomicU64,
    persistence_retries: AtomicU64,
    replayed_decisions: AtomicU64,
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchCounts {
    pub submitted: u64,
    pub proposals: u64,
    pub reservation_conflicts: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Includes requests that expired through exhaustion.
    pub expired: u64,
    pub exhausted: u64,
    pub notification_failures: u64,
    pub stale_releases: u64,
    pub persistence_retries: u64,
    pub replayed_decisions: u64,
}

impl MatchCounts {
    /// Share of proposals the drivers accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposals == 0 {
            return 0.0;
        }
        self.accepted as f64 / self.proposals as f64
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MatchTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        bump(&self.submitted);
    }

    pub fn record_proposal(&self) {
        bump(&self.proposals);
    }

    pub fn record_conflict(&self) {
        bump(&self.reservation_conflicts);
    }

    pub fn record_accepted(&self) {
        bump(&self.accepted);
    }

    pub fn record_rejected(&self) {
        bump(&self.rejected);
    }

    pub fn record_timed_out(&self) {
        bump(&self.timed_out);
    }

    pub fn record_cancelled(&self) {
        bump(&self.cancelled);
    }

    pub fn record_expired(&self) {
        bump(&self.expired);
    }

    pub fn record_exhausted(&self) {
        bump(&self.exhausted);
    }

    pub fn record_notification_failure(&self) {
        bump(&self.notification_failures);
    }

    pub fn record_stale_release(&self) {
        bump(&self.stale_releases);
    }

    pub fn record_persistence_retry(&self) {
        bump(&self.persistence_retries);
    }

    pub fn record_replayed_decision(&self) {
        bump(&self.replayed_decisions);
    }

    pub fn snapshot(&self) -> MatchCounts {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MatchCounts {
            submitted: load(&self.submitted),
            proposals: load(&self.proposals),
            reservation_conflicts: load(&self.reservation_conflicts),
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            timed_out: load(&self.timed_out),
            cancelled: load(&self.cancelled),
            expired: load(&self.expired),
            exhausted: load(&self.exhausted),
            notification_failures: load(&self.notification_failures),
            stale_releases: load(&self.stale_releases),
            persistence_retries: load(&self.persistence_retries),
            replayed_decisions: load(&self.replayed_decisions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let telemetry = MatchTelemetry::new();
        telemetry.record_proposal();
        telemetry.record_proposal();
        telemetry.record_accepted();
        telemetry.record_conflict();

        let counts = telemetry.snapshot();
        assert_eq!(counts.proposals, 2);
        assert_eq!(counts.accepted, 1);
        assert_eq!(counts.reservation_conflicts, 1);
        assert!((counts.acceptance_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn acceptance_rate_without_proposals_is_zero() {
        assert_eq!(MatchCounts::default().acceptance_rate(), 0.0);
    }
}
