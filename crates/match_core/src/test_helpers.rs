//! Test helpers for common engine setup and recording collaborators.
//!
//! This module provides shared test utilities to reduce duplication across
//! unit tests, integration tests and benches.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{Clock, ManualClock};
use crate::collaborators::{
    MatchedEvent, NotificationDispatcher, NotifyError, RiderFeedback, TripLifecycle,
};
use crate::config::{MatchingConfig, PersistenceRetryConfig};
use crate::engine::MatchingEngine;
use crate::error::{MatchError, Result};
use crate::geo::Coordinate;
use crate::ledger::{LedgerStore, MemoryLedgerStore};
use crate::types::{
    AttemptId, Availability, DriverId, NewRideRequest, RequestId, RequestSummary, RiderId,
};

/// Alexanderplatz, Berlin. Every test geography is laid out around it.
pub const TEST_ORIGIN: Coordinate = Coordinate::new(52.5219, 13.4132);

/// Clock reading every test engine starts at.
pub const TEST_START_MS: u64 = 1_000_000;

/// A point `north_km` north and `east_km` east of `origin` (small-offset approximation).
pub fn offset_km(origin: Coordinate, north_km: f64, east_km: f64) -> Coordinate {
    let lat = origin.lat + north_km / 111.32;
    let lng = origin.lng + east_km / (111.32 * origin.lat.to_radians().cos());
    Coordinate { lat, lng }
}

/// Defaults with no persistence back-off, so failure tests do not sleep.
pub fn test_config() -> MatchingConfig {
    MatchingConfig::default().with_persistence_retry(PersistenceRetryConfig {
        max_attempts: 3,
        base_delay_ms: 0,
        max_delay_ms: 0,
    })
}

/// A proposal as the driver would have received it.
#[derive(Debug, Clone, PartialEq)]
pub struct SentProposal {
    pub driver: DriverId,
    pub attempt: AttemptId,
    pub summary: RequestSummary,
}

/// Notification dispatcher that records every proposal and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentProposal>>,
    unreachable: Mutex<HashSet<DriverId>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every notification to `driver` fail.
    pub fn fail_for(&self, driver: DriverId) {
        self.unreachable.lock().insert(driver);
    }

    pub fn sent(&self) -> Vec<SentProposal> {
        self.sent.lock().clone()
    }

    /// The most recent proposal sent to `driver`.
    pub fn last_for(&self, driver: DriverId) -> Option<SentProposal> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|p| p.driver == driver)
            .cloned()
    }

    pub fn last(&self) -> Option<SentProposal> {
        self.sent.lock().last().cloned()
    }
}

impl NotificationDispatcher for RecordingNotifier {
    fn notify_driver(
        &self,
        driver: DriverId,
        attempt: AttemptId,
        summary: &RequestSummary,
    ) -> std::result::Result<(), NotifyError> {
        if self.unreachable.lock().contains(&driver) {
            return Err(NotifyError::Unreachable(driver.to_string()));
        }
        self.sent.lock().push(SentProposal {
            driver,
            attempt,
            summary: summary.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingTrips {
    events: Mutex<Vec<MatchedEvent>>,
}

impl RecordingTrips {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MatchedEvent> {
        self.events.lock().clone()
    }
}

impl TripLifecycle for RecordingTrips {
    fn matched(&self, event: MatchedEvent) {
        self.events.lock().push(event);
    }
}

/// No-match notice as the rider would have received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoMatchNotice {
    pub request_id: RequestId,
    pub rider: RiderId,
    pub exhausted: bool,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RecordingFeedback {
    notices: Mutex<Vec<NoMatchNotice>>,
}

impl RecordingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<NoMatchNotice> {
        self.notices.lock().clone()
    }
}

impl RiderFeedback for RecordingFeedback {
    fn no_match(&self, request_id: RequestId, rider: &RiderId, reason: &MatchError) {
        self.notices.lock().push(NoMatchNotice {
            request_id,
            rider: rider.clone(),
            exhausted: matches!(reason, MatchError::Exhausted { .. }),
            message: reason.to_string(),
        });
    }
}

/// Engine wired to a manual clock, an in-memory ledger and recording collaborators.
pub struct TestHarness {
    pub engine: MatchingEngine,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryLedgerStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub trips: Arc<RecordingTrips>,
    pub feedback: Arc<RecordingFeedback>,
}

impl TestHarness {
    pub fn new(config: MatchingConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryLedgerStore::new()))
    }

    /// Build over an existing store, e.g. to simulate a restart.
    pub fn with_store(config: MatchingConfig, store: Arc<MemoryLedgerStore>) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(TEST_START_MS));
        Self::assemble(config, clock, Arc::clone(&store), store)
    }

    /// Build over any ledger store, reusing `clock`. `store` is then a fresh,
    /// unused memory store.
    pub fn with_ledger(
        config: MatchingConfig,
        clock: Arc<ManualClock>,
        ledger: impl LedgerStore + 'static,
    ) -> Result<Self> {
        Self::assemble(config, clock, ledger, Arc::new(MemoryLedgerStore::new()))
    }

    fn assemble(
        config: MatchingConfig,
        clock: Arc<ManualClock>,
        ledger: impl LedgerStore + 'static,
        store: Arc<MemoryLedgerStore>,
    ) -> Result<Self> {
        let notifier = Arc::new(RecordingNotifier::new());
        let trips = Arc::new(RecordingTrips::new());
        let feedback = Arc::new(RecordingFeedback::new());
        let engine = MatchingEngine::builder(config)
            .with_clock(clock.clone())
            .with_notifier(notifier.clone())
            .with_trip_lifecycle(trips.clone())
            .with_rider_feedback(feedback.clone())
            .with_ledger_store(ledger)
            .build()?;
        Ok(Self {
            engine,
            clock,
            store,
            notifier,
            trips,
            feedback,
        })
    }

    /// Place a driver and mark it available.
    pub fn add_driver(&self, id: u64, position: Coordinate) -> Result<DriverId> {
        let driver = DriverId(id);
        self.engine
            .update_driver_position(driver, position, self.clock.now_ms())?;
        self.engine
            .update_driver_availability(driver, Availability::Available)?;
        Ok(driver)
    }

    pub fn submit(&self, rider: &str, pickup: Coordinate) -> Result<RequestId> {
        self.engine.submit_request(NewRideRequest::new(
            rider,
            pickup,
            offset_km(pickup, 3.0, 3.0),
        ))
    }

    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.clock.advance(delta_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_land_at_the_requested_distance() {
        let point = offset_km(TEST_ORIGIN, 1.0, 0.0);
        let distance = TEST_ORIGIN.distance_km(&point);
        assert!((distance - 1.0).abs() < 0.01, "got {distance}");

        let point = offset_km(TEST_ORIGIN, 0.0, 2.0);
        let distance = TEST_ORIGIN.distance_km(&point);
        assert!((distance - 2.0).abs() < 0.02, "got {distance}");
    }

    #[test]
    fn notifier_can_fail_selected_drivers() {
        let notifier = RecordingNotifier::new();
        let summary = RequestSummary {
            request_id: RequestId(1),
            pickup: TEST_ORIGIN,
            dropoff: TEST_ORIGIN,
            pickup_distance_km: 0.0,
            deadline: 0,
        };
        notifier.fail_for(DriverId(2));
        assert!(notifier
            .notify_driver(DriverId(1), AttemptId(1), &summary)
            .is_ok());
        assert!(notifier
            .notify_driver(DriverId(2), AttemptId(2), &summary)
            .is_err());
        assert_eq!(notifier.sent().len(), 1);
    }
}
