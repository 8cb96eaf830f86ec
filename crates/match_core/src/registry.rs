//! Driver availability registry: the single authority over driver state.
//!
//! Every mutation is a compare-and-swap on one driver's entry, performed while
//! holding that entry's shard lock. Workers racing for the same driver are
//! serialised there and exactly one of them observes `Available`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{MatchError, Result};
use crate::types::{AttemptId, Availability, DriverId, DriverState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverRecord {
    pub state: DriverState,
    /// Milliseconds of the last state change.
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The driver had already moved on under a different token (or none).
    Stale,
}

/// Result of an availability update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityChange {
    pub state: DriverState,
    /// Reservation that was dropped because the driver went offline.
    pub aborted: Option<AttemptId>,
}

#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: DashMap<DriverId, DriverRecord>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn state(&self, driver: DriverId) -> Option<DriverState> {
        self.drivers.get(&driver).map(|record| record.state)
    }

    pub fn is_available(&self, driver: DriverId) -> bool {
        matches!(self.state(driver), Some(DriverState::Available))
    }

    /// Register a driver as offline if it is not known yet.
    pub fn ensure_registered(&self, driver: DriverId, now: u64) {
        self.drivers.entry(driver).or_insert(DriverRecord {
            state: DriverState::Offline,
            updated_at: now,
        });
    }

    /// Apply a driver-reported availability change.
    ///
    /// Going offline while reserved drops the reservation and reports the
    /// attempt so the engine can resolve it. Availability reports never
    /// override an in-flight reservation or trip.
    pub fn set_availability(
        &self,
        driver: DriverId,
        availability: Availability,
        now: u64,
    ) -> Result<AvailabilityChange> {
        let mut record = self.drivers.entry(driver).or_insert(DriverRecord {
            state: DriverState::Offline,
            updated_at: now,
        });

        let (next, aborted) = match (record.state, availability) {
            (DriverState::Available | DriverState::Offline, Availability::Available) => {
                (DriverState::Available, None)
            }
            (DriverState::Available | DriverState::Offline, Availability::Offline) => {
                (DriverState::Offline, None)
            }
            (DriverState::Reserved(attempt), Availability::Offline) => {
                (DriverState::Offline, Some(attempt))
            }
            (DriverState::Reserved(_) | DriverState::OnTrip(_), _) => {
                return Err(MatchError::Conflict { driver });
            }
        };

        if record.state != next {
            record.state = next;
            record.updated_at = now;
        }
        Ok(AvailabilityChange {
            state: next,
            aborted,
        })
    }

    /// available → reserved(attempt). Fails with `Conflict` for any other state.
    pub fn try_reserve(&self, driver: DriverId, attempt: AttemptId, now: u64) -> Result<()> {
        let mut record = self
            .drivers
            .get_mut(&driver)
            .ok_or_else(|| MatchError::driver_not_found(driver))?;
        if record.state != DriverState::Available {
            return Err(MatchError::Conflict { driver });
        }
        record.state = DriverState::Reserved(attempt);
        record.updated_at = now;
        Ok(())
    }

    /// reserved(attempt) → available. Anything else is a stale release.
    pub fn release(&self, driver: DriverId, attempt: AttemptId, now: u64) -> ReleaseOutcome {
        let Some(mut record) = self.drivers.get_mut(&driver) else {
            debug!(%driver, %attempt, "release for unknown driver ignored");
            return ReleaseOutcome::Stale;
        };
        if record.state != DriverState::Reserved(attempt) {
            debug!(%driver, %attempt, state = ?record.state, "stale release ignored");
            return ReleaseOutcome::Stale;
        }
        record.state = DriverState::Available;
        record.updated_at = now;
        ReleaseOutcome::Released
    }

    /// reserved(attempt) → on_trip(attempt).
    pub fn confirm_trip(&self, driver: DriverId, attempt: AttemptId, now: u64) -> Result<()> {
        self.swap(
            driver,
            DriverState::Reserved(attempt),
            DriverState::OnTrip(attempt),
            now,
        )
    }

    /// on_trip(attempt) → available, once the trip lifecycle reports completion.
    pub fn complete_trip(&self, driver: DriverId, attempt: AttemptId, now: u64) -> Result<()> {
        self.swap(
            driver,
            DriverState::OnTrip(attempt),
            DriverState::Available,
            now,
        )
    }

    /// Overwrite a driver's state from durable history. Only used by recovery.
    pub fn restore(&self, driver: DriverId, state: DriverState, now: u64) {
        match self.drivers.entry(driver) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.state = state;
                record.updated_at = now;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DriverRecord {
                    state,
                    updated_at: now,
                });
            }
        }
    }

    fn swap(
        &self,
        driver: DriverId,
        expected: DriverState,
        next: DriverState,
        now: u64,
    ) -> Result<()> {
        let mut record = self
            .drivers
            .get_mut(&driver)
            .ok_or_else(|| MatchError::driver_not_found(driver))?;
        if record.state != expected {
            return Err(MatchError::Conflict { driver });
        }
        record.state = next;
        record.updated_at = now;
        Ok(())
    }

    /// Count of drivers per state, for telemetry.
    pub fn state_counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for record in self.drivers.iter() {
            match record.state {
                DriverState::Available => counts.available += 1,
                DriverState::Reserved(_) => counts.reserved += 1,
                DriverState::OnTrip(_) => counts.on_trip += 1,
                DriverState::Offline => counts.offline += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub available: usize,
    pub reserved: usize,
    pub on_trip: usize,
    pub offline: usize,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn online(registry: &DriverRegistry, driver: DriverId) {
        registry
            .set_availability(driver, Availability::Available, 0)
            .expect("online");
    }

    #[test]
    fn reserve_then_confirm_then_complete() {
        let registry = DriverRegistry::new();
        let driver = DriverId(1);
        online(&registry, driver);

        registry.try_reserve(driver, AttemptId(10), 1).expect("reserve");
        assert_eq!(registry.state(driver), Some(DriverState::Reserved(AttemptId(10))));
        registry.confirm_trip(driver, AttemptId(10), 2).expect("confirm");
        assert_eq!(registry.state(driver), Some(DriverState::OnTrip(AttemptId(10))));
        registry.complete_trip(driver, AttemptId(10), 3).expect("complete");
        assert_eq!(registry.state(driver), Some(DriverState::Available));
    }

    #[test]
    fn second_reservation_conflicts() {
        let registry = DriverRegistry::new();
        let driver = DriverId(1);
        online(&registry, driver);
        registry.try_reserve(driver, AttemptId(1), 0).expect("first");

        let err = registry
            .try_reserve(driver, AttemptId(2), 0)
            .expect_err("second must lose");
        assert!(matches!(err, MatchError::Conflict { .. }));
    }

    #[test]
    fn offline_and_unknown_drivers_cannot_be_reserved() {
        let registry = DriverRegistry::new();
        registry.ensure_registered(DriverId(1), 0);
        assert!(matches!(
            registry.try_reserve(DriverId(1), AttemptId(1), 0),
            Err(MatchError::Conflict { .. })
        ));
        assert!(matches!(
            registry.try_reserve(DriverId(2), AttemptId(1), 0),
            Err(MatchError::NotFound { .. })
        ));
    }

    #[test]
    fn release_with_wrong_token_is_stale() {
        let registry = DriverRegistry::new();
        let driver = DriverId(1);
        online(&registry, driver);
        registry.try_reserve(driver, AttemptId(2), 0).expect("reserve");

        assert_eq!(registry.release(driver, AttemptId(1), 1), ReleaseOutcome::Stale);
        assert_eq!(registry.state(driver), Some(DriverState::Reserved(AttemptId(2))));
        assert_eq!(registry.release(driver, AttemptId(2), 1), ReleaseOutcome::Released);
        assert_eq!(registry.release(driver, AttemptId(2), 1), ReleaseOutcome::Stale);
    }

    #[test]
    fn going_offline_while_reserved_reports_the_attempt() {
        let registry = DriverRegistry::new();
        let driver = DriverId(1);
        online(&registry, driver);
        registry.try_reserve(driver, AttemptId(5), 0).expect("reserve");

        let change = registry
            .set_availability(driver, Availability::Offline, 1)
            .expect("offline");
        assert_eq!(change.state, DriverState::Offline);
        assert_eq!(change.aborted, Some(AttemptId(5)));
    }

    #[test]
    fn availability_cannot_interrupt_a_trip() {
        let registry = DriverRegistry::new();
        let driver = DriverId(1);
        online(&registry, driver);
        registry.try_reserve(driver, AttemptId(5), 0).expect("reserve");
        registry.confirm_trip(driver, AttemptId(5), 0).expect("confirm");

        for availability in [Availability::Available, Availability::Offline] {
            assert!(registry.set_availability(driver, availability, 1).is_err());
        }
    }

    #[test]
    fn concurrent_reservations_have_one_winner() {
        let registry = Arc::new(DriverRegistry::new());
        let driver = DriverId(42);
        online(&registry, driver);
        let winners = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for worker in 0..16u64 {
                let registry = Arc::clone(&registry);
                let winners = Arc::clone(&winners);
                scope.spawn(move || {
                    if registry.try_reserve(driver, AttemptId(worker), 0).is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(matches!(registry.state(driver), Some(DriverState::Reserved(_))));
    }
}
