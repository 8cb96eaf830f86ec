//! Narrow interfaces to the services around the matching core.
//!
//! Implementations must not call back into the engine synchronously from
//! `notify_driver`; decisions arrive later through
//! [`crate::MatchingEngine::record_driver_decision`] from any thread. A
//! same-thread call that touches a request fails with
//! [`crate::MatchError::Reentrant`].

use crate::error::MatchError;
use crate::types::{AttemptId, DriverId, RequestId, RequestSummary, RiderId};

/// Why a notification could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("driver endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("notification acknowledgement timed out")]
    Timeout,
}

/// Delivers proposals to drivers. Fire-and-acknowledge: returning `Ok` means
/// the transport accepted the message, not that the driver answered. The
/// implementation bounds its own wait and reports `Timeout` past it.
pub trait NotificationDispatcher: Send + Sync {
    fn notify_driver(
        &self,
        driver: DriverId,
        attempt: AttemptId,
        summary: &RequestSummary,
    ) -> Result<(), NotifyError>;
}

/// Emitted once per request when it becomes matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedEvent {
    pub request_id: RequestId,
    pub driver_id: DriverId,
    pub attempt_id: AttemptId,
    pub matched_at: u64,
}

/// Downstream trip tracking and fare calculation.
pub trait TripLifecycle: Send + Sync {
    fn matched(&self, event: MatchedEvent);
}

/// Rider-facing outcomes that did not end in a match.
pub trait RiderFeedback: Send + Sync {
    fn no_match(&self, request_id: RequestId, rider: &RiderId, reason: &MatchError);
}

/// Collaborator that accepts and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl NotificationDispatcher for Noop {
    fn notify_driver(
        &self,
        _driver: DriverId,
        _attempt: AttemptId,
        _summary: &RequestSummary,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

impl TripLifecycle for Noop {
    fn matched(&self, _event: MatchedEvent) {}
}

impl RiderFeedback for Noop {
    fn no_match(&self, _request_id: RequestId, _rider: &RiderId, _reason: &MatchError) {}
}
