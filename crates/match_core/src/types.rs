//! Identifiers, records and lifecycle states shared by every component.
//!
//! Lifecycles are explicit tagged enums with a transition table (`apply`), so the
//! engine never mutates a state field directly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};
use crate::geo::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId(pub u64);

/// Opaque rider reference handed out by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RiderId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drv-{}", self.0)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "att-{}", self.0)
    }
}

impl fmt::Display for RiderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RiderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Proposed,
    Matched,
    Cancelled,
    Expired,
    Completed,
}

/// Inputs that drive [`RequestState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    Propose,
    Accept,
    /// Attempt rejected, timed out, withdrawn, or failed to persist.
    Retry,
    Cancel,
    Expire,
    Complete,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired | Self::Completed)
    }

    /// Transition table for ride requests.
    pub fn apply(self, event: RequestEvent) -> Result<Self> {
        use RequestEvent as E;
        use RequestState as S;
        let next = match (self, event) {
            (S::Pending, E::Propose) => S::Proposed,
            (S::Proposed, E::Accept) => S::Matched,
            (S::Proposed, E::Retry) => S::Pending,
            (S::Pending | S::Proposed, E::Cancel) => S::Cancelled,
            (S::Pending | S::Proposed, E::Expire) => S::Expired,
            (S::Matched, E::Complete) => S::Completed,
            (from, event) => {
                return Err(MatchError::IllegalTransition {
                    entity: "request",
                    from: from.to_string(),
                    event: format!("{event:?}"),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Proposed => "proposed",
            Self::Matched => "matched",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Completed => "completed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Proposed,
    Accepted,
    Rejected,
    TimedOut,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Proposed)
    }

    /// Only a proposed attempt may move, and only to a terminal state.
    pub fn resolve(self, to: AttemptState) -> Result<Self> {
        if self == Self::Proposed && to.is_terminal() {
            Ok(to)
        } else {
            Err(MatchError::IllegalTransition {
                entity: "attempt",
                from: self.to_string(),
                event: to.to_string(),
            })
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Proposed => "proposed",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Driver state as held by the availability registry. The reservation token is
/// carried inside the state, so a reserved driver always names its attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Available,
    Reserved(AttemptId),
    OnTrip(AttemptId),
    Offline,
}

impl DriverState {
    pub fn holding_attempt(&self) -> Option<AttemptId> {
        match self {
            Self::Reserved(attempt) | Self::OnTrip(attempt) => Some(*attempt),
            Self::Available | Self::Offline => None,
        }
    }
}

/// Availability reported by the driver app (heartbeat / shift toggles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

/// Rider submission before the engine assigns an identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRideRequest {
    pub rider: RiderId,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    pub priority: RequestPriority,
}

impl NewRideRequest {
    pub fn new(rider: impl Into<String>, pickup: Coordinate, dropoff: Coordinate) -> Self {
        Self {
            rider: RiderId(rider.into()),
            pickup,
            dropoff,
            priority: RequestPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RideRequest {
    pub id: RequestId,
    pub rider: RiderId,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    pub priority: RequestPriority,
    /// Milliseconds since the clock epoch.
    pub created_at: u64,
    pub state: RequestState,
}

impl RideRequest {
    /// Rejects empty rider references and malformed coordinates.
    pub fn validate(&self) -> Result<()> {
        if self.rider.0.trim().is_empty() {
            return Err(MatchError::Invalid("rider reference is empty".into()));
        }
        self.pickup.validate()?;
        self.dropoff.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchAttempt {
    pub id: AttemptId,
    pub request_id: RequestId,
    pub driver_id: DriverId,
    /// 1-based position of this attempt within its request.
    pub seq: u32,
    pub proposed_at: u64,
    pub deadline: u64,
    pub state: AttemptState,
}

/// Summary sent to the driver alongside a proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSummary {
    pub request_id: RequestId,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    pub pickup_distance_km: f64,
    pub deadline: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_follows_retry_loop_until_matched() {
        let state = RequestState::Pending
            .apply(RequestEvent::Propose)
            .and_then(|s| s.apply(RequestEvent::Retry))
            .and_then(|s| s.apply(RequestEvent::Propose))
            .and_then(|s| s.apply(RequestEvent::Accept))
            .expect("legal path");
        assert_eq!(state, RequestState::Matched);
        assert_eq!(
            state.apply(RequestEvent::Complete).expect("complete"),
            RequestState::Completed
        );
    }

    #[test]
    fn matched_request_cannot_be_cancelled() {
        let err = RequestState::Matched
            .apply(RequestEvent::Cancel)
            .expect_err("illegal");
        assert!(matches!(err, MatchError::IllegalTransition { .. }));
    }

    #[test]
    fn terminal_requests_reject_every_event() {
        for state in [
            RequestState::Cancelled,
            RequestState::Expired,
            RequestState::Completed,
        ] {
            for event in [
                RequestEvent::Propose,
                RequestEvent::Accept,
                RequestEvent::Retry,
                RequestEvent::Cancel,
                RequestEvent::Expire,
                RequestEvent::Complete,
            ] {
                assert!(state.apply(event).is_err(), "{state} accepted {event:?}");
            }
        }
    }

    #[test]
    fn attempts_resolve_once() {
        let accepted = AttemptState::Proposed
            .resolve(AttemptState::Accepted)
            .expect("first resolution");
        assert!(accepted.resolve(AttemptState::Rejected).is_err());
        assert!(AttemptState::Proposed
            .resolve(AttemptState::Proposed)
            .is_err());
    }

    #[test]
    fn empty_rider_is_invalid() {
        let request = RideRequest {
            id: RequestId(1),
            rider: RiderId("  ".into()),
            pickup: Coordinate::new(1.0, 1.0),
            dropoff: Coordinate::new(2.0, 2.0),
            priority: RequestPriority::Normal,
            created_at: 0,
            state: RequestState::Pending,
        };
        assert!(matches!(request.validate(), Err(MatchError::Invalid(_))));
    }
}
