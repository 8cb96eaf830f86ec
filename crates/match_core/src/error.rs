//! Error taxonomy for the matching core.
//!
//! `Conflict` is an expected outcome of racing workers and is recovered inside
//! the engine. `Invalid` and `Exhausted` are rider-facing. `Persistence` means a
//! ledger write still failed after the configured retries.

use crate::types::{AttemptId, DriverId, RequestId};

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("driver {driver} is not available for reservation")]
    Conflict { driver: DriverId },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// A decision deadline or the request's maximum wait elapsed.
    #[error("deadline passed for request {request}")]
    Expired {
        request: RequestId,
        attempt: Option<AttemptId>,
    },

    #[error("no driver available for request {request} after {retries} retries")]
    Exhausted { request: RequestId, retries: u32 },

    #[error("illegal {entity} transition from {from} on {event}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        event: String,
    },

    #[error("ledger write failed: {0}")]
    Persistence(#[from] StoreError),

    /// The engine was called from inside `notify_driver` on the same thread.
    #[error("engine re-entered from a driver notification; deliver {operation} after notify_driver returns")]
    Reentrant { operation: &'static str },
}

impl MatchError {
    pub fn request_not_found(id: RequestId) -> Self {
        Self::NotFound {
            kind: "request",
            id: id.0,
        }
    }

    pub fn driver_not_found(id: DriverId) -> Self {
        Self::NotFound {
            kind: "driver",
            id: id.0,
        }
    }

    pub fn attempt_not_found(id: AttemptId) -> Self {
        Self::NotFound {
            kind: "attempt",
            id: id.0,
        }
    }

    /// Whether the error should be shown to the rider rather than handled internally.
    pub fn is_rider_facing(&self) -> bool {
        matches!(
            self,
            Self::Invalid(_) | Self::Exhausted { .. } | Self::Expired { .. }
        )
    }
}

/// Failures reported by a [`crate::ledger::LedgerStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, MatchError>;
