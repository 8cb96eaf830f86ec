//! Per-request state owned by the engine.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::collaborators::MatchedEvent;
use crate::error::MatchError;
use crate::queue::QueuedRequest;
use crate::types::{AttemptId, AttemptState, DriverId, MatchAttempt, RequestId, RideRequest, RiderId};

/// One request and everything needed to continue matching it.
///
/// `record` is the per-request serialisation point: whichever worker, timer
/// or decision callback touches the request holds this lock. `cancel_requested`
/// is set before the lock is taken so a worker iterating candidates can see a
/// cancellation between reservation attempts.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    pub(crate) cancel_requested: AtomicBool,
    pub(crate) record: Mutex<RequestRecord>,
}

impl RequestSlot {
    pub(crate) fn new(record: RequestRecord) -> Self {
        Self {
            cancel_requested: AtomicBool::new(false),
            record: Mutex::new(record),
        }
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RequestRecord {
    pub(crate) request: RideRequest,
    /// Every attempt for this request, oldest first.
    pub(crate) attempts: Vec<MatchAttempt>,
    /// Drivers that already rejected, ignored or dropped this request.
    pub(crate) excluded: HashSet<DriverId>,
    /// Failed rounds so far.
    pub(crate) retries: u32,
}

impl RequestRecord {
    pub(crate) fn new(request: RideRequest) -> Self {
        Self {
            request,
            attempts: Vec::new(),
            excluded: HashSet::new(),
            retries: 0,
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.request.id
    }

    /// Sequence number of the latest attempt, 0 before the first proposal.
    pub(crate) fn current_seq(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub(crate) fn attempt(&self, id: AttemptId) -> Option<&MatchAttempt> {
        self.attempts.iter().find(|a| a.id == id)
    }

    pub(crate) fn attempt_mut(&mut self, id: AttemptId) -> Option<&mut MatchAttempt> {
        self.attempts.iter_mut().find(|a| a.id == id)
    }

    pub(crate) fn proposed_attempt(&self) -> Option<MatchAttempt> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.state == AttemptState::Proposed)
            .copied()
    }

    pub(crate) fn queued(&self) -> QueuedRequest {
        QueuedRequest::from(&self.request)
    }
}

thread_local! {
    static NOTIFYING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside `notify_driver` until dropped.
///
/// The request lock is held across the call, so any engine call the
/// dispatcher makes from the same thread would block on it.
pub(crate) struct NotifyScope(());

impl NotifyScope {
    pub(crate) fn enter() -> Self {
        NOTIFYING.with(|n| n.set(true));
        Self(())
    }

    pub(crate) fn is_active() -> bool {
        NOTIFYING.with(Cell::get)
    }
}

impl Drop for NotifyScope {
    fn drop(&mut self) {
        NOTIFYING.with(|n| n.set(false));
    }
}

/// Collaborator calls collected under a request lock and delivered after it is released.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) matched: Vec<MatchedEvent>,
    pub(crate) no_match: Vec<(RequestId, RiderId, MatchError)>,
}
