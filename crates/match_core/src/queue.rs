//! Pending-request queue: FIFO with priority override and a front lane for retries.
//!
//! Lanes are served in order: retries, high priority, normal. Requests that
//! found no reservable driver are parked until their backoff elapses and then
//! rejoin the lane picked by the retry ordering policy.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use parking_lot::Mutex;

use crate::config::RetryOrdering;
use crate::error::Result;
use crate::types::{RequestId, RequestPriority, RideRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedRequest {
    pub request_id: RequestId,
    pub created_at: u64,
    pub priority: RequestPriority,
}

impl From<&RideRequest> for QueuedRequest {
    fn from(request: &RideRequest) -> Self {
        Self {
            request_id: request.id,
            created_at: request.created_at,
            priority: request.priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeued {
    Ready(QueuedRequest),
    /// Waited longer than the configured maximum; must not be matched.
    Expired(QueuedRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Parked {
    ready_at: u64,
    seq: u64,
    entry: QueuedRequest,
    ordering: RetryOrdering,
}

impl Ord for Parked {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap by readiness, then parking order.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Lanes {
    retry: VecDeque<QueuedRequest>,
    high: VecDeque<QueuedRequest>,
    normal: VecDeque<QueuedRequest>,
    parked: BinaryHeap<Parked>,
    parked_seq: u64,
}

impl Lanes {
    fn push(&mut self, entry: QueuedRequest, ordering: RetryOrdering) {
        match ordering {
            RetryOrdering::Front => self.retry.push_back(entry),
            RetryOrdering::Back => self.push_fresh(entry),
        }
    }

    fn push_fresh(&mut self, entry: QueuedRequest) {
        match entry.priority {
            RequestPriority::High => self.high.push_back(entry),
            RequestPriority::Normal => self.normal.push_back(entry),
        }
    }

    fn promote_due(&mut self, now: u64) {
        while let Some(next) = self.parked.peek().copied() {
            if next.ready_at > now {
                break;
            }
            self.parked.pop();
            self.push(next.entry, next.ordering);
        }
    }

    fn pop(&mut self) -> Option<QueuedRequest> {
        self.retry
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
    }
}

#[derive(Debug)]
pub struct RequestQueue {
    lanes: Mutex<Lanes>,
    max_wait_ms: u64,
}

impl RequestQueue {
    pub fn new(max_wait_ms: u64) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            max_wait_ms,
        }
    }

    /// Validate and append a fresh request in arrival order.
    pub fn enqueue(&self, request: &RideRequest) -> Result<()> {
        request.validate()?;
        self.lanes.lock().push_fresh(request.into());
        Ok(())
    }

    /// Put a request back after a failed attempt.
    pub fn requeue(&self, entry: QueuedRequest, ordering: RetryOrdering) {
        self.lanes.lock().push(entry, ordering);
    }

    /// Hold a request back until `ready_at`.
    pub fn park(&self, entry: QueuedRequest, ready_at: u64, ordering: RetryOrdering) {
        let mut lanes = self.lanes.lock();
        let seq = lanes.parked_seq;
        lanes.parked_seq += 1;
        lanes.parked.push(Parked {
            ready_at,
            seq,
            entry,
            ordering,
        });
    }

    /// Next request to match, or the next one that overstayed `max_wait_ms`.
    pub fn dequeue_next(&self, now: u64) -> Option<Dequeued> {
        let mut lanes = self.lanes.lock();
        lanes.promote_due(now);
        let entry = lanes.pop()?;
        if now.saturating_sub(entry.created_at) > self.max_wait_ms {
            Some(Dequeued::Expired(entry))
        } else {
            Some(Dequeued::Ready(entry))
        }
    }

    /// Drop a request from every lane. Returns whether it was queued.
    pub fn remove(&self, request_id: RequestId) -> bool {
        let mut lanes = self.lanes.lock();
        let before = lanes.retry.len() + lanes.high.len() + lanes.normal.len() + lanes.parked.len();
        lanes.retry.retain(|e| e.request_id != request_id);
        lanes.high.retain(|e| e.request_id != request_id);
        lanes.normal.retain(|e| e.request_id != request_id);
        lanes.parked.retain(|p| p.entry.request_id != request_id);
        let after = lanes.retry.len() + lanes.high.len() + lanes.normal.len() + lanes.parked.len();
        before != after
    }

    /// Requests ready to be served now (parked ones excluded).
    pub fn ready_len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.retry.len() + lanes.high.len() + lanes.normal.len()
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.retry.len() + lanes.high.len() + lanes.normal.len() + lanes.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest time a parked request becomes ready.
    pub fn next_parked_at(&self) -> Option<u64> {
        self.lanes.lock().parked.peek().map(|p| p.ready_at)
    }
}
