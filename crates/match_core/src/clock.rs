//! Time sources and decision-deadline timers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::AttemptId;

/// Millisecond clock. All engine timestamps come from here.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock, milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and simulation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now.fetch_add(delta_ms, AtomicOrdering::SeqCst) + delta_ms
    }

    /// Move the clock forward to `ms`; never moves it backwards.
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    at: u64,
    attempt: AttemptId,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by deadline.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.attempt.cmp(&self.attempt))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct TimerState {
    heap: BinaryHeap<Deadline>,
    armed: HashSet<AttemptId>,
}

/// One-shot decision timers, one per match attempt.
///
/// A timer fires at most once: `pop_due` disarms what it returns, and cancelled
/// timers are skipped when their heap entry surfaces.
#[derive(Debug, Default)]
pub struct DeadlineTimers {
    state: Mutex<TimerState>,
}

impl DeadlineTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, attempt: AttemptId, at: u64) {
        let mut state = self.state.lock();
        if state.armed.insert(attempt) {
            state.heap.push(Deadline { at, attempt });
        }
    }

    /// Returns whether the timer was still armed.
    pub fn cancel(&self, attempt: AttemptId) -> bool {
        self.state.lock().armed.remove(&attempt)
    }

    /// Disarm and return every timer due at or before `now`, earliest first.
    pub fn pop_due(&self, now: u64) -> Vec<AttemptId> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        while let Some(next) = state.heap.peek().copied() {
            if next.at > now {
                break;
            }
            state.heap.pop();
            if state.armed.remove(&next.attempt) {
                due.push(next.attempt);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .heap
            .iter()
            .filter(|d| state.armed.contains(&d.attempt))
            .map(|d| d.at)
            .min()
    }

    pub fn armed(&self) -> usize {
        self.state.lock().armed.len()
    }
}
