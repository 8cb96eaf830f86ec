//! Match ledger: append-only history of request and attempt transitions.
//!
//! Entries are keyed by `(request_id, attempt_seq)`; request-level events use
//! the sequence number of the request's latest attempt (0 before the first
//! proposal). Each entry also has a dedupe key, so an entry delivered twice by
//! an at-least-once store, or appended twice by a retried caller, is recorded
//! once. Attempt events carry their attempt id in the key: two attempts never
//! collapse into one even if they share a sequence number.

pub mod export;
pub mod store;

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PersistenceRetryConfig;
use crate::error::StoreError;
use crate::geo::Coordinate;
use crate::types::{
    AttemptId, AttemptState, DriverId, RequestId, RequestPriority, RequestState, RiderId,
};

pub use export::write_ledger_parquet;
pub use store::{JsonlLedgerStore, LedgerStore, MemoryLedgerStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    RequestSubmitted {
        rider: RiderId,
        pickup: Coordinate,
        dropoff: Coordinate,
        priority: RequestPriority,
    },
    RequestStateChanged {
        from: RequestState,
        to: RequestState,
    },
    /// A round ended without a match and the request went back to waiting.
    RequestRequeued {
        retries: u32,
    },
    AttemptProposed {
        attempt_id: AttemptId,
        driver_id: DriverId,
        deadline_ms: u64,
    },
    AttemptResolved {
        attempt_id: AttemptId,
        driver_id: DriverId,
        state: AttemptState,
    },
}

impl LedgerEvent {
    pub fn kind_code(&self) -> u8 {
        match self {
            Self::RequestSubmitted { .. } => 0,
            Self::RequestStateChanged { .. } => 1,
            Self::RequestRequeued { .. } => 2,
            Self::AttemptProposed { .. } => 3,
            Self::AttemptResolved { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: RequestId,
    pub attempt_seq: u32,
    pub at_ms: u64,
    pub event: LedgerEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DedupeKey {
    request_id: RequestId,
    attempt_seq: u32,
    kind: u8,
    attempt: Option<AttemptId>,
    discriminator: u32,
}

impl LedgerEntry {
    fn dedupe_key(&self) -> DedupeKey {
        let (attempt, discriminator) = match &self.event {
            LedgerEvent::RequestSubmitted { .. } => (None, 0),
            LedgerEvent::RequestStateChanged { to, .. } => (None, request_state_code(*to) as u32),
            LedgerEvent::RequestRequeued { retries } => (None, *retries),
            LedgerEvent::AttemptProposed { attempt_id, .. } => (Some(*attempt_id), 0),
            LedgerEvent::AttemptResolved {
                attempt_id, state, ..
            } => (Some(*attempt_id), attempt_state_code(*state) as u32),
        };
        DedupeKey {
            request_id: self.request_id,
            attempt_seq: self.attempt_seq,
            kind: self.event.kind_code(),
            attempt,
            discriminator,
        }
    }
}

pub fn request_state_code(state: RequestState) -> u8 {
    match state {
        RequestState::Pending => 0,
        RequestState::Proposed => 1,
        RequestState::Matched => 2,
        RequestState::Cancelled => 3,
        RequestState::Expired => 4,
        RequestState::Completed => 5,
    }
}

pub fn attempt_state_code(state: AttemptState) -> u8 {
    match state {
        AttemptState::Proposed => 0,
        AttemptState::Accepted => 1,
        AttemptState::Rejected => 2,
        AttemptState::TimedOut => 3,
        AttemptState::Cancelled => 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Durable after `retries` failed tries.
    Written { retries: u32 },
    /// Already recorded; nothing written.
    Duplicate,
}

#[derive(Debug, Default)]
struct LedgerIndex {
    seen: HashSet<DedupeKey>,
    entries: Vec<LedgerEntry>,
}

pub struct MatchLedger {
    store: Box<dyn LedgerStore>,
    retry: PersistenceRetryConfig,
    index: Mutex<LedgerIndex>,
}

impl std::fmt::Debug for MatchLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchLedger")
            .field("retry", &self.retry)
            .field("entries", &self.index.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl MatchLedger {
    /// Open a ledger over `store`, replaying whatever it already holds.
    pub fn open(
        store: Box<dyn LedgerStore>,
        retry: PersistenceRetryConfig,
    ) -> Result<Self, StoreError> {
        let mut index = LedgerIndex::default();
        for entry in store.load()? {
            if index.seen.insert(entry.dedupe_key()) {
                index.entries.push(entry);
            }
        }
        Ok(Self {
            store,
            retry,
            index: Mutex::new(index),
        })
    }

    /// Append durably, retrying with exponential backoff.
    ///
    /// Returns only once the store confirmed the write, or with the last
    /// store error once `max_attempts` tries failed.
    pub fn append(&self, entry: LedgerEntry) -> Result<AppendOutcome, StoreError> {
        let key = entry.dedupe_key();
        if self.index.lock().seen.contains(&key) {
            return Ok(AppendOutcome::Duplicate);
        }

        let backoff = self.retry.backoff();
        let mut failures = 0u32;
        loop {
            match self.store.append(&entry) {
                Ok(()) => break,
                Err(err) => {
                    failures += 1;
                    if failures >= self.retry.max_attempts {
                        warn!(
                            request = %entry.request_id,
                            seq = entry.attempt_seq,
                            failures,
                            error = %err,
                            "ledger write abandoned"
                        );
                        return Err(err);
                    }
                    let delay = backoff.delay_ms(failures);
                    warn!(
                        request = %entry.request_id,
                        seq = entry.attempt_seq,
                        failures,
                        delay_ms = delay,
                        error = %err,
                        "ledger write failed, retrying"
                    );
                    if delay > 0 {
                        std::thread::sleep(Duration::from_millis(delay));
                    }
                }
            }
        }

        let mut index = self.index.lock();
        if index.seen.insert(key) {
            index.entries.push(entry);
        }
        Ok(AppendOutcome::Written { retries: failures })
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.index.lock().entries.clone()
    }

    /// Entries of one request ordered by `(attempt_seq, append order)`.
    pub fn history(&self, request_id: RequestId) -> Vec<LedgerEntry> {
        let mut history: Vec<_> = self
            .index
            .lock()
            .entries
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect();
        history.sort_by_key(|e| e.attempt_seq);
        history
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
