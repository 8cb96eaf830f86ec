use std::sync::Arc;

use match_core::ledger::{LedgerEntry, LedgerStore, MemoryLedgerStore};
use match_core::StoreError;

/// Memory store that refuses every entry matching `refuse` and accepts the rest.
pub struct RefusingStore<F> {
    pub inner: Arc<MemoryLedgerStore>,
    refuse: F,
}

impl<F> RefusingStore<F>
where
    F: Fn(&LedgerEntry) -> bool + Send + Sync,
{
    pub fn new(inner: Arc<MemoryLedgerStore>, refuse: F) -> Self {
        Self { inner, refuse }
    }
}

impl<F> LedgerStore for RefusingStore<F>
where
    F: Fn(&LedgerEntry) -> bool + Send + Sync,
{
    fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        if (self.refuse)(entry) {
            return Err(StoreError::Unavailable("refused by test".into()));
        }
        self.inner.append(entry)
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.load()
    }
}
