//! Per-record mutual exclusion keyed by external id

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async mutex per external id. Unrelated records never contend; entries
/// nobody holds or waits on are pruned on the next acquisition.
#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of a read-check-write on one record
pub struct RecordGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, external_id: &str) -> RecordGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(external_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        RecordGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of ids with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
