//! Per-key async mutual exclusion.
//!
//! Operations on the same volume id or the same target path are serialized,
//! while operations on unrelated keys proceed concurrently. Entries are
//! dropped from the table once nobody holds or waits on them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Default)]
pub struct KeyedLocks {
    table: Table,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let entry = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(key.to_string()).or_default())
        };
        let guard = entry.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            table: Arc::clone(&self.table),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a key until dropped.
pub struct KeyGuard {
    key: String,
    table: Table,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release the mutex before inspecting the reference count so an idle
        // entry is seen with only the table's reference left.
        drop(self.guard.take());
        let mut table = self.table.lock();
        if let Some(entry) = table.get(&self.key)
            && Arc::strong_count(entry) == 1
        {
            table.remove(&self.key);
        }
    }
}
