use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-filename exclusive locks.
///
/// A lock is created the first time a name is seen and kept for the life of
/// the table, so the table grows with the number of distinct names touched.
#[derive(Default)]
pub struct FileLockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `name` is free and hold it until the guard is dropped
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(name.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
