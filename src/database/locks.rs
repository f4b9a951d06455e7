//! Per-database locks shared by manual triggers, the scheduler and the
//! recovery verifier, so only one backup or restore runs against a database
//! at a time. Different databases never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard held for the duration of one operation on a database
pub type DatabaseGuard = OwnedMutexGuard<()>;

/// Registry of one async mutex per database name
#[derive(Debug, Default)]
pub struct DatabaseLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DatabaseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, database: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            // The map holds no invariants a panicking holder could break
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(database.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until the database is free
    pub async fn acquire(&self, database: &str) -> DatabaseGuard {
        self.lock_for(database).lock_owned().await
    }

    /// Take the database lock only if nobody holds it
    pub fn try_acquire(&self, database: &str) -> Option<DatabaseGuard> {
        self.lock_for(database).try_lock_owned().ok()
    }
}
