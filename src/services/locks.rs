use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Advisory per-user locks for maintenance sweeps.
///
/// Two sweeps of the same kind for the same user never run at once; sweeps for
/// different users proceed in parallel. Locks are in-process only.
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the user's lock.
    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(user_id).lock_owned().await
    }

    /// Take the user's lock if nobody holds it.
    pub fn try_acquire(&self, user_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(user_id).try_lock_owned().ok()
    }

    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        // Clone out of the shard before awaiting so the map is never held
        // across an await point
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop locks nobody holds or waits for.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
