//! crates/wa_bridge_core/src/registry.rs
//!
//! Process-wide registry of per-session locks. Sessions never share a lock,
//! so operations on different sessions proceed in parallel.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to the session.
    pub async fn lock(&self, session_id: Uuid) -> OwnedMutexGuard<()> {
        // Clone out of the map first so the shard guard is not held across the await.
        let lock = self
            .locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
