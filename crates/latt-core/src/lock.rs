// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-minion serialization for writes that touch a minion's session
//! directory. `HistoryStore`, `SessionUsageLedger` and `InitStateManager`
//! all funnel their persistence through the same lock keyed by minion id,
//! so two concurrent callers never interleave writes to the same files.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Registry of per-minion mutexes. Minions that are never touched never get
/// an entry, so the map only grows with active work.
#[derive(Default)]
pub struct MinionFileLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MinionFileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, minion_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(minion_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Run `f` while holding the exclusive lock for `minion_id`. Callers that
    /// need to check whether their target directory still exists should do
    /// so inside `f`, since this only guarantees mutual exclusion, not that
    /// the directory survived until the lock was granted.
    pub async fn with_lock<F, Fut, T>(&self, minion_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(minion_id).await;
        let _guard = lock.lock().await;
        f().await
    }

    /// Drop the lock entry for a minion that has been permanently removed.
    /// Any `with_lock` call already in flight keeps its `Arc` and finishes
    /// normally; this only stops new callers from reusing the stale entry.
    pub async fn forget(&self, minion_id: &str) {
        self.locks.lock().await.remove(minion_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn with_lock_serializes_same_minion() {
        let locks = Arc::new(MinionFileLocks::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("m1", || async {
                        let before = counter.load(Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        counter.store(before + 1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn distinct_minions_do_not_share_a_lock() {
        let locks = MinionFileLocks::new();
        let a = locks.lock_for("a").await;
        let b = locks.lock_for("b").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn forget_removes_entry_without_panicking_concurrent_holders() {
        let locks = Arc::new(MinionFileLocks::new());
        locks.with_lock("m1", || async {}).await;
        locks.forget("m1").await;
        // A fresh lock is handed out after forget — no poisoning, no panic.
        locks.with_lock("m1", || async {}).await;
    }
}
