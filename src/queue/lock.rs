// src/queue/lock.rs
//! Keyed mutual exclusion for jobs that touch the same subject.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of per-key async locks.
///
/// Entries are created on first use and removed again once no task holds or
/// waits on them, so the table only grows with the number of keys in flight.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for as long as the job runs; releases the key on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    table: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free and takes it.
    pub async fn acquire(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            table: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Whether some task currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys with a live entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.table.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the table holds a reference once nobody waits on the key.
        if let Some(lock) = locks.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire("subject:pet-1").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("subject:a").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("subject:b"))
            .await
            .expect("independent key must not wait");
        assert!(locks.is_held("subject:a"));
        assert!(locks.is_held("subject:b"));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.acquire("subject:a").await;
            assert!(locks.is_held("subject:a"));
        }
        assert!(!locks.is_held("subject:a"));
        assert!(locks.is_empty());
    }

    #[test]
    fn test_waiter_wakes_when_holder_releases() {
        let locks = KeyedLocks::new();
        let held = tokio_test::block_on(locks.acquire("subject:a"));

        let mut waiter = task::spawn(locks.acquire("subject:a"));
        assert_pending!(waiter.poll());
        drop(held);

        assert!(waiter.is_woken());
        let guard = assert_ready!(waiter.poll());
        assert!(locks.is_held("subject:a"));
        drop(guard);
        assert!(locks.is_empty());
    }
}
