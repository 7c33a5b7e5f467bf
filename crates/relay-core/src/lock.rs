//! Per-`(user, provider)` advisory lock map: an explicit `DashMap` of owned
//! mutexes, one per pair, created lazily and never torn down — cheap to keep
//! around for the life of the process since a pair is a small, bounded key
//! space per user.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct PairLockMap {
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl PairLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other task holds the lock for this `(user, provider)`
    /// pair. Held across an entire sync run, including the Classifier and
    /// Action Executor passes that follow it, so two ticks can never race
    /// on the same pair.
    pub async fn acquire(&self, user_id: &str, provider: &str) -> OwnedMutexGuard<()> {
        let key = (user_id.to_string(), provider.to_string());
        let mutex = self.locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_acquires_on_the_same_pair_serialize() {
        let locks = Arc::new(PairLockMap::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("u1", "google_email").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_pairs_run_concurrently() {
        let locks = Arc::new(PairLockMap::new());
        let a = locks.acquire("u1", "google_email").await;
        let b = locks.acquire("u1", "microsoft_email").await;
        drop(a);
        drop(b);
    }
}
