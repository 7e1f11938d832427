//! Key Lock: a fixed array of async mutexes indexed by key hash.
//!
//! Two callers with the same key never hold the lock at the same time.
//! Different keys that land in the same bucket are serialized too; with
//! `n` buckets that happens with probability about `1/n`. Memory stays
//! bounded no matter how many keys the cluster has.

use std::hash::{DefaultHasher, Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// Default bucket count (a small prime)
pub const DEFAULT_BUCKETS: usize = 97;

/// Hash-bucketed key lock
#[derive(Debug)]
pub struct KeyMutex {
    buckets: Vec<Mutex<()>>,
}

/// Held lock for one key; dropping it unlocks.
pub type KeyGuard<'a> = MutexGuard<'a, ()>;

impl Default for KeyMutex {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl KeyMutex {
    /// Creates a lock with `buckets` mutexes (at least one).
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of buckets.
    pub fn buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket a key maps to.
    pub fn bucket(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        // Lossless: the modulus is a usize
        (hasher.finish() % self.buckets.len() as u64) as usize
    }

    /// Waits for and takes the lock of `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        self.buckets[self.bucket(key)].lock().await
    }

    /// Takes the lock of `key` if nobody holds its bucket.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        self.buckets[self.bucket(key)].try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_same_key_same_bucket() {
        let locks = KeyMutex::new(7);
        assert_eq!(locks.bucket("default/web-0"), locks.bucket("default/web-0"));
        assert!(locks.bucket("default/web-0") < 7);
    }

    #[test]
    fn test_zero_buckets_rounds_up() {
        assert_eq!(KeyMutex::new(0).buckets(), 1);
        assert_eq!(KeyMutex::default().buckets(), DEFAULT_BUCKETS);
    }

    #[tokio::test]
    async fn test_try_lock_blocked_while_held() {
        let locks = KeyMutex::default();
        let guard = locks.lock("ns/pod").await;
        assert!(locks.try_lock("ns/pod").is_none());
        drop(guard);
        assert!(locks.try_lock("ns/pod").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_concurrent() {
        let locks = Arc::new(KeyMutex::default());
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let entered = Arc::clone(&entered);
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let _guard = locks.lock("kube-system/coredns-0").await;
                    assert!(
                        !inside.swap(true, Ordering::SeqCst),
                        "two holders of the same key inside the critical section"
                    );
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    inside.store(false, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 160);
    }

    #[tokio::test]
    async fn test_different_buckets_do_not_block() {
        let locks = KeyMutex::new(97);
        let a = "default/a";
        let b = (0..)
            .map(|i| format!("default/b-{}", i))
            .find(|k| locks.bucket(k) != locks.bucket(a))
            .unwrap();
        let _held = locks.lock(a).await;
        assert!(locks.try_lock(&b).is_some());
    }
}
