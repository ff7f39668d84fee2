//! Keyed idempotency guard.
//!
//! A [`DedupGuard`] lets the first caller for an `(owner, key)` pair proceed
//! and turns away repeats until the mark is older than the TTL.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default time a mark stays active.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60);

/// Default number of marks retained.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct Marks<K> {
    table: HashMap<(String, K), Instant>,
    ring: VecDeque<((String, K), Instant)>,
}

/// Idempotency lock keyed by `(owner, key)`.
///
/// Storage is bounded by sweeping expired marks on every insert and by
/// evicting the oldest mark once `capacity` is exceeded.
#[derive(Debug)]
pub struct DedupGuard<K> {
    ttl: Duration,
    capacity: usize,
    marks: Mutex<Marks<K>>,
}

impl<K> Default for DedupGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL, DEFAULT_DEDUP_CAPACITY)
    }
}

impl<K> DedupGuard<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates a guard. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            marks: Mutex::new(Marks {
                table: HashMap::new(),
                ring: VecDeque::new(),
            }),
        }
    }

    /// Mark lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Marks `(owner, key)` and returns true, unless it is already marked and
    /// the mark is younger than the TTL.
    pub fn try_acquire(&self, owner: &str, key: &K) -> bool {
        let now = Instant::now();
        let entry = (owner.to_string(), key.clone());
        let mut guard = self.marks.lock();
        let marks = &mut *guard;

        if let Some(marked) = marks.table.get(&entry) {
            if now.duration_since(*marked) < self.ttl {
                return false;
            }
        }

        // Sweep expired marks from the front of the ring.
        while let Some((key, at)) = marks.ring.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            if marks.table.get(key) == Some(at) {
                marks.table.remove(key);
            }
            marks.ring.pop_front();
        }

        marks.table.insert(entry.clone(), now);
        marks.ring.push_back((entry, now));

        // Ring entries superseded by a re-mark linger until popped, so evict
        // until the live table fits.
        while marks.table.len() > self.capacity {
            let Some((key, at)) = marks.ring.pop_front() else {
                break;
            };
            if marks.table.get(&key) == Some(&at) {
                marks.table.remove(&key);
            }
        }
        true
    }

    /// Runs `future` only if [`DedupGuard::try_acquire`] succeeds.
    pub async fn run<F>(&self, owner: &str, key: &K, future: F) -> Option<F::Output>
    where
        F: Future,
    {
        if self.try_acquire(owner, key) {
            Some(future.await)
        } else {
            None
        }
    }

    /// Clears the mark so the next acquire succeeds.
    pub fn release(&self, owner: &str, key: &K) {
        self.marks
            .lock()
            .table
            .remove(&(owner.to_string(), key.clone()));
    }

    /// Returns true if `(owner, key)` holds an unexpired mark.
    #[must_use]
    pub fn is_active(&self, owner: &str, key: &K) -> bool {
        self.marks
            .lock()
            .table
            .get(&(owner.to_string(), key.clone()))
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Number of marks held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks.lock().table.len()
    }

    /// Returns true if no marks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_acquire_is_rejected() {
        let guard = DedupGuard::default();
        assert!(guard.try_acquire("gossip", &1u32));
        assert!(!guard.try_acquire("gossip", &1u32));
        assert!(guard.is_active("gossip", &1u32));
    }

    #[test]
    fn owners_are_independent() {
        let guard = DedupGuard::default();
        assert!(guard.try_acquire("a", &"k"));
        assert!(guard.try_acquire("b", &"k"));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn release_allows_reacquire() {
        let guard = DedupGuard::default();
        assert!(guard.try_acquire("o", &5u8));
        guard.release("o", &5u8);
        assert!(!guard.is_active("o", &5u8));
        assert!(guard.try_acquire("o", &5u8));
    }

    #[test]
    fn expired_mark_is_reacquired_and_swept() {
        let guard = DedupGuard::new(Duration::from_millis(10), 100);
        assert!(guard.try_acquire("o", &1u8));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!guard.is_active("o", &1u8));

        assert!(guard.try_acquire("o", &2u8));
        assert_eq!(guard.len(), 1);
        assert!(guard.try_acquire("o", &1u8));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let guard = DedupGuard::new(Duration::from_secs(60), 3);
        for key in 0..5u32 {
            assert!(guard.try_acquire("o", &key));
        }
        assert_eq!(guard.len(), 3);
        assert!(!guard.is_active("o", &0));
        assert!(!guard.is_active("o", &1));
        assert!(guard.is_active("o", &4));
        assert!(guard.try_acquire("o", &0));
    }

    #[tokio::test]
    async fn concurrent_runs_execute_once() {
        let guard = Arc::new(DedupGuard::default());
        let hits = Arc::new(AtomicUsize::new(0));

        let run = |guard: Arc<DedupGuard<u64>>, hits: Arc<AtomicUsize>| async move {
            guard
                .run("op", &7, async {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(Arc::clone(&guard), Arc::clone(&hits)),
            run(Arc::clone(&guard), Arc::clone(&hits))
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(a.is_some() ^ b.is_some());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_exceeds_capacity(
                capacity in 1usize..32,
                keys in proptest::collection::vec(0u16..64, 0..256),
            ) {
                let guard = DedupGuard::new(Duration::from_secs(60), capacity);
                for key in &keys {
                    guard.try_acquire("o", key);
                    prop_assert!(guard.len() <= capacity);
                }
            }
        }
    }
}
