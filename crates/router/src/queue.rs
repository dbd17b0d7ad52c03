//! Deduplicating, rate-limited work queue: one per watched GVK.
//!
//! A key is never handed to two workers at once. Adding a key that is being
//! processed marks it dirty; it is queued again when the worker calls `done`.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use trellis_core::ObjectKey;

/// A queued event: the object key and whether it came from a dependency trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Item {
    pub key: ObjectKey,
    pub from_trigger: bool,
}

impl Item {
    pub fn direct(key: ObjectKey) -> Self {
        Self { key, from_trigger: false }
    }

    pub fn triggered(key: ObjectKey) -> Self {
        Self { key, from_trigger: true }
    }
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<Item, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }

    pub fn when(&self, item: &Item) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let n = failures.entry(item.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map(|d| d.min(self.max)).unwrap_or(self.max)
    }

    pub fn forget(&self, item: &Item) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).remove(item);
    }

    pub fn retries(&self, item: &Item) -> u32 {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).get(item).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<Item>,
    dirty: FxHashSet<Item>,
    processing: FxHashSet<Item>,
    shut_down: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    backoff: Backoff,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("WorkQueue").field("queued", &st.queue.len()).field("processing", &st.processing.len()).finish()
    }
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(State::default()), notify: Notify::new(), backoff })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, item: Item) {
        {
            let mut st = self.lock();
            if st.shut_down || st.dirty.contains(&item) {
                return;
            }
            st.dirty.insert(item.clone());
            if st.processing.contains(&item) {
                return;
            }
            st.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Add once `delay` has elapsed, unless `shutdown` fires first.
    pub fn add_after(self: &Arc<Self>, item: Item, delay: Duration, shutdown: CancellationToken) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.add(item),
            }
        });
    }

    pub fn add_rate_limited(self: &Arc<Self>, item: Item, shutdown: CancellationToken) {
        let delay = self.backoff.when(&item);
        self.add_after(item, delay, shutdown);
    }

    pub fn forget(&self, item: &Item) {
        self.backoff.forget(item);
    }

    pub fn retries(&self, item: &Item) -> u32 {
        self.backoff.retries(item)
    }

    /// Next item to process; `None` once shut down or `shutdown` fires.
    pub async fn get(&self, shutdown: &CancellationToken) -> Option<Item> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if st.shut_down {
                    return None;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    pub fn done(&self, item: &Item) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(item);
            if st.dirty.contains(item) {
                st.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Backoff::new(Duration::from_millis(5), Duration::from_secs(1000)))
    }

    fn item(name: &str) -> Item {
        Item::direct(ObjectKey::new("ns", name))
    }

    #[tokio::test]
    async fn duplicates_coalesce_and_in_flight_keys_wait() {
        let q = queue();
        let stop = CancellationToken::new();
        q.add(item("a"));
        q.add(item("a"));
        q.add(Item::triggered(ObjectKey::new("ns", "a")));
        assert_eq!(q.len(), 2);

        let a = q.get(&stop).await.unwrap();
        assert_eq!(a, item("a"));
        // re-added while processing: held back until done
        q.add(item("a"));
        let t = q.get(&stop).await.unwrap();
        assert!(t.from_trigger);
        assert!(q.is_empty());

        q.done(&a);
        assert_eq!(q.get(&stop).await.unwrap(), item("a"));
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let b = Backoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let i = item("x");
        assert_eq!(b.when(&i), Duration::from_millis(5));
        assert_eq!(b.when(&i), Duration::from_millis(10));
        assert_eq!(b.when(&i), Duration::from_millis(20));
        for _ in 0..40 {
            b.when(&i);
        }
        assert_eq!(b.when(&i), Duration::from_secs(1000));
        b.forget(&i);
        assert_eq!(b.retries(&i), 0);
        assert_eq!(b.when(&i), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = queue();
        let stop = CancellationToken::new();
        let waiter = {
            let (q, stop) = (q.clone(), stop.clone());
            tokio::spawn(async move { q.get(&stop).await })
        };
        stop.cancel();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
