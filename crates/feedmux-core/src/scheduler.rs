//! Keyed delayed actions with replace-on-reschedule semantics.
//!
//! Used for debouncing control frames and deferring teardown. Scheduling an
//! action for a key that already has one pending aborts the pending one, so
//! there is never more than one outstanding action per key.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Slot {
    id: u64,
    handle: JoinHandle<()>,
}

struct SchedulerState<K> {
    next_id: u64,
    slots: HashMap<K, Slot>,
}

/// Per-key cancellable timers on the Tokio runtime.
pub struct KeyedScheduler<K> {
    state: Arc<Mutex<SchedulerState<K>>>,
}

impl<K> Default for KeyedScheduler<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                next_id: 0,
                slots: HashMap::new(),
            })),
        }
    }
}

fn lock<K>(state: &Mutex<SchedulerState<K>>) -> MutexGuard<'_, SchedulerState<K>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> KeyedScheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, replacing any action still pending for `key`.
    ///
    /// Once the delay elapses the slot is released before `action` starts, so
    /// a running action is never aborted by a later `schedule` or `cancel`.
    pub fn schedule<F>(&self, key: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;

        let shared = Arc::clone(&self.state);
        let slot_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&shared);
                match state.slots.get(&slot_key) {
                    Some(slot) if slot.id == id => {
                        state.slots.remove(&slot_key);
                    }
                    _ => return,
                }
            }
            action.await;
        });

        if let Some(previous) = state.slots.insert(key, Slot { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Abort the pending action for `key`. Returns `true` if one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.state).slots.remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every pending action.
    pub fn cancel_all(&self) {
        for (_, slot) in lock(&self.state).slots.drain() {
            slot.handle.abort();
        }
    }

    /// Returns `true` if an action is pending for `key`.
    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.state).slots.contains_key(key)
    }

    /// Number of pending actions.
    pub fn pending(&self) -> usize {
        lock(&self.state).slots.len()
    }
}

impl<K> Drop for KeyedScheduler<K> {
    fn drop(&mut self) {
        for (_, slot) in lock(&self.state).slots.drain() {
            slot.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    fn bump(c: &Arc<AtomicU32>, by: u32) -> impl Future<Output = ()> + Send + 'static {
        let c = Arc::clone(c);
        async move {
            c.fetch_add(by, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let sched = KeyedScheduler::new();
        let hits = counter();
        sched.schedule("a", Duration::from_millis(100), bump(&hits, 1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(sched.is_pending(&"a"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending() {
        let sched = KeyedScheduler::new();
        let hits = counter();
        sched.schedule("a", Duration::from_millis(100), bump(&hits, 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.schedule("a", Duration::from_millis(100), bump(&hits, 10));

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only the replacement ran.
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let sched = KeyedScheduler::new();
        let hits = counter();
        sched.schedule("a", Duration::from_millis(100), bump(&hits, 1));
        sched.schedule("b", Duration::from_millis(100), bump(&hits, 2));
        assert!(sched.cancel(&"a"));
        assert!(!sched.cancel(&"a"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_and_drop() {
        let hits = counter();
        {
            let sched = KeyedScheduler::new();
            sched.schedule(1u8, Duration::from_millis(10), bump(&hits, 1));
            sched.schedule(2u8, Duration::from_millis(10), bump(&hits, 1));
            sched.cancel_all();
            assert_eq!(sched.pending(), 0);
            sched.schedule(3u8, Duration::from_millis(10), bump(&hits, 1));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
