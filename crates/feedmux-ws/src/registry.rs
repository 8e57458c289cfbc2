//! Ref-counted subscription registry with debounced control frames.
//!
//! Each [`SubscriptionKey`] is subscribed on the wire at most once, however
//! many callbacks are registered for it. Control frames are only sent for
//! 0↔nonzero edges of the ref count, after a quiet period, and only when the
//! net result differs from what was last sent on the current connection.
//! A subscribe immediately followed by a release therefore sends nothing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use feedmux_core::{ControlFrame, ControlMethod, FeedError, KeyedScheduler, SubscriptionKey};

/// Subscriber callback, invoked with the `data` payload of each frame.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Where the registry sends its control frames.
#[async_trait]
pub trait ControlChannel: Send + Sync + 'static {
    /// Write one control frame on the current connection.
    async fn send_control(&self, frame: &ControlFrame) -> Result<(), FeedError>;

    /// Returns `true` while a connection is established.
    fn is_connected(&self) -> bool;

    /// Called after a reconcile leaves no active subscriptions.
    fn on_idle(&self) {}
}

/// Token returned by [`SubscriptionRegistry::subscribe`]; pass it back to
/// [`SubscriptionRegistry::release`]. Releasing twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    key: SubscriptionKey,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct SubscriptionEntry {
    /// Registration order is dispatch order.
    callbacks: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    entries: HashMap<SubscriptionKey, SubscriptionEntry>,
    /// Keys subscribed on the current connection.
    on_wire: HashSet<SubscriptionKey>,
    /// Intended next action per key while its debounce timer runs.
    pending: HashMap<SubscriptionKey, ControlMethod>,
}

/// Tracks who is interested in which key and keeps the server in sync.
pub struct SubscriptionRegistry {
    me: Weak<SubscriptionRegistry>,
    channel: Arc<dyn ControlChannel>,
    debounce: Duration,
    state: Mutex<RegistryState>,
    timers: KeyedScheduler<SubscriptionKey>,
}

impl SubscriptionRegistry {
    pub fn new(channel: Arc<dyn ControlChannel>, debounce: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            channel,
            debounce,
            state: Mutex::new(RegistryState::default()),
            timers: KeyedScheduler::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` for `key`. The first registration for a key
    /// schedules a debounced subscribe frame.
    pub fn subscribe(&self, key: SubscriptionKey, callback: Callback) -> SubscriptionHandle {
        let (handle, ref_count) = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            let entry = state.entries.entry(key.clone()).or_default();
            entry.callbacks.push((id, callback));
            let ref_count = entry.callbacks.len();
            if ref_count == 1 {
                state.pending.insert(key.clone(), ControlMethod::Subscribe);
            }
            (SubscriptionHandle { id, key }, ref_count)
        };

        tracing::debug!(key = %handle.key, ref_count, "subscription added");
        if ref_count == 1 {
            self.schedule_reconcile(handle.key.clone());
        }
        handle
    }

    /// Register a channel-backed subscriber; frames arrive on the receiver.
    ///
    /// Dropping the receiver does not release the subscription. The key stays
    /// subscribed until the handle is passed to [`release`](Self::release).
    pub fn subscribe_channel(
        &self,
        key: SubscriptionKey,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = key.to_string();
        let reported = AtomicBool::new(false);
        let handle = self.subscribe(
            key,
            Arc::new(move |data: &Value| {
                if tx.send(data.clone()).is_err() && !reported.swap(true, Ordering::Relaxed) {
                    tracing::debug!(key = %label, "receiver dropped but subscription not released");
                }
            }),
        );
        (handle, rx)
    }

    /// Drop one registration. Returns `false` if the handle was already released.
    ///
    /// Releasing the last registration for a key schedules a debounced
    /// unsubscribe frame.
    pub fn release(&self, handle: &SubscriptionHandle) -> bool {
        let last = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(&handle.key) else {
                return false;
            };
            let Some(pos) = entry.callbacks.iter().position(|(id, _)| *id == handle.id) else {
                return false;
            };
            entry.callbacks.remove(pos);
            let last = entry.callbacks.is_empty();
            if last {
                state.entries.remove(&handle.key);
                state
                    .pending
                    .insert(handle.key.clone(), ControlMethod::Unsubscribe);
            }
            last
        };

        tracing::debug!(key = %handle.key, last, "subscription released");
        if last {
            self.schedule_reconcile(handle.key.clone());
        }
        true
    }

    fn schedule_reconcile(&self, key: SubscriptionKey) {
        let me = self.me.clone();
        let slot = key.clone();
        self.timers.schedule(slot, self.debounce, async move {
            if let Some(registry) = me.upgrade() {
                registry.reconcile(key).await;
            }
        });
    }

    /// Send whatever frame brings the wire in line with the ref count for `key`.
    async fn reconcile(&self, key: SubscriptionKey) {
        let frame = {
            let mut state = self.lock();
            state.pending.remove(&key);
            let desired = state.entries.contains_key(&key);
            let sent = state.on_wire.contains(&key);
            match (desired, sent) {
                (true, false) => Some(ControlFrame::subscribe(key.clone())),
                (false, true) => Some(ControlFrame::unsubscribe(key.clone())),
                _ => None,
            }
        };

        if let Some(frame) = frame {
            self.transmit(frame).await;
        } else {
            tracing::trace!(key = %key, "no net change, nothing to send");
        }

        if self.active_count() == 0 {
            self.channel.on_idle();
        }
    }

    async fn transmit(&self, frame: ControlFrame) {
        let key = frame.subscription.clone();
        if !self.channel.is_connected() {
            // The server forgot everything with the connection; reconnect resends.
            self.lock().on_wire.remove(&key);
            tracing::debug!(key = %key, method = ?frame.method, "not connected, frame deferred");
            return;
        }

        {
            let mut state = self.lock();
            match frame.method {
                ControlMethod::Subscribe => state.on_wire.insert(key.clone()),
                ControlMethod::Unsubscribe => state.on_wire.remove(&key),
            };
        }

        match self.channel.send_control(&frame).await {
            Ok(()) => tracing::debug!(key = %key, method = ?frame.method, "control frame sent"),
            Err(e) => {
                if e.is_retryable() {
                    tracing::debug!(key = %key, method = ?frame.method, error = %e, "control frame failed, reconnect will resend");
                } else {
                    tracing::warn!(key = %key, method = ?frame.method, error = %e, "control frame failed");
                }
                if frame.method == ControlMethod::Subscribe {
                    self.lock().on_wire.remove(&key);
                }
            }
        }
    }

    /// Resend one subscribe frame per active key, bypassing the debounce.
    /// Called once a (re)connection is established. Returns the number of
    /// keys resubscribed.
    pub async fn resubscribe_all(&self) -> usize {
        let keys: Vec<SubscriptionKey> = {
            let mut state = self.lock();
            let keys: Vec<_> = state.entries.keys().cloned().collect();
            state.on_wire = keys.iter().cloned().collect();
            for key in &keys {
                state.pending.remove(key);
            }
            keys
        };

        for key in &keys {
            self.timers.cancel(key);
        }

        let mut sent = 0;
        for key in &keys {
            match self
                .channel
                .send_control(&ControlFrame::subscribe(key.clone()))
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "resubscribe failed");
                    self.lock().on_wire.remove(key);
                }
            }
        }
        tracing::info!(count = sent, "resubscribed active subscriptions");
        sent
    }

    /// Forget what was sent on the connection that just went away.
    pub fn on_connection_lost(&self) {
        self.lock().on_wire.clear();
    }

    /// Callbacks registered for `key`, in registration order.
    pub fn callbacks_for(&self, key: &SubscriptionKey) -> Vec<Callback> {
        self.lock()
            .entries
            .get(key)
            .map(|e| e.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Number of keys with at least one registration.
    pub fn active_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.lock().entries.keys().cloned().collect()
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.lock()
            .entries
            .get(key)
            .map_or(0, |e| e.callbacks.len())
    }

    /// Keys whose debounce timer is still running.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// The intended next control action for `key`, if one is pending.
    pub fn pending_action(&self, key: &SubscriptionKey) -> Option<ControlMethod> {
        self.lock().pending.get(key).copied()
    }

    /// Returns `true` if a subscribe for `key` is live on the current connection.
    pub fn is_on_wire(&self, key: &SubscriptionKey) -> bool {
        self.lock().on_wire.contains(key)
    }

    /// Drop every registration and pending timer without sending anything.
    pub fn clear(&self) {
        self.timers.cancel_all();
        let mut state = self.lock();
        state.entries.clear();
        state.on_wire.clear();
        state.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every frame instead of sending it.
    #[derive(Default)]
    struct RecordingChannel {
        frames: Mutex<Vec<ControlFrame>>,
        offline: AtomicBool,
    }

    impl RecordingChannel {
        fn frames(&self) -> Vec<ControlFrame> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ControlChannel for RecordingChannel {
        async fn send_control(&self, frame: &ControlFrame) -> Result<(), FeedError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(FeedError::NotConnected);
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    fn setup() -> (Arc<RecordingChannel>, Arc<SubscriptionRegistry>) {
        let channel = Arc::new(RecordingChannel::default());
        let registry = SubscriptionRegistry::new(channel.clone(), Duration::from_millis(100));
        (channel, registry)
    }

    fn noop() -> Callback {
        Arc::new(|_: &Value| {})
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_subscribe_sends_one_frame_after_debounce() {
        let (channel, registry) = setup();
        let key = SubscriptionKey::order_book("BTC");
        registry.subscribe(key.clone(), noop());

        assert_eq!(registry.pending_action(&key), Some(ControlMethod::Subscribe));
        assert!(channel.frames().is_empty());

        settle().await;
        assert_eq!(channel.frames(), vec![ControlFrame::subscribe(key.clone())]);
        assert!(registry.is_on_wire(&key));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn churn_inside_window_sends_nothing() {
        let (channel, registry) = setup();
        let key = SubscriptionKey::order_book("BTC-USD");
        let handle = registry.subscribe(key.clone(), noop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.release(&handle);

        settle().await;
        assert!(channel.frames().is_empty());
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_on_wire(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn release_and_resubscribe_of_live_key_sends_nothing() {
        let (channel, registry) = setup();
        let key = SubscriptionKey::AllMids;
        let handle = registry.subscribe(key.clone(), noop());
        settle().await;
        assert!(registry.is_on_wire(&key));

        registry.release(&handle);
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.subscribe(key.clone(), noop());
        assert_eq!(registry.pending_action(&key), Some(ControlMethod::Subscribe));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(channel.frames(), vec![ControlFrame::subscribe(key.clone())]);
        assert!(registry.is_on_wire(&key));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_key_subscribes_once_and_unsubscribes_last() {
        let (channel, registry) = setup();
        let key = SubscriptionKey::user_events("0xabc");
        let a = registry.subscribe(key.clone(), noop());
        let b = registry.subscribe(key.clone(), noop());
        assert_eq!(registry.ref_count(&key), 2);
        settle().await;

        registry.release(&a);
        settle().await;
        assert_eq!(channel.frames(), vec![ControlFrame::subscribe(key.clone())]);

        registry.release(&b);
        settle().await;
        assert_eq!(
            channel.frames(),
            vec![
                ControlFrame::subscribe(key.clone()),
                ControlFrame::unsubscribe(key.clone())
            ]
        );
        assert_eq!(registry.ref_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_idempotent() {
        let (_channel, registry) = setup();
        let key = SubscriptionKey::AllMids;
        let a = registry.subscribe(key.clone(), noop());
        let _b = registry.subscribe(key.clone(), noop());

        assert!(registry.release(&a));
        assert!(!registry.release(&a));
        assert_eq!(registry.ref_count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_sends_each_active_key_once() {
        let (channel, registry) = setup();
        let book = SubscriptionKey::order_book("ETH");
        let user = SubscriptionKey::user_events("0xabc");
        registry.subscribe(book.clone(), noop());
        registry.subscribe(user.clone(), noop());
        registry.subscribe(user.clone(), noop());
        settle().await;
        channel.frames.lock().unwrap().clear();

        registry.on_connection_lost();
        assert!(!registry.is_on_wire(&book));
        assert_eq!(registry.resubscribe_all().await, 2);

        let mut keys: Vec<_> = channel
            .frames()
            .into_iter()
            .map(|f| {
                assert_eq!(f.method, ControlMethod::Subscribe);
                f.subscription.to_string()
            })
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["l2Book:ETH", "userEvents:0xabc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_preempts_pending_debounce() {
        let (channel, registry) = setup();
        let key = SubscriptionKey::trades("SOL");
        registry.subscribe(key.clone(), noop());
        registry.resubscribe_all().await;
        settle().await;
        // The debounced subscribe must not follow the immediate one.
        assert_eq!(channel.frames(), vec![ControlFrame::subscribe(key)]);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_subscribe_is_deferred() {
        let (channel, registry) = setup();
        channel.offline.store(true, Ordering::SeqCst);
        let key = SubscriptionKey::trades("BTC");
        registry.subscribe(key.clone(), noop());
        settle().await;
        assert!(channel.frames().is_empty());
        assert!(!registry.is_on_wire(&key));

        channel.offline.store(false, Ordering::SeqCst);
        registry.resubscribe_all().await;
        assert_eq!(channel.frames(), vec![ControlFrame::subscribe(key)]);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_keep_registration_order() {
        let (_channel, registry) = setup();
        let key = SubscriptionKey::AllMids;
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            registry.subscribe(
                key.clone(),
                Arc::new(move |_: &Value| order.lock().unwrap().push(i)),
            );
        }
        for cb in registry.callbacks_for(&key) {
            cb(&Value::Null);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_channel_delivers_payloads() {
        let (_channel, registry) = setup();
        let key = SubscriptionKey::trades("BTC");
        let (handle, mut rx) = registry.subscribe_channel(key.clone());
        for cb in registry.callbacks_for(&key) {
            cb(&serde_json::json!({"px": "1"}));
        }
        assert_eq!(rx.try_recv().unwrap()["px"], "1");
        registry.release(&handle);
        assert!(registry.callbacks_for(&key).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_receiver_keeps_subscription_until_released() {
        let (channel, registry) = setup();
        let key = SubscriptionKey::order_book("BTC");
        let (handle, rx) = registry.subscribe_channel(key.clone());
        settle().await;
        drop(rx);

        for _ in 0..2 {
            for cb in registry.callbacks_for(&key) {
                cb(&serde_json::json!({"coin": "BTC"}));
            }
        }
        assert_eq!(registry.ref_count(&key), 1);
        assert!(registry.is_on_wire(&key));

        registry.release(&handle);
        settle().await;
        assert_eq!(
            channel.frames(),
            vec![ControlFrame::subscribe(key.clone()), ControlFrame::unsubscribe(key)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_everything_silently() {
        let (channel, registry) = setup();
        let handle = registry.subscribe(SubscriptionKey::AllMids, noop());
        registry.clear();
        settle().await;
        assert!(channel.frames().is_empty());
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.release(&handle));
    }
}
