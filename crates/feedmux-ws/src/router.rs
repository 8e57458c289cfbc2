//! Inbound frame routing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use feedmux_core::{FeedError, InboundFrame, SubscriptionKey};

use crate::registry::SubscriptionRegistry;

/// Counters for routed and dropped frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterMetrics {
    pub frames_routed: u64,
    pub frames_dropped: u64,
    pub parse_errors: u64,
    pub callback_panics: u64,
}

/// Resolves each inbound frame to its subscription key and fans the payload
/// out to that key's callbacks.
pub struct MessageRouter {
    registry: Arc<SubscriptionRegistry>,
    metrics: Mutex<RouterMetrics>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            metrics: Mutex::new(RouterMetrics::default()),
        }
    }

    fn metrics_mut(&self) -> MutexGuard<'_, RouterMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of the counters.
    pub fn metrics(&self) -> RouterMetrics {
        self.metrics_mut().clone()
    }

    /// Parse a text frame and derive its subscription key.
    ///
    /// Returns `Ok(None)` for protocol acknowledgements, which carry no
    /// subscriber payload.
    pub fn resolve(text: &str) -> Result<Option<(SubscriptionKey, InboundFrame)>, FeedError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        if frame.is_protocol_ack() {
            if frame.channel == "error" {
                tracing::warn!(data = %frame.data, "server reported an error");
            } else {
                tracing::trace!(channel = %frame.channel, "protocol acknowledgement");
            }
            return Ok(None);
        }
        match frame.key() {
            Some(key) => Ok(Some((key, frame))),
            None => Err(FeedError::UnroutableFrame {
                channel: frame.channel,
            }),
        }
    }

    /// Route one text frame. Returns how many callbacks ran.
    ///
    /// Callbacks run in registration order, each isolated so a panicking
    /// subscriber does not keep the others from seeing the frame.
    pub fn route(&self, text: &str) -> usize {
        let (key, frame) = match Self::resolve(text) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return 0,
            Err(e @ FeedError::UnroutableFrame { .. }) => {
                tracing::debug!(error = %e, "dropping frame");
                self.metrics_mut().frames_dropped += 1;
                return 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                self.metrics_mut().parse_errors += 1;
                return 0;
            }
        };

        let callbacks = self.registry.callbacks_for(&key);
        if callbacks.is_empty() {
            tracing::trace!(key = %key, "no subscribers, dropping frame");
            self.metrics_mut().frames_dropped += 1;
            return 0;
        }

        let mut panics = 0;
        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&frame.data))).is_err() {
                tracing::error!(key = %key, "subscriber callback panicked");
                panics += 1;
            }
        }

        let mut metrics = self.metrics_mut();
        metrics.frames_routed += 1;
        metrics.callback_panics += panics;
        callbacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Callback, ControlChannel};
    use async_trait::async_trait;
    use feedmux_core::ControlFrame;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct NullChannel;

    #[async_trait]
    impl ControlChannel for NullChannel {
        async fn send_control(&self, _frame: &ControlFrame) -> Result<(), FeedError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn router() -> (Arc<SubscriptionRegistry>, MessageRouter) {
        let registry = SubscriptionRegistry::new(Arc::new(NullChannel), Duration::from_millis(100));
        (Arc::clone(&registry), MessageRouter::new(registry))
    }

    fn collecting(sink: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Callback {
        let sink = Arc::clone(sink);
        Arc::new(move |data: &Value| {
            sink.lock().unwrap().push(format!("{tag}:{}", data["coin"].as_str().unwrap_or("-")));
        })
    }

    #[tokio::test]
    async fn routes_to_matching_key_only() {
        let (registry, router) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe(SubscriptionKey::order_book("BTC"), collecting(&seen, "btc"));
        registry.subscribe(SubscriptionKey::order_book("ETH"), collecting(&seen, "eth"));

        let n = router.route(&json!({"channel": "l2Book", "data": {"coin": "ETH"}}).to_string());
        assert_eq!(n, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["eth:ETH"]);
        assert_eq!(router.metrics().frames_routed, 1);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_block_others() {
        let (registry, router) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let key = SubscriptionKey::order_book("BTC");
        registry.subscribe(key.clone(), collecting(&seen, "first"));
        registry.subscribe(key.clone(), Arc::new(|_: &Value| panic!("subscriber bug")));
        registry.subscribe(key, collecting(&seen, "third"));

        let n = router.route(r#"{"channel":"l2Book","data":{"coin":"BTC"}}"#);
        assert_eq!(n, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first:BTC", "third:BTC"]);
        assert_eq!(router.metrics().callback_panics, 1);
    }

    #[tokio::test]
    async fn drops_malformed_unknown_and_stale_frames() {
        let (registry, router) = router();
        let handle = registry.subscribe(SubscriptionKey::trades("BTC"), Arc::new(|_: &Value| {}));
        registry.release(&handle);

        assert_eq!(router.route("{not json"), 0);
        assert_eq!(router.route(r#"{"channel":"candle","data":{}}"#), 0);
        assert_eq!(
            router.route(r#"{"channel":"trades","data":[{"coin":"BTC","px":"1"}]}"#),
            0
        );
        assert_eq!(router.route(r#"{"channel":"subscriptionResponse","data":{}}"#), 0);

        let m = router.metrics();
        assert_eq!(m.parse_errors, 1);
        assert_eq!(m.frames_dropped, 2);
        assert_eq!(m.frames_routed, 0);
    }

    #[tokio::test]
    async fn singleton_and_user_routing() {
        let (registry, router) = router();
        let (_h1, mut mids) = registry.subscribe_channel(SubscriptionKey::AllMids);
        let (_h2, mut user) = registry.subscribe_channel(SubscriptionKey::user_events("0xAbC"));

        router.route(r#"{"channel":"allMids","data":{"mids":{"BTC":"1"}}}"#);
        router.route(r#"{"channel":"userEvents","data":{"user":"0xabc","fills":[]}}"#);

        assert_eq!(mids.try_recv().unwrap()["mids"]["BTC"], "1");
        assert_eq!(user.try_recv().unwrap()["user"], "0xabc");
    }

    #[test]
    fn resolve_classifies_frames() {
        let (key, frame) = MessageRouter::resolve(r#"{"channel":"trades","data":[{"coin":"SOL"}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(key, SubscriptionKey::trades("SOL"));
        assert_eq!(frame.channel, "trades");

        assert_eq!(MessageRouter::resolve(r#"{"channel":"pong"}"#), Ok(None));
        assert_eq!(
            MessageRouter::resolve(r#"{"channel":"candle","data":{}}"#),
            Err(FeedError::UnroutableFrame {
                channel: "candle".into()
            })
        );
        assert!(matches!(
            MessageRouter::resolve("{not json"),
            Err(FeedError::Serialization(_))
        ));
    }
}
