//! `FeedClient`: one explicitly constructed multiplexed feed.
//!
//! ```text
//! subscribe(key, cb) ─► connect() ─► SubscriptionRegistry ─(debounced)─► ConnectionManager::send
//! inbound frame ─► ConnectionManager reader ─► MessageRouter ─► callbacks for key
//! connection lost ─► reconnect (if subscriptions remain) ─► resubscribe_all
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use feedmux_core::{FeedError, SubscriptionKey, Transport};

use crate::config::FeedConfig;
use crate::manager::{ConnectionHandler, ConnectionManager, ConnectionStatus};
use crate::registry::{Callback, ControlChannel, SubscriptionHandle, SubscriptionRegistry};
use crate::router::{MessageRouter, RouterMetrics};
use crate::transport::WsTransport;

/// Registry and router, seen by the manager as its connection handler.
struct FeedCore {
    registry: Arc<SubscriptionRegistry>,
    router: MessageRouter,
}

#[async_trait]
impl ConnectionHandler for FeedCore {
    fn on_message(&self, text: &str) {
        self.router.route(text);
    }

    fn active_subscriptions(&self) -> usize {
        self.registry.active_count()
    }

    fn on_disconnected(&self) {
        self.registry.on_connection_lost();
    }

    async fn on_connected(&self) {
        self.registry.resubscribe_all().await;
    }
}

/// Multiplexed streaming client.
///
/// Create one per endpoint and hand out references; dropping it tears the
/// connection down and aborts its background tasks.
///
/// # Usage
/// ```no_run
/// # async fn example() -> Result<(), feedmux_core::FeedError> {
/// use feedmux_core::SubscriptionKey;
/// use feedmux_ws::{FeedClient, FeedConfig};
///
/// let client = FeedClient::websocket(FeedConfig::default());
/// let handle = client
///     .subscribe(SubscriptionKey::order_book("BTC"), |book| println!("{book}"))
///     .await?;
/// // ...
/// client.release(&handle);
/// # Ok(())
/// # }
/// ```
pub struct FeedClient {
    manager: Arc<ConnectionManager>,
    core: Arc<FeedCore>,
}

impl FeedClient {
    /// Build a client over any transport. Nothing connects until the first
    /// `connect()` or `subscribe()`.
    pub fn new(transport: Arc<dyn Transport>, config: FeedConfig) -> Self {
        let manager = ConnectionManager::new(transport, &config);
        let channel: Arc<dyn ControlChannel> = manager.clone();
        let registry = SubscriptionRegistry::new(channel, config.debounce());
        let core = Arc::new(FeedCore {
            router: MessageRouter::new(Arc::clone(&registry)),
            registry,
        });
        let handler: Arc<dyn ConnectionHandler> = core.clone();
        manager.set_handler(Arc::downgrade(&handler));

        Self { manager, core }
    }

    /// Build a client over a WebSocket to `config.url`.
    pub fn websocket(config: FeedConfig) -> Self {
        let transport = Arc::new(WsTransport::new(config.url.clone()));
        Self::new(transport, config)
    }

    pub async fn connect(&self) -> Result<(), FeedError> {
        self.manager.connect().await
    }

    /// Register `callback` for `key`, connecting first if needed.
    ///
    /// A connect failure is returned to this caller and nothing is registered.
    pub async fn subscribe<F>(
        &self,
        key: SubscriptionKey,
        callback: F,
    ) -> Result<SubscriptionHandle, FeedError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_callback(key, Arc::new(callback)).await
    }

    pub async fn subscribe_callback(
        &self,
        key: SubscriptionKey,
        callback: Callback,
    ) -> Result<SubscriptionHandle, FeedError> {
        self.manager.connect().await?;
        let handle = self.core.registry.subscribe(key, callback);
        self.ensure_served(&handle).await?;
        Ok(handle)
    }

    /// Like [`subscribe`](Self::subscribe), delivering payloads on a channel.
    pub async fn subscribe_channel(
        &self,
        key: SubscriptionKey,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Value>), FeedError> {
        self.manager.connect().await?;
        let (handle, rx) = self.core.registry.subscribe_channel(key);
        self.ensure_served(&handle).await?;
        Ok((handle, rx))
    }

    /// An idle teardown can close the link between `connect()` and
    /// registration. Once registered, the teardown sees the subscription, so
    /// a second check settles it.
    async fn ensure_served(&self, handle: &SubscriptionHandle) -> Result<(), FeedError> {
        if self.manager.is_connected() {
            return Ok(());
        }
        tracing::debug!(key = %handle.key(), "connection closed during subscribe, reconnecting");
        if let Err(e) = self.manager.connect().await {
            self.core.registry.release(handle);
            return Err(e);
        }
        Ok(())
    }

    /// Release a subscription. Safe to call repeatedly or after disconnect.
    pub fn release(&self, handle: &SubscriptionHandle) -> bool {
        self.core.registry.release(handle)
    }

    /// Close the connection and drop every subscription without notifying the server.
    pub async fn disconnect(&self) {
        self.core.registry.clear();
        self.manager.disconnect().await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.watch_status()
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.core.registry.active_keys()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.core.registry
    }

    pub fn router_metrics(&self) -> RouterMetrics {
        self.core.router.metrics()
    }

    pub fn url(&self) -> &str {
        self.manager.url()
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        self.core.registry.clear();
        self.manager.shutdown();
    }
}
