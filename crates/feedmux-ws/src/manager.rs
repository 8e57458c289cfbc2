//! Connection manager: owns the single streaming connection.
//!
//! State machine:
//! - `Disconnected` → `Connecting`: `connect()`; concurrent callers share one attempt
//! - `Connecting` → `Connected`:    transport opened, reader task spawned
//! - `Connecting` → `Disconnected`: open failed; only that attempt's callers see the error
//! - `Connected` → `Disconnected`:  connection lost or `disconnect()`
//!
//! On loss the manager reconnects with exponential backoff, but only while at
//! least one subscription is active. After `max_attempts` failures it gives up
//! and flags the status as exhausted until the next successful `connect()`.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};

use feedmux_core::{
    ConnectionState, ControlFrame, FeedError, FrameSink, FrameStream, ReconnectPolicy, Transport,
    PING_FRAME,
};

use crate::config::FeedConfig;
use crate::registry::ControlChannel;

/// Receives what happens on the connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// One inbound text frame, in delivery order.
    fn on_message(&self, text: &str);

    /// Number of subscriptions that still want data.
    fn active_subscriptions(&self) -> usize;

    /// The connection went away (lost or torn down).
    fn on_disconnected(&self);

    /// A connection was established while subscriptions were active.
    async fn on_connected(&self);
}

/// Observable connection status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Current reconnect attempt (0 when not reconnecting).
    pub reconnect_attempt: u32,
    /// Set when reconnection gave up; cleared by the next successful connect.
    pub reconnect_exhausted: bool,
    /// Successful automatic reconnections so far.
    pub reconnects: u64,
    pub connected_at: Option<Instant>,
}

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>;
type ConnectFuture = Shared<BoxFuture<'static, Result<(), FeedError>>>;

struct Link {
    epoch: u64,
    sink: SharedSink,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    /// Bumped on every new link and every teardown; stale tasks compare against it.
    epoch: u64,
    link: Option<Link>,
    connecting: Option<ConnectFuture>,
    reconnect_task: Option<JoinHandle<()>>,
    idle_task: Option<JoinHandle<()>>,
}

/// Owns the connection; everything else goes through `connect` / `send`.
pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    min_lifetime: Duration,
    ping_interval: Option<Duration>,
    idle_disconnect: bool,
    state: Mutex<ManagerState>,
    status: watch::Sender<ConnectionStatus>,
    handler: OnceLock<Weak<dyn ConnectionHandler>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: &FeedConfig) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            min_lifetime: config.min_connection_lifetime(),
            ping_interval: config.ping_interval(),
            idle_disconnect: config.idle_disconnect,
            state: Mutex::new(ManagerState::default()),
            status,
            handler: OnceLock::new(),
        })
    }

    /// Attach the handler. Only the first call has an effect.
    pub fn set_handler(&self, handler: Weak<dyn ConnectionHandler>) {
        let _ = self.handler.set(handler);
    }

    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    fn active_subscriptions(&self) -> usize {
        self.handler().map_or(0, |h| h.active_subscriptions())
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes, including reconnect exhaustion.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Ensure the connection exists.
    ///
    /// Returns immediately when connected; joins the attempt in flight when
    /// connecting; otherwise opens a new connection. Every caller of one
    /// attempt observes the same outcome.
    pub async fn connect(&self) -> Result<(), FeedError> {
        let attempt = {
            let mut state = self.lock();
            if state.link.is_some() {
                return Ok(());
            }
            if let Some(attempt) = state.connecting.clone() {
                attempt
            } else {
                let me = self.me.upgrade().ok_or(FeedError::Closed)?;
                let epoch = state.epoch;
                let attempt = async move { me.establish(epoch).await }.boxed().shared();
                state.connecting = Some(attempt.clone());
                self.status.send_modify(|s| s.state = ConnectionState::Connecting);
                // Drive the attempt even if every caller stops waiting.
                tokio::spawn(attempt.clone().map(|_| ()));
                attempt
            }
        };
        attempt.await
    }

    async fn establish(self: Arc<Self>, epoch: u64) -> Result<(), FeedError> {
        let opened = self.transport.open().await;

        let (sink, stream) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                let mut state = self.lock();
                if state.epoch == epoch {
                    state.connecting = None;
                    self.status.send_modify(|s| s.state = ConnectionState::Disconnected);
                }
                tracing::warn!(url = %self.url(), error = %e, "connect failed");
                return Err(e);
            }
        };

        let installed = {
            let mut state = self.lock();
            if state.epoch != epoch {
                Err(sink)
            } else {
                state.epoch += 1;
                let link_epoch = state.epoch;
                let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
                let reader = tokio::spawn(read_loop(
                    self.me.clone(),
                    link_epoch,
                    stream,
                    Arc::clone(&sink),
                    self.ping_interval,
                ));
                state.link = Some(Link {
                    epoch: link_epoch,
                    sink,
                    reader,
                });
                state.connecting = None;

                let now = Instant::now();
                self.status.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.reconnect_attempt = 0;
                    s.reconnect_exhausted = false;
                    s.connected_at = Some(now);
                });
                Ok(())
            }
        };

        if let Err(mut sink) = installed {
            // disconnect() ran while we were opening.
            sink.close().await;
            return Err(FeedError::Closed);
        }

        tracing::info!(url = %self.url(), "connected");

        if let Some(handler) = self.handler() {
            if handler.active_subscriptions() > 0 {
                handler.on_connected().await;
            }
        }
        Ok(())
    }

    /// Serialize and write a control frame.
    pub async fn send(&self, frame: &ControlFrame) -> Result<(), FeedError> {
        let text = serde_json::to_string(frame)?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> Result<(), FeedError> {
        let sink = self
            .lock()
            .link
            .as_ref()
            .map(|l| Arc::clone(&l.sink))
            .ok_or(FeedError::NotConnected)?;
        let result = sink.lock().await.send_text(text).await;
        result
    }

    /// Tear the connection down and clear all bookkeeping. No reconnect follows.
    pub async fn disconnect(&self) {
        let link = self.teardown();
        self.close_link(link).await;
    }

    async fn close_link(&self, link: Option<Link>) {
        if let Some(link) = link {
            link.reader.abort();
            link.sink.lock().await.close().await;
            tracing::info!(url = %self.url(), "disconnected");
        }
        if let Some(handler) = self.handler() {
            handler.on_disconnected();
        }
    }

    /// Synchronous teardown for `Drop`: aborts tasks and drops the connection.
    pub fn shutdown(&self) {
        if let Some(link) = self.teardown() {
            link.reader.abort();
        }
    }

    fn teardown(&self) -> Option<Link> {
        let mut state = self.lock();
        self.teardown_locked(&mut state)
    }

    fn teardown_locked(&self, state: &mut ManagerState) -> Option<Link> {
        state.epoch += 1;
        state.connecting = None;
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = state.idle_task.take() {
            task.abort();
        }
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.reconnect_attempt = 0;
            s.connected_at = None;
        });
        state.link.take()
    }

    /// Close the connection once it has lived for the minimum lifetime,
    /// provided nothing subscribed again in the meantime.
    pub fn disconnect_when_idle(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let mut state = self.lock();
        if state.link.is_none() {
            return;
        }
        let remaining = self
            .status
            .borrow()
            .connected_at
            .map(|at| (at + self.min_lifetime).saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);

        let task = tokio::spawn(async move {
            time::sleep(remaining).await;
            me.close_if_idle().await;
        });
        if let Some(previous) = state.idle_task.replace(task) {
            previous.abort();
        }
    }

    /// Tear down only if no subscription is active. The count is read under
    /// the state lock, so a subscriber that registers and then finds the link
    /// alive is never left on a closed connection.
    async fn close_if_idle(&self) {
        let link = {
            let mut state = self.lock();
            // Release our own slot first so teardown cannot abort us mid-close.
            state.idle_task = None;
            if self.active_subscriptions() > 0 {
                return;
            }
            tracing::info!("no active subscriptions, closing idle connection");
            self.teardown_locked(&mut state)
        };
        self.close_link(link).await;
    }

    fn dispatch(&self, text: &str) {
        if let Some(handler) = self.handler() {
            handler.on_message(text);
        }
    }

    fn handle_loss(&self, epoch: u64) {
        {
            let mut state = self.lock();
            if state.link.as_ref().map(|l| l.epoch) != Some(epoch) {
                return;
            }
            state.link = None;
            if let Some(task) = state.idle_task.take() {
                task.abort();
            }
        }
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.connected_at = None;
        });

        if let Some(handler) = self.handler() {
            handler.on_disconnected();
        }

        let active = self.active_subscriptions();
        if active == 0 {
            tracing::info!(url = %self.url(), "connection closed with no active subscriptions, not reconnecting");
            return;
        }

        tracing::warn!(url = %self.url(), active, "connection lost, scheduling reconnect");
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move { me.reconnect_loop().await });
        if let Some(previous) = self.lock().reconnect_task.replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let Some(delay) = self.policy.next_delay(attempt) else {
                let attempts = self.policy.config.max_attempts;
                self.status.send_modify(|s| {
                    s.reconnect_attempt = 0;
                    s.reconnect_exhausted = true;
                });
                tracing::error!(
                    url = %self.url(),
                    error = %FeedError::ReconnectExhausted { attempts },
                    "giving up; subscriptions stay registered until the next connect()"
                );
                return;
            };

            self.status.send_modify(|s| s.reconnect_attempt = attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            time::sleep(delay).await;

            if self.active_subscriptions() == 0 {
                tracing::info!("subscriptions released while waiting, abandoning reconnect");
                self.status.send_modify(|s| s.reconnect_attempt = 0);
                return;
            }

            match self.connect().await {
                Ok(()) => {
                    self.status.send_modify(|s| s.reconnects += 1);
                    return;
                }
                Err(e) if e.is_terminal() => {
                    tracing::info!(attempt, error = %e, "feed shut down, abandoning reconnect");
                    self.status.send_modify(|s| s.reconnect_attempt = 0);
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
    }
}

#[async_trait]
impl ControlChannel for ConnectionManager {
    async fn send_control(&self, frame: &ControlFrame) -> Result<(), FeedError> {
        self.send(frame).await
    }

    fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    fn on_idle(&self) {
        if self.idle_disconnect {
            self.disconnect_when_idle();
        }
    }
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Reads frames until the stream ends, sending keep-alive pings meanwhile.
async fn read_loop(
    manager: Weak<ConnectionManager>,
    epoch: u64,
    mut stream: FrameStream,
    sink: SharedSink,
    ping_interval: Option<Duration>,
) {
    let mut ping = ping_interval.map(|period| time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(text)) => match manager.upgrade() {
                    Some(m) => m.dispatch(&text),
                    None => return,
                },
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "WS receive error");
                    break;
                }
                None => break,
            },
            _ = tick(&mut ping) => {
                if let Err(e) = sink.lock().await.send_text(PING_FRAME.to_string()).await {
                    tracing::warn!(error = %e, "keep-alive ping failed");
                    break;
                }
            }
        }
    }

    if let Some(m) = manager.upgrade() {
        m.handle_loss(epoch);
    }
}
