//! In-process [`Transport`] for tests and offline demos.
//!
//! Every `open()` hands the server side a fresh [`MemoryPeer`] through
//! [`MemoryServer::accept`]. Dropping or closing the peer ends the client's
//! inbound stream, which the client observes as a lost connection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::FeedError;
use crate::transport::{FrameSink, FrameStream, Transport};

#[derive(Default)]
struct Control {
    fail_next: AtomicU32,
    refuse: AtomicBool,
    opens: AtomicU32,
    connect_delay_ms: AtomicU64,
}

/// Client half: implements [`Transport`].
pub struct MemoryTransport {
    url: String,
    control: Arc<Control>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server half: accepts connections and controls failure injection.
pub struct MemoryServer {
    control: Arc<Control>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server side of a single accepted connection.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Result<String, FeedError>>>,
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl MemoryTransport {
    /// Create a connected transport/server pair.
    pub fn pair() -> (Self, MemoryServer) {
        let control = Arc::new(Control::default());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                url: "memory://feed".into(),
                control: Arc::clone(&control),
                accept_tx,
            },
            MemoryServer { control, accept_rx },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<(Box<dyn FrameSink>, FrameStream), FeedError> {
        self.control.opens.fetch_add(1, Ordering::SeqCst);

        let delay = self.control.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.control.refuse.load(Ordering::SeqCst) {
            return Err(FeedError::Connect("connection refused".into()));
        }
        let failing = self
            .control
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FeedError::Connect("connection refused".into()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.accept_tx
            .send(MemoryPeer {
                from_client: out_rx,
                to_client: Some(in_tx),
            })
            .map_err(|_| FeedError::Connect("memory server dropped".into()))?;

        let stream = futures::stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();
        Ok((Box::new(MemorySink { tx: Some(out_tx) }), stream))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        let tx = self.tx.as_ref().ok_or(FeedError::NotConnected)?;
        tx.send(text)
            .map_err(|_| FeedError::WebSocket("peer closed".into()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

impl MemoryServer {
    /// Wait for the client's next successful `open()`.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Make the next `n` calls to `open()` fail.
    pub fn fail_next(&self, n: u32) {
        self.control.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every `open()` until switched back off.
    pub fn refuse(&self, refuse: bool) {
        self.control.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Simulated handshake latency applied to every `open()`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.control
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total `open()` calls so far, successful or not.
    pub fn open_count(&self) -> u32 {
        self.control.opens.load(Ordering::SeqCst)
    }
}

impl MemoryPeer {
    /// Next frame written by the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Every frame the client has written so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Like [`drain`](Self::drain), parsed as JSON.
    pub fn drain_json(&mut self) -> Vec<Value> {
        self.drain()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Push a text frame to the client.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(text.into())).is_ok())
    }

    /// Push a JSON frame to the client.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send(value.to_string())
    }

    /// Drop the connection from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}
