//! The `Transport` seam: how the connection manager obtains a live connection.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::FeedError;

/// Inbound text frames of one connection. The stream ending means the
/// connection is gone.
pub type FrameStream = BoxStream<'static, Result<String, FeedError>>;

/// Write half of an established connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Something that can open a persistent, message-oriented connection.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the manager keeps one behind an
/// `Arc<dyn Transport>` and reopens it on every reconnect.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a fresh connection, returning its write half and inbound stream.
    async fn open(&self) -> Result<(Box<dyn FrameSink>, FrameStream), FeedError>;

    /// Return the endpoint identifier (URL or name).
    fn url(&self) -> &str;
}

/// Lifecycle state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}
