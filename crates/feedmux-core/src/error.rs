//! Feed-level error types.

use thiserror::Error;

/// Errors that can occur while talking to the streaming service or running
/// a coalesced operation.
///
/// The type is `Clone` so one outcome can be handed to every caller sharing
/// an in-flight connect or coalesced request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Opening the connection failed (DNS, TCP, TLS, handshake).
    #[error("Connect error: {0}")]
    Connect(String),

    /// WebSocket send/receive error on an established connection.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A frame was sent while no connection exists.
    #[error("Not connected")]
    NotConnected,

    /// The client (or its background task) has been shut down.
    #[error("Feed closed")]
    Closed,

    /// Background reconnection gave up after the configured attempt cap.
    #[error("Reconnect abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A frame or config could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An inbound frame did not map onto any known subscription key.
    #[error("Unroutable frame on channel {channel}")]
    UnroutableFrame { channel: String },

    /// A coalesced operation failed.
    #[error("Operation failed: {0}")]
    Operation(String),
}

impl FeedError {
    /// Returns `true` if this error is transient and a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::WebSocket(_) | Self::NotConnected
        )
    }

    /// Returns `true` if the error means the feed will not recover on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::ReconnectExhausted { .. })
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FeedError::Connect("refused".into()).is_retryable());
        assert!(FeedError::NotConnected.is_retryable());
        assert!(!FeedError::Closed.is_retryable());
        assert!(!FeedError::Operation("boom".into()).is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(FeedError::ReconnectExhausted { attempts: 5 }.is_terminal());
        assert!(!FeedError::WebSocket("reset".into()).is_terminal());
    }

    #[test]
    fn serde_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let feed: FeedError = err.into();
        assert!(matches!(feed, FeedError::Serialization(_)));
    }
}
