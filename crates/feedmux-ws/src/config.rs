//! Feed client configuration.

use std::time::Duration;

use feedmux_core::{FeedError, ReconnectConfig};
use serde::{Deserialize, Serialize};

/// Configuration for a [`FeedClient`](crate::FeedClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// WebSocket endpoint, e.g. "wss://api.hyperliquid.xyz/ws"
    #[serde(default = "default_url")]
    pub url: String,
    /// Quiet period before a subscribe/unsubscribe frame is sent, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Minimum time a connection stays up before idle teardown, in milliseconds
    #[serde(default = "default_min_connection_lifetime_ms")]
    pub min_connection_lifetime_ms: u64,
    /// Keep-alive ping interval in milliseconds (None = no pings)
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: Option<u64>,
    /// Close the connection once the last subscription is released
    #[serde(default = "bool_true")]
    pub idle_disconnect: bool,
    /// Backoff for automatic reconnection
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_url() -> String { "wss://api.hyperliquid.xyz/ws".into() }
fn default_debounce_ms() -> u64 { 100 }
fn default_min_connection_lifetime_ms() -> u64 { 5_000 }
fn default_ping_interval_ms() -> Option<u64> { Some(50_000) }
fn bool_true() -> bool { true }

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            debounce_ms: default_debounce_ms(),
            min_connection_lifetime_ms: default_min_connection_lifetime_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_disconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Default config pointed at `url`.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, FeedError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn min_connection_lifetime(&self) -> Duration {
        Duration::from_millis(self.min_connection_lifetime_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
