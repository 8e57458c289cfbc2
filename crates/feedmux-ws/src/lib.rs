//! feedmux-ws: multiplexed WebSocket market-data client.
//!
//! # Features
//! - One connection shared by any number of subscribers
//! - Ref-counted subscriptions; debounced subscribe/unsubscribe frames
//! - Auto-reconnect with exponential backoff while subscriptions remain
//! - Auto-resubscribe after reconnect
//! - Idle teardown honouring a minimum connection lifetime
//! - Keep-alive pings

pub mod client;
pub mod config;
pub mod manager;
pub mod registry;
pub mod router;
pub mod transport;

pub use client::FeedClient;
pub use config::FeedConfig;
pub use manager::{ConnectionHandler, ConnectionManager, ConnectionStatus};
pub use registry::{Callback, ControlChannel, SubscriptionHandle, SubscriptionRegistry};
pub use router::{MessageRouter, RouterMetrics};
pub use transport::WsTransport;
