//! feedmux-core: shared types and policies for feedmux.
//!
//! # Overview
//!
//! feedmux keeps one streaming connection to a market-data service and fans
//! its messages out to many subscribers. This crate holds the pieces that do
//! not depend on a particular socket implementation:
//!
//! - [`SubscriptionKey`] / [`ControlFrame`] / [`InboundFrame`]: wire types
//! - [`Transport`] / [`FrameSink`]: the connection seam
//! - [`FeedError`]: structured error type
//! - [`KeyedScheduler`]: debounce and deferred actions
//! - [`policy`] module: reconnect backoff, request coalescer
//! - [`memory`] module: in-process transport for tests and demos

pub mod error;
pub mod frame;
pub mod memory;
pub mod policy;
pub mod scheduler;
pub mod transport;

pub use error::FeedError;
pub use frame::{Channel, ControlFrame, ControlMethod, InboundFrame, SubscriptionKey, PING_FRAME};
pub use policy::{CoalescerConfig, CoalescerStats, ReconnectConfig, ReconnectPolicy, RequestCoalescer};
pub use scheduler::KeyedScheduler;
pub use transport::{ConnectionState, FrameSink, FrameStream, Transport};
