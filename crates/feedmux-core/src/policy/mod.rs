//! Policies shared by callers of a scarce, unreliable resource.
//!
//! ```text
//! Connection loss → [ReconnectPolicy]  → reopen
//! Keyed operation → [RequestCoalescer] → dedup + min spacing → operation
//! ```

pub mod backoff;
pub mod coalescer;

pub use backoff::{ReconnectConfig, ReconnectPolicy};
pub use coalescer::{CoalescerConfig, CoalescerStats, RequestCoalescer};
