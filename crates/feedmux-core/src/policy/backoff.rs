//! Exponential reconnect backoff with a hard attempt cap.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Attempts made before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 { 1_000 }
fn default_max_attempts() -> u32 { 5 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Stateless policy: computes the delay for a given attempt number.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th reconnect (1-based): `base × 2^(attempt-1)`.
    /// Returns `None` once `attempt` exceeds `max_attempts`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || !self.should_retry(attempt) {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.config.base_delay().saturating_mul(factor))
    }

    /// Returns `true` if `attempt` is within the cap.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            base_delay_ms: base_ms,
            max_attempts: max,
        })
    }

    #[test]
    fn delays_double_each_attempt() {
        let p = policy(100, 5);
        let delays: Vec<u128> = (1..=5).map(|n| p.next_delay(n).unwrap().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn no_delay_beyond_cap() {
        let p = policy(100, 3);
        assert!(p.next_delay(3).is_some());
        assert!(p.next_delay(4).is_none());
        assert!(p.next_delay(0).is_none());
    }

    #[test]
    fn should_retry_boundary() {
        let p = policy(10, 2);
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
    }

    #[test]
    fn huge_attempt_saturates() {
        let p = policy(1_000, u32::MAX);
        assert!(p.next_delay(64).is_some());
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let cfg: ReconnectConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ReconnectConfig::default());
    }
}
