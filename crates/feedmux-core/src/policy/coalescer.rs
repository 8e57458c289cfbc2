//! Keyed request coalescing with a minimum spacing between executions.
//!
//! - Concurrent calls under the same key share one execution and its outcome.
//! - Successive executions under the same key start at least `min_interval`
//!   apart, measured from the previous successful dispatch.
//! - Keys never wait on each other.
//!
//! Operations run on a spawned task, so dropping every caller does not cancel
//! an operation that has already been dispatched. A panicking operation frees
//! its key like any other completion.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Coalescer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Minimum spacing between executions under one key, in milliseconds.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 { 1_000 }

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl CoalescerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Point-in-time view of the coalescer's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Callers currently waiting on an in-flight result, across all keys.
    pub queue_depth: usize,
    /// Keys with an operation in flight.
    pub in_flight: usize,
    /// Time since the last successful execution, per key.
    pub last_execution_age: HashMap<String, Duration>,
}

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct InFlight<T, E> {
    id: u64,
    result: SharedResult<T, E>,
    started_at: Instant,
    waiters: usize,
}

struct CoalescerState<T, E> {
    next_id: u64,
    in_flight: HashMap<String, InFlight<T, E>>,
    last_execution: HashMap<String, Instant>,
}

/// Deduplicates and spaces keyed async operations.
///
/// Outcomes are cloned to every caller, so both `T` and `E` must be `Clone`.
pub struct RequestCoalescer<T, E> {
    config: CoalescerConfig,
    state: Arc<Mutex<CoalescerState<T, E>>>,
}

fn lock<T, E>(state: &Mutex<CoalescerState<T, E>>) -> MutexGuard<'_, CoalescerState<T, E>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T, E> RequestCoalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(CoalescerState {
                next_id: 0,
                in_flight: HashMap::new(),
                last_execution: HashMap::new(),
            })),
        }
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    /// Run `operation` under `key`, or join the execution already in flight.
    ///
    /// A joining caller observes exactly the original caller's outcome and
    /// `operation` is not invoked. A fresh execution first waits out whatever
    /// remains of the key's minimum spacing.
    pub async fn execute<F, Fut>(&self, key: impl Into<String>, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();
        let result = {
            let mut state = lock(&self.state);
            if let Some(flight) = state.in_flight.get_mut(&key) {
                flight.waiters += 1;
                tracing::debug!(key = %key, waiters = flight.waiters, "joining in-flight request");
                flight.result.clone()
            } else {
                let wait = state
                    .last_execution
                    .get(&key)
                    .map(|last| (*last + self.config.min_interval()).saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::ZERO);

                state.next_id += 1;
                let id = state.next_id;
                let result = run_operation(Arc::clone(&self.state), key.clone(), id, wait, operation)
                    .boxed()
                    .shared();

                state.in_flight.insert(
                    key,
                    InFlight {
                        id,
                        result: result.clone(),
                        started_at: Instant::now(),
                        waiters: 1,
                    },
                );
                tokio::spawn(result.clone().map(|_| ()));
                result
            }
        };
        result.await
    }

    /// Drop all bookkeeping for `key`.
    ///
    /// An operation already running is not interrupted and its current callers
    /// still receive its outcome, but the next `execute` starts afresh and
    /// without throttling.
    pub fn cancel(&self, key: &str) {
        let mut state = lock(&self.state);
        state.in_flight.remove(key);
        state.last_execution.remove(key);
    }

    /// Reset all state.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.in_flight.clear();
        state.last_execution.clear();
    }

    /// Returns `true` if an operation is in flight for `key`.
    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.state).in_flight.contains_key(key)
    }

    /// How long the operation in flight for `key` has been running.
    pub fn in_flight_age(&self, key: &str) -> Option<Duration> {
        lock(&self.state)
            .in_flight
            .get(key)
            .map(|f| f.started_at.elapsed())
    }

    pub fn stats(&self) -> CoalescerStats {
        let state = lock(&self.state);
        CoalescerStats {
            queue_depth: state.in_flight.values().map(|f| f.waiters).sum(),
            in_flight: state.in_flight.len(),
            last_execution_age: state
                .last_execution
                .iter()
                .map(|(k, at)| (k.clone(), at.elapsed()))
                .collect(),
        }
    }
}

async fn run_operation<T, E, F, Fut>(
    state: Arc<Mutex<CoalescerState<T, E>>>,
    key: String,
    id: u64,
    wait: Duration,
    operation: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    if !wait.is_zero() {
        tracing::debug!(key = %key, wait_ms = wait.as_millis() as u64, "throttled, waiting");
        tokio::time::sleep(wait).await;
    }

    let dispatched_at = Instant::now();
    let outcome = AssertUnwindSafe(async move { operation().await })
        .catch_unwind()
        .await;

    {
        let mut state = lock(&state);
        // A cancelled or cleared slot may already have been replaced by a newer call.
        if state.in_flight.get(&key).is_some_and(|f| f.id == id) {
            state.in_flight.remove(&key);
            if matches!(outcome, Ok(Ok(_))) {
                state.last_execution.insert(key.clone(), dispatched_at);
            }
        }
    }

    match outcome {
        Ok(result) => result,
        Err(payload) => {
            // The slot is already free; only callers joined to this execution see the panic.
            tracing::error!(key = %key, "coalesced operation panicked");
            panic::resume_unwind(payload)
        }
    }
}
