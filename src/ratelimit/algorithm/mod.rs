//! Rate limiting algorithms.
//!
//! An algorithm owns the layout of its state in the [`Store`] and turns one
//! admission request into a [`Decision`]. Stateful algorithms persist JSON
//! state and update it through a compare-and-swap loop, so concurrent
//! checks on one key never admit more than the limit, whichever store backs
//! them.

mod fixed_window;
mod sliding_window;
mod token_bucket;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::decision::Decision;
use super::rate::RateLimit;
use crate::clock::Clock;
use crate::error::{FloodgateError, Result};
use crate::store::Store;

pub use self::fixed_window::FixedWindow;
pub use self::sliding_window::SlidingWindow;
pub use self::token_bucket::TokenBucket;

/// Upper bound on compare-and-swap attempts for a single check.
const MAX_CAS_ATTEMPTS: usize = 1000;

/// An admission algorithm.
#[async_trait]
pub trait Algorithm: Send + Sync {
    /// Stable algorithm name, reported in decisions and stats.
    fn name(&self) -> &'static str;

    /// Try to consume `n` units of `rate` for `key`.
    ///
    /// Store failures propagate unchanged; they never turn into an allow
    /// or a deny.
    async fn allow(&self, store: &dyn Store, key: &str, rate: &RateLimit, n: u64)
        -> Result<Decision>;

    /// Forget all state for `key`. Resetting an unknown key succeeds.
    async fn reset(&self, store: &dyn Store, key: &str, _rate: &RateLimit) -> Result<()> {
        store.delete(key).await
    }

    /// Introspection capability, if this algorithm supports it.
    fn as_inspectable(&self) -> Option<&dyn Inspectable> {
        None
    }
}

/// Read-only view into an algorithm's persisted state.
#[async_trait]
pub trait Inspectable: Send + Sync {
    /// Snapshot of the state for `key` as of now, or `None` if no state is
    /// stored.
    async fn inspect(
        &self,
        store: &dyn Store,
        key: &str,
        rate: &RateLimit,
    ) -> Result<Option<StateSnapshot>>;
}

/// Point-in-time view of an algorithm's state for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum StateSnapshot {
    TokenBucket {
        /// Tokens available now, after refill
        tokens: f64,
        capacity: u64,
        last_refill: DateTime<Utc>,
    },
    SlidingWindow {
        current_count: u64,
        previous_count: u64,
        /// Start of the bucket holding `current_count`
        window_start: DateTime<Utc>,
        /// Weighted request count at the time of inspection
        effective_count: f64,
    },
}

/// The algorithms an engine can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::TokenBucket => token_bucket::NAME,
            AlgorithmKind::SlidingWindow => sliding_window::NAME,
            AlgorithmKind::FixedWindow => fixed_window::NAME,
        }
    }

    /// Instantiate the algorithm with the given clock.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Arc<dyn Algorithm> {
        match self {
            AlgorithmKind::TokenBucket => Arc::new(TokenBucket::new(clock)),
            AlgorithmKind::SlidingWindow => Arc::new(SlidingWindow::new(clock)),
            AlgorithmKind::FixedWindow => Arc::new(FixedWindow::new(clock)),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" => Ok(AlgorithmKind::TokenBucket),
            "sliding_window" => Ok(AlgorithmKind::SlidingWindow),
            "fixed_window" => Ok(AlgorithmKind::FixedWindow),
            other => Err(FloodgateError::Config(format!(
                "unknown algorithm '{}' (expected token_bucket, sliding_window or fixed_window)",
                other
            ))),
        }
    }
}

/// Read-modify-write `key` until the compare-and-swap lands.
///
/// `step` receives the decoded current state (or `None`) and returns the
/// state to persist plus the decision to report. It is re-run on every
/// conflict, so it must read the clock itself.
async fn update_state<S, F>(store: &dyn Store, key: &str, ttl: Duration, mut step: F) -> Result<Decision>
where
    S: Serialize + DeserializeOwned + Send,
    F: FnMut(Option<S>) -> (S, Decision) + Send,
{
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let current = store.get(key).await?;
        let state = match &current {
            Some(bytes) => Some(serde_json::from_slice::<S>(bytes)?),
            None => None,
        };

        let (next, decision) = step(state);
        let encoded = serde_json::to_vec(&next)?;

        if store
            .compare_and_swap(key, current.as_deref(), &encoded, ttl)
            .await?
        {
            return Ok(decision);
        }

        trace!(key = %key, attempt, "Concurrent state update, retrying");
        tokio::task::yield_now().await;
    }

    Err(FloodgateError::Algorithm(format!(
        "gave up updating '{}' after {} conflicting writes",
        key, MAX_CAS_ATTEMPTS
    )))
}

/// Load and decode the state for `key` without modifying it.
async fn load_state<S: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<S>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Decision for a limit that admits nothing.
fn blocked(algorithm: &'static str, rate: &RateLimit, now: DateTime<Utc>) -> Decision {
    Decision::deny(algorithm, 0, 0, rate.window, rate.window, after(now, rate.window))
}

/// `now + duration`, saturating at the maximum representable time.
fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert fractional seconds to a duration, saturating on overflow.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// A retry delay rounded up to whole milliseconds, never zero.
fn retry_delay(secs: f64) -> Duration {
    let millis = (secs * 1000.0).ceil();
    if !millis.is_finite() || millis >= u64::MAX as f64 {
        return Duration::MAX;
    }
    Duration::from_millis((millis as u64).max(1))
}

/// Microseconds since the Unix epoch to a timestamp.
fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Window length in microseconds, at least one.
fn window_micros(window: Duration) -> i64 {
    i64::try_from(window.as_micros()).unwrap_or(i64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("token_bucket".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::TokenBucket);
        assert_eq!("Sliding-Window".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::SlidingWindow);
        assert_eq!("fixed_window".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::FixedWindow);
        assert!("leaky_bucket".parse::<AlgorithmKind>().is_err());
    }

    #[test]
    fn test_kind_serde_names() {
        let kind: AlgorithmKind = serde_yaml::from_str("sliding_window").unwrap();
        assert_eq!(kind, AlgorithmKind::SlidingWindow);
        assert_eq!(AlgorithmKind::default(), AlgorithmKind::TokenBucket);
    }

    #[test]
    fn test_built_algorithm_reports_kind_name() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        for kind in [
            AlgorithmKind::TokenBucket,
            AlgorithmKind::SlidingWindow,
            AlgorithmKind::FixedWindow,
        ] {
            assert_eq!(kind.build(clock.clone()).name(), kind.as_str());
        }
    }

    #[test]
    fn test_only_stateful_algorithms_are_inspectable() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        assert!(AlgorithmKind::TokenBucket.build(clock.clone()).as_inspectable().is_some());
        assert!(AlgorithmKind::SlidingWindow.build(clock.clone()).as_inspectable().is_some());
        assert!(AlgorithmKind::FixedWindow.build(clock).as_inspectable().is_none());
    }

    #[test]
    fn test_retry_delay_rounds_up_to_millis() {
        assert_eq!(retry_delay(0.0), Duration::from_millis(1));
        assert_eq!(retry_delay(0.0101), Duration::from_millis(11));
        assert_eq!(retry_delay(2.0), Duration::from_millis(2000));
        assert_eq!(retry_delay(f64::INFINITY), Duration::MAX);
    }

    #[tokio::test]
    async fn test_zero_request_limit_blocks_everything() {
        let store = MemoryStore::default();
        let rate = RateLimit::per_minute(0);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());

        for kind in [
            AlgorithmKind::TokenBucket,
            AlgorithmKind::SlidingWindow,
            AlgorithmKind::FixedWindow,
        ] {
            let decision = kind.build(clock.clone()).allow(&store, "k", &rate, 1).await.unwrap();
            assert!(!decision.allowed, "{} admitted a zero limit", kind);
            assert_eq!(decision.remaining, 0);
            assert_eq!(decision.retry_after, Duration::from_secs(60));
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_algorithm_error() {
        let store = MemoryStore::default();
        store.set("k", b"not json", Duration::from_secs(60)).await.unwrap();

        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let err = AlgorithmKind::TokenBucket
            .build(clock)
            .allow(&store, "k", &RateLimit::per_second(5), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Algorithm);
    }
}
