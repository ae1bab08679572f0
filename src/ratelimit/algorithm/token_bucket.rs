//! Token bucket.
//!
//! The bucket holds up to `burst` tokens (or `requests` when no burst is
//! set) and refills continuously at `requests / window`. A request for `n`
//! units succeeds when at least `n` tokens are available.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    after, blocked, from_micros, load_state, retry_delay, seconds, update_state, Algorithm,
    Inspectable, StateSnapshot,
};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::decision::Decision;
use crate::ratelimit::rate::RateLimit;
use crate::store::Store;

pub(super) const NAME: &str = "token_bucket";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill_us: i64,
}

impl BucketState {
    /// Tokens available at `now_us`. A missing bucket starts full.
    fn refilled(state: Option<BucketState>, capacity: f64, per_second: f64, now_us: i64) -> f64 {
        match state {
            None => capacity,
            Some(state) => {
                let elapsed = now_us.saturating_sub(state.last_refill_us).max(0) as f64 / 1e6;
                (state.tokens + elapsed * per_second).min(capacity)
            }
        }
    }
}

/// Token bucket algorithm.
pub struct TokenBucket {
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// How long an idle bucket must live before it is full again anyway.
fn state_ttl(capacity: f64, per_second: f64) -> Duration {
    seconds(capacity / per_second).max(Duration::from_secs(1))
}

#[async_trait]
impl Algorithm for TokenBucket {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn allow(
        &self,
        store: &dyn Store,
        key: &str,
        rate: &RateLimit,
        n: u64,
    ) -> Result<Decision> {
        rate.validate()?;
        if rate.requests == 0 {
            return Ok(blocked(NAME, rate, self.clock.now()));
        }

        let capacity = rate.capacity();
        let full = capacity as f64;
        let per_second = rate.per_second_rate();
        let needed = n as f64;
        let clock = &self.clock;

        let ttl = state_ttl(full, per_second);

        let decision = update_state(store, key, ttl, |state: Option<BucketState>| {
            let now = clock.now();
            let now_us = now.timestamp_micros();
            let tokens = BucketState::refilled(state, full, per_second, now_us);

            if tokens >= needed {
                let left = tokens - needed;
                let reset = after(now, seconds((full - left) / per_second));
                let decision =
                    Decision::allow(NAME, capacity, left.floor() as u64, rate.window, reset);
                let next = BucketState {
                    tokens: left,
                    last_refill_us: now_us,
                };
                (next, decision)
            } else {
                let wait = retry_delay((needed - tokens) / per_second);
                let reset = after(now, seconds((full - tokens) / per_second));
                let decision = Decision::deny(
                    NAME,
                    capacity,
                    tokens.floor() as u64,
                    rate.window,
                    wait,
                    reset,
                );
                let next = BucketState {
                    tokens,
                    last_refill_us: now_us,
                };
                (next, decision)
            }
        })
        .await?;

        if !decision.allowed {
            debug!(
                key = %key,
                requested = n,
                remaining = decision.remaining,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Token bucket exhausted"
            );
        }
        Ok(decision)
    }

    fn as_inspectable(&self) -> Option<&dyn Inspectable> {
        Some(self)
    }
}

#[async_trait]
impl Inspectable for TokenBucket {
    async fn inspect(
        &self,
        store: &dyn Store,
        key: &str,
        rate: &RateLimit,
    ) -> Result<Option<StateSnapshot>> {
        let Some(state) = load_state::<BucketState>(store, key).await? else {
            return Ok(None);
        };

        let capacity = rate.capacity();
        let now_us = self.clock.now().timestamp_micros();
        let tokens =
            BucketState::refilled(Some(state), capacity as f64, rate.per_second_rate(), now_us);

        Ok(Some(StateSnapshot::TokenBucket {
            tokens,
            capacity,
            last_refill: from_micros(state.last_refill_us),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Utc};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_699_999_980, 0).unwrap()
    }

    fn bucket() -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new(start());
        (TokenBucket::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_burst_then_deny() {
        let (bucket, _clock) = bucket();
        let store = MemoryStore::default();
        let rate = RateLimit::per_second(5);

        for expected in [4, 3, 2, 1, 0] {
            let decision = bucket.allow(&store, "k", &rate, 1).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.used, 5 - expected);
            assert_eq!(decision.limit, 5);
        }

        let denied = bucket.allow(&store, "k", &rate, 1).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after > Duration::ZERO);
        assert_eq!(denied.retry_after, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let (bucket, clock) = bucket();
        let store = MemoryStore::default();
        let rate = RateLimit::per_second(5);

        for _ in 0..5 {
            assert!(bucket.allow(&store, "k", &rate, 1).await.unwrap().allowed);
        }
        assert!(!bucket.allow(&store, "k", &rate, 1).await.unwrap().allowed);

        clock.advance(Duration::from_millis(450));
        let decision = bucket.allow(&store, "k", &rate, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);

        clock.advance(Duration::from_secs(10));
        let decision = bucket.allow(&store, "k", &rate, 1).await.unwrap();
        assert_eq!(decision.remaining, 4, "refill must cap at capacity");
    }

    #[tokio::test]
    async fn test_burst_above_requests() {
        let (bucket, clock) = bucket();
        let store = MemoryStore::default();
        let rate = RateLimit::per_second(1).with_burst(10);

        let decision = bucket.allow(&store, "k", &rate, 10).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.remaining, 0);

        let denied = bucket.allow(&store, "k", &rate, 2).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(2));
        assert_eq!(denied.reset_time, start() + chrono::Duration::seconds(10));

        clock.advance(Duration::from_secs(2));
        assert!(bucket.allow(&store, "k", &rate, 2).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_cost_larger_than_available_is_not_partially_consumed() {
        let (bucket, _clock) = bucket();
        let store = MemoryStore::default();
        let rate = RateLimit::per_second(5);

        assert!(bucket.allow(&store, "k", &rate, 3).await.unwrap().allowed);
        assert!(!bucket.allow(&store, "k", &rate, 3).await.unwrap().allowed);

        let decision = bucket.allow(&store, "k", &rate, 2).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_restores_full_bucket() {
        let (bucket, _clock) = bucket();
        let store = MemoryStore::default();
        let rate = RateLimit::per_second(2);

        bucket.allow(&store, "k", &rate, 2).await.unwrap();
        bucket.reset(&store, "k", &rate).await.unwrap();
        bucket.reset(&store, "k", &rate).await.unwrap();

        let decision = bucket.allow(&store, "k", &rate, 1).await.unwrap();
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (bucket, _clock) = bucket();
        let store = MemoryStore::default();
        let rate = RateLimit::per_second(1);

        assert!(bucket.allow(&store, "a", &rate, 1).await.unwrap().allowed);
        assert!(!bucket.allow(&store, "a", &rate, 1).await.unwrap().allowed);
        assert!(bucket.allow(&store, "b", &rate, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_inspect() {
        let (bucket, clock) = bucket();
        let store = MemoryStore::default();
        let rate = RateLimit::per_second(4);

        let inspect = bucket.as_inspectable().unwrap();
        assert_eq!(inspect.inspect(&store, "k", &rate).await.unwrap(), None);

        bucket.allow(&store, "k", &rate, 4).await.unwrap();
        clock.advance(Duration::from_millis(500));

        match inspect.inspect(&store, "k", &rate).await.unwrap() {
            Some(StateSnapshot::TokenBucket {
                tokens,
                capacity,
                last_refill,
            }) => {
                assert!((tokens - 2.0).abs() < 1e-9);
                assert_eq!(capacity, 4);
                assert_eq!(last_refill, start());
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[test]
    fn test_state_ttl_covers_full_refill() {
        assert_eq!(state_ttl(10.0, 1.0), Duration::from_secs(10));
        assert_eq!(state_ttl(5.0, 100.0), Duration::from_secs(1));
    }
}
