//! Fixed window counter.
//!
//! One counter per epoch-aligned window. Cheaper than the other algorithms
//! but allows up to twice the limit across a window boundary. The counter
//! only grows when a request fits, so a denied request never holds quota,
//! not even briefly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{blocked, from_micros, update_state, window_micros, Algorithm};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::decision::Decision;
use crate::ratelimit::rate::RateLimit;
use crate::store::Store;

pub(super) const NAME: &str = "fixed_window";

/// Persisted state for one window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct WindowCount {
    count: u64,
}

/// Fixed window algorithm.
pub struct FixedWindow {
    clock: Arc<dyn Clock>,
}

impl FixedWindow {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Counter key and end of the window containing `now`.
    fn window_key(key: &str, now: DateTime<Utc>, window: Duration) -> (String, DateTime<Utc>) {
        let window_us = window_micros(window);
        let now_us = now.timestamp_micros();
        let start_us = now_us - now_us.rem_euclid(window_us);
        let end = from_micros(start_us.saturating_add(window_us));
        (format!("{}:{}", key, start_us / 1000), end)
    }
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl Algorithm for FixedWindow {
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
        let now = self.clock.now();
        if rate.requests == 0 {
            return Ok(blocked(NAME, rate, now));
        }

        let limit = rate.requests;
        let (counter_key, reset_time) = Self::window_key(key, now, rate.window);
        // The counter outlives its window by at most a millisecond.
        let until_reset = (reset_time - now)
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_millis(1));

        let decision = update_state(store, &counter_key, until_reset, |state: Option<WindowCount>| {
            let state = state.unwrap_or_default();
            let next = state.count.saturating_add(n);
            if next <= limit {
                let decision = Decision::allow(NAME, limit, limit - next, rate.window, reset_time);
                (WindowCount { count: next }, decision)
            } else {
                let decision = Decision::deny(
                    NAME,
                    limit,
                    limit.saturating_sub(state.count),
                    rate.window,
                    until_reset,
                    reset_time,
                );
                (state, decision)
            }
        })
        .await?;

        if !decision.allowed {
            debug!(
                key = %key,
                requested = n,
                used = decision.used,
                limit,
                "Fixed window full"
            );
        }
        Ok(decision)
    }

    async fn reset(&self, store: &dyn Store, key: &str, rate: &RateLimit) -> Result<()> {
        let (counter_key, _) = Self::window_key(key, self.clock.now(), rate.window);
        store.delete(&counter_key).await
    }
}
