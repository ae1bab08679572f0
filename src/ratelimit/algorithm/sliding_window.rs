//! Sliding window counter.
//!
//! Approximates a true sliding log with two fixed buckets aligned to the
//! Unix epoch. The previous bucket's count is weighted by how much of it
//! still overlaps the sliding window:
//!
//! ```text
//! effective = previous * (1 - elapsed / window) + current
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    blocked, from_micros, load_state, retry_delay, update_state, window_micros, Algorithm,
    Inspectable, StateSnapshot,
};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::decision::Decision;
use crate::ratelimit::rate::RateLimit;
use crate::store::Store;

pub(super) const NAME: &str = "sliding_window";

/// Slack for float noise when comparing weighted counts.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WindowState {
    current_count: u64,
    current_window_start_us: i64,
    previous_count: u64,
}

impl WindowState {
    /// Roll `state` forward to the bucket containing `now_us`.
    fn rolled(state: Option<WindowState>, now_us: i64, window_us: i64) -> WindowState {
        let start = now_us - now_us.rem_euclid(window_us);
        match state {
            // Same bucket, or a clock that stepped backwards.
            Some(state) if state.current_window_start_us >= start => state,
            Some(state) if state.current_window_start_us == start.saturating_sub(window_us) => {
                WindowState {
                    current_count: 0,
                    current_window_start_us: start,
                    previous_count: state.current_count,
                }
            }
            _ => WindowState {
                current_count: 0,
                current_window_start_us: start,
                previous_count: 0,
            },
        }
    }

    fn elapsed_us(&self, now_us: i64, window_us: i64) -> i64 {
        now_us
            .saturating_sub(self.current_window_start_us)
            .clamp(0, window_us)
    }

    fn effective(&self, now_us: i64, window_us: i64) -> f64 {
        let fraction = self.elapsed_us(now_us, window_us) as f64 / window_us as f64;
        self.previous_count as f64 * (1.0 - fraction) + self.current_count as f64
    }

    /// Microseconds from `now_us` until `n` more units would fit.
    fn wait_us(&self, now_us: i64, window_us: i64, limit: u64, n: u64) -> f64 {
        let window = window_us as f64;
        let elapsed = self.elapsed_us(now_us, window_us) as f64;
        let (limit, n) = (limit as f64, n as f64);
        let current = self.current_count as f64;
        let previous = self.previous_count as f64;

        let headroom = limit - n - current;
        if headroom >= 0.0 && previous > 0.0 {
            // Wait for the previous bucket's share to decay.
            window * (1.0 - headroom / previous) - elapsed
        } else if headroom >= 0.0 {
            0.0
        } else if n <= limit {
            // The current bucket alone is too full: it must roll over and
            // then decay as the new previous bucket.
            (window - elapsed) + window * (1.0 - (limit - n) / current)
        } else {
            (window - elapsed) + window
        }
    }

    /// When both buckets will have decayed to nothing.
    fn reset_us(&self, now_us: i64, window_us: i64) -> i64 {
        if self.current_count > 0 {
            self.current_window_start_us.saturating_add(window_us.saturating_mul(2))
        } else if self.previous_count > 0 {
            self.current_window_start_us.saturating_add(window_us)
        } else {
            now_us
        }
    }
}

/// Whole units for a weighted count.
fn whole_units(count: f64) -> u64 {
    (count - EPSILON).ceil().max(0.0) as u64
}

/// Sliding window algorithm.
pub struct SlidingWindow {
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl Algorithm for SlidingWindow {
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

        let limit = rate.requests;
        let window_us = window_micros(rate.window);
        let ttl = rate.window.saturating_mul(2);
        let clock = &self.clock;

        let decision = update_state(store, key, ttl, |state: Option<WindowState>| {
            let now_us = clock.now().timestamp_micros();
            let mut state = WindowState::rolled(state, now_us, window_us);
            let effective = state.effective(now_us, window_us);

            if effective + n as f64 <= limit as f64 + EPSILON {
                state.current_count = state.current_count.saturating_add(n);
                let used = whole_units(effective + n as f64).min(limit);
                let decision = Decision::allow(
                    NAME,
                    limit,
                    limit - used,
                    rate.window,
                    from_micros(state.reset_us(now_us, window_us)),
                );
                (state, decision)
            } else {
                let used = whole_units(effective).min(limit);
                let wait = state.wait_us(now_us, window_us, limit, n);
                let decision = Decision::deny(
                    NAME,
                    limit,
                    limit - used,
                    rate.window,
                    retry_delay(wait.round() / 1e6),
                    from_micros(state.reset_us(now_us, window_us)),
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
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Sliding window full"
            );
        }
        Ok(decision)
    }

    fn as_inspectable(&self) -> Option<&dyn Inspectable> {
        Some(self)
    }
}

#[async_trait]
impl Inspectable for SlidingWindow {
    async fn inspect(
        &self,
        store: &dyn Store,
        key: &str,
        rate: &RateLimit,
    ) -> Result<Option<StateSnapshot>> {
        let Some(state) = load_state::<WindowState>(store, key).await? else {
            return Ok(None);
        };

        let window_us = window_micros(rate.window);
        let now_us = self.clock.now().timestamp_micros();
        let state = WindowState::rolled(Some(state), now_us, window_us);

        Ok(Some(StateSnapshot::SlidingWindow {
            current_count: state.current_count,
            previous_count: state.previous_count,
            window_start: from_micros(state.current_window_start_us),
            effective_count: state.effective(now_us, window_us),
        }))
    }
}
