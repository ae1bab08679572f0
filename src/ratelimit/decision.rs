//! The outcome of a single admission check.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::rate::duration_serde;

/// Name reported by decisions that did not consult any algorithm.
pub const UNLIMITED: &str = "unlimited";

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_USED: &str = "X-RateLimit-Used";
/// Unix time, in seconds, at which the quota is fully restored.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Result of one admission check.
///
/// `remaining` is always `limit - used` (saturating) and `retry_after` is
/// zero whenever the request was allowed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Effective capacity that was enforced
    pub limit: u64,
    /// Units consumed in the current window or bucket
    pub used: u64,
    /// Units still available
    pub remaining: u64,
    /// Window the limit applies to
    #[serde(with = "duration_serde")]
    pub window: Duration,
    /// How long to wait before retrying a denied request
    #[serde(with = "duration_serde")]
    pub retry_after: Duration,
    /// When the quota is fully restored
    pub reset_time: DateTime<Utc>,
    /// Algorithm that made the decision
    pub algorithm: &'static str,
}

impl Decision {
    /// An admitted request.
    pub(crate) fn allow(
        algorithm: &'static str,
        limit: u64,
        remaining: u64,
        window: Duration,
        reset_time: DateTime<Utc>,
    ) -> Self {
        let remaining = remaining.min(limit);
        Self {
            allowed: true,
            limit,
            used: limit - remaining,
            remaining,
            window,
            retry_after: Duration::ZERO,
            reset_time,
            algorithm,
        }
    }

    /// A rejected request.
    pub(crate) fn deny(
        algorithm: &'static str,
        limit: u64,
        remaining: u64,
        window: Duration,
        retry_after: Duration,
        reset_time: DateTime<Utc>,
    ) -> Self {
        let remaining = remaining.min(limit);
        Self {
            allowed: false,
            limit,
            used: limit - remaining,
            remaining,
            window,
            retry_after,
            reset_time,
            algorithm,
        }
    }

    /// The decision returned by a disabled engine.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            used: 0,
            remaining: u64::MAX,
            window: Duration::ZERO,
            retry_after: Duration::ZERO,
            reset_time: Utc::now(),
            algorithm: UNLIMITED,
        }
    }

    /// Whether this is the sentinel returned by a disabled engine.
    pub fn is_unlimited(&self) -> bool {
        self.algorithm == UNLIMITED
    }

    /// Standard rate limit response headers for this decision.
    ///
    /// `Retry-After` is only present on denials and is rounded up to whole
    /// seconds. The unlimited sentinel produces no headers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.is_unlimited() {
            return Vec::new();
        }

        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_USED, self.used.to_string()),
            (HEADER_RESET, self.reset_time.timestamp().to_string()),
        ];
        if !self.allowed {
            let mut secs = self.retry_after.as_secs();
            if self.retry_after.subsec_nanos() > 0 {
                secs += 1;
            }
            headers.push((HEADER_RETRY_AFTER, secs.max(1).to_string()));
        }
        headers
    }
}
