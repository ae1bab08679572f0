//! Rate limit values and the human-authored rate string format.
//!
//! Limits are written as `"<requests>/<duration>"`, for example `"100/1h"`
//! or `"5/30s"`. The duration may be a single number with a unit suffix, a
//! compound string such as `"1h30m"`, or a unit word (`"minute"`).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A quota of `requests` per `window`.
///
/// `burst` is only consulted by the token bucket; zero means "same as
/// `requests`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RateLimitRepr", into = "RateLimitRepr")]
pub struct RateLimit {
    /// Steady-state requests allowed per window
    pub requests: u64,
    /// Length of the window
    pub window: Duration,
    /// Maximum instantaneous capacity (0 = `requests`)
    pub burst: u64,
}

impl RateLimit {
    /// Create a limit without an explicit burst.
    pub fn new(requests: u64, window: Duration) -> Self {
        Self {
            requests,
            window,
            burst: 0,
        }
    }

    pub fn per_second(requests: u64) -> Self {
        Self::new(requests, Duration::from_secs(1))
    }

    pub fn per_minute(requests: u64) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    pub fn per_hour(requests: u64) -> Self {
        Self::new(requests, Duration::from_secs(3600))
    }

    pub fn per_day(requests: u64) -> Self {
        Self::new(requests, Duration::from_secs(86400))
    }

    /// Set the burst capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Effective bucket capacity: the burst, or `requests` when unset.
    pub fn capacity(&self) -> u64 {
        if self.burst == 0 {
            self.requests
        } else {
            self.burst
        }
    }

    /// Steady-state refill rate in units per second.
    pub fn per_second_rate(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.requests as f64 / secs
    }

    /// Check the invariants a limit must satisfy to be usable.
    pub fn validate(&self) -> Result<()> {
        if self.requests > 0 && self.window.is_zero() {
            return Err(FloodgateError::Config(format!(
                "rate limit of {} requests has a zero window",
                self.requests
            )));
        }
        if self.burst != 0 && self.burst < self.requests {
            return Err(FloodgateError::Config(format!(
                "burst {} is smaller than the steady-state quota {}",
                self.burst, self.requests
            )));
        }
        Ok(())
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.requests, format_duration(self.window))
    }
}

impl FromStr for RateLimit {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        parse_rate(s)
    }
}

/// Parse a `"<requests>/<duration>"` rate string.
pub fn parse_rate(input: &str) -> Result<RateLimit> {
    let (requests, window) = input.trim().split_once('/').ok_or_else(|| {
        FloodgateError::Config(format!(
            "invalid rate '{}': expected '<requests>/<duration>'",
            input
        ))
    })?;

    let requests: u64 = requests.trim().parse().map_err(|_| {
        FloodgateError::Config(format!(
            "invalid rate '{}': '{}' is not a request count",
            input,
            requests.trim()
        ))
    })?;

    let window = parse_duration(window)
        .map_err(|e| FloodgateError::Config(format!("invalid rate '{}': {}", input, e)))?;

    let limit = RateLimit::new(requests, window);
    limit.validate()?;
    Ok(limit)
}

fn unit_word(word: &str) -> Option<Duration> {
    match word {
        "second" | "sec" => Some(Duration::from_secs(1)),
        "minute" | "min" => Some(Duration::from_secs(60)),
        "hour" => Some(Duration::from_secs(3600)),
        "day" => Some(Duration::from_secs(86400)),
        "week" => Some(Duration::from_secs(604_800)),
        _ => None,
    }
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(60 * NANOS_PER_SEC),
        "h" => Some(3600 * NANOS_PER_SEC),
        "d" => Some(86400 * NANOS_PER_SEC),
        "w" => Some(604_800 * NANOS_PER_SEC),
        _ => None,
    }
}

/// Parse a duration such as `"30s"`, `"1h30m"`, `"1.5h"` or `"minute"`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(FloodgateError::Config("empty duration".to_string()));
    }
    if let Some(duration) = unit_word(s) {
        return Ok(duration);
    }

    let invalid = |reason: &str| FloodgateError::Config(format!("invalid duration '{}': {}", s, reason));

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if number_end == 0 {
            return Err(invalid("expected a number"));
        }
        let (number, tail) = rest.split_at(number_end);

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);
        let nanos_per_unit = unit_nanos(unit).ok_or_else(|| invalid("unknown unit"))?;

        let nanos = if number.contains('.') {
            let value: f64 = number.parse().map_err(|_| invalid("bad number"))?;
            (value * nanos_per_unit as f64).round() as u128
        } else {
            let value: u128 = number.parse().map_err(|_| invalid("bad number"))?;
            value
                .checked_mul(nanos_per_unit)
                .ok_or_else(|| invalid("overflow"))?
        };
        total = total.checked_add(nanos).ok_or_else(|| invalid("overflow"))?;
        rest = next;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| invalid("overflow"))?;
    Ok(Duration::new(secs, (total % NANOS_PER_SEC) as u32))
}

/// Render a duration in the most compact unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [
        ("w", 604_800 * NANOS_PER_SEC),
        ("d", 86400 * NANOS_PER_SEC),
        ("h", 3600 * NANOS_PER_SEC),
        ("m", 60 * NANOS_PER_SEC),
        ("s", NANOS_PER_SEC),
        ("ms", 1_000_000),
        ("us", 1_000),
    ] {
        if nanos % size == 0 {
            return format!("{}{}", nanos / size, unit);
        }
    }
    format!("{}ns", nanos)
}

/// On-disk forms of a [`RateLimit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RateLimitRepr {
    Short(String),
    Full {
        requests: u64,
        #[serde(with = "duration_serde")]
        window: Duration,
        #[serde(default)]
        burst: u64,
    },
}

impl TryFrom<RateLimitRepr> for RateLimit {
    type Error = FloodgateError;

    fn try_from(repr: RateLimitRepr) -> Result<Self> {
        let limit = match repr {
            RateLimitRepr::Short(s) => parse_rate(&s)?,
            RateLimitRepr::Full {
                requests,
                window,
                burst,
            } => RateLimit {
                requests,
                window,
                burst,
            },
        };
        limit.validate()?;
        Ok(limit)
    }
}

impl From<RateLimit> for RateLimitRepr {
    fn from(limit: RateLimit) -> Self {
        if limit.burst == 0 {
            RateLimitRepr::Short(limit.to_string())
        } else {
            RateLimitRepr::Full {
                requests: limit.requests,
                window: limit.window,
                burst: limit.burst,
            }
        }
    }
}

/// Serde adapter for durations written as strings (`"30s"`) or whole seconds.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationRepr {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match DurationRepr::deserialize(deserializer)? {
            DurationRepr::Seconds(secs) => Ok(Duration::from_secs(secs)),
            DurationRepr::Text(text) => {
                super::parse_duration(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}
