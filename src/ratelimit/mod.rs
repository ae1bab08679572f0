//! Rate limiting logic and state management.

pub mod algorithm;
mod decision;
mod entity;
mod key;
mod rate;
mod rules;

pub use algorithm::{
    Algorithm, AlgorithmKind, FixedWindow, Inspectable, SlidingWindow, StateSnapshot, TokenBucket,
};
pub use decision::{
    Decision, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER, HEADER_USED,
    UNLIMITED,
};
pub use entity::{Entity, EntityKind};
pub use key::KeyBuilder;
pub use rate::{duration_serde, format_duration, parse_duration, parse_rate, RateLimit};
pub use rules::{
    EntityOverride, LimitSource, LimitsConfig, Resolution, TierLimits, GLOBAL_SCOPE,
};
