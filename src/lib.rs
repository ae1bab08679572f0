//! Floodgate - Embeddable Admission Control
//!
//! This crate decides whether an entity (an API key, user, tenant or IP)
//! may spend some units of a named scope right now, and if not, when it may
//! retry. Limits come from a four-level hierarchy; counters live in a
//! pluggable store so several processes can share them through Redis.
//!
//! ```no_run
//! use floodgate::config::EngineConfig;
//! use floodgate::engine::Engine;
//! use floodgate::ratelimit::{Entity, LimitsConfig, RateLimit};
//!
//! # async fn run() -> floodgate::error::Result<()> {
//! let limits = LimitsConfig::new().with_scope_limit("upload", RateLimit::per_minute(10));
//! let engine = Engine::from_config(EngineConfig::new(limits)).await?;
//!
//! let decision = engine.check(&Entity::user("alice"), "upload", 1).await?;
//! if !decision.allowed {
//!     println!("retry in {:?}", decision.retry_after);
//! }
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use engine::{Engine, EngineStats};
pub use error::{ErrorKind, FloodgateError, Result};
