//! Key-value storage backends for rate limiting state.
//!
//! Every backend implements the same [`Store`] contract so algorithms can
//! run unchanged against process-local memory or a shared Redis server.

mod memory;
mod remote;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::{EvictionPolicy, MemoryStore, MemoryStoreConfig};
pub use self::remote::{RedisStore, RedisStoreConfig};

/// Storage contract shared by all backends.
///
/// A `ttl` of [`Duration::ZERO`] means "use the backend's default TTL";
/// stored values always expire eventually.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for logs and stats.
    fn name(&self) -> &'static str;

    /// Read a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditionally write a value.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically add `amount` to an integer value and return the result.
    ///
    /// An absent key starts from zero and receives `ttl`. An existing key
    /// keeps its current expiry.
    async fn increment_by(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64>;

    /// Atomically replace the value if it currently equals `expected`.
    ///
    /// `expected = None` means the key must be absent (or expired). Returns
    /// whether the swap happened. A successful swap applies `ttl`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;

    /// Remove a key. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a live value exists for the key.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Check that the backend is usable.
    async fn health(&self) -> Result<()>;

    /// Release resources. Further operations fail; closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}
