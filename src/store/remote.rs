//! Redis-backed store.
//!
//! Lets several processes share rate limiting state. Read-modify-write
//! operations run as Lua scripts so each one is a single atomic step on the
//! server:
//!
//! - `increment_by`: `INCRBY`, then `PEXPIRE` only if the key has no expiry
//!   yet. Setting the expiry in a second round trip would leave a window in
//!   which a concurrent reader sees a counter that never expires.
//! - `compare_and_swap`: `GET`, compare, `SET ... PX`.
//!
//! Every call is bounded by the configured timeout.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisResult, Script,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Store;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::duration_serde;

const DEFAULT_PORT: u16 = 6379;

/// Lua script for atomic INCRBY + conditional PEXPIRE.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// Lua script for compare-and-swap. `ARGV[1]` is `1` when a current value
/// is expected (given in `ARGV[2]`) and `0` when the key must be absent.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// Configuration for [`RedisStore`].
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Server address as `host:port`
    #[serde(default = "default_address")]
    pub address: String,

    /// ACL username
    #[serde(default)]
    pub username: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub database: i64,

    /// Number of multiplexed connections to spread commands over
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Deadline for connecting and for every command
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// TTL applied when callers pass a zero TTL
    #[serde(default = "default_ttl", with = "duration_serde")]
    pub default_ttl: Duration,
}

impl fmt::Debug for RedisStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStoreConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("pool_size", &self.pool_size)
            .field("timeout", &self.timeout)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            username: None,
            password: None,
            database: 0,
            pool_size: default_pool_size(),
            timeout: default_timeout(),
            default_ttl: default_ttl(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl RedisStoreConfig {
    /// Connection settings for the client.
    ///
    /// Credentials are passed as-is rather than through a URL, so they may
    /// contain any character.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let (host, port) = split_address(&self.address)?;
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: self.database,
                username: self.username.clone(),
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        })
    }

    /// Check the settings without connecting.
    pub fn validate(&self) -> Result<()> {
        split_address(&self.address)?;
        if self.pool_size == 0 {
            return Err(FloodgateError::Config(
                "redis pool_size must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(FloodgateError::Config(
                "redis timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Split `host:port` (or `[v6]:port`), defaulting the port to 6379.
fn split_address(address: &str) -> Result<(String, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return Err(FloodgateError::Config("redis address is empty".to_string()));
    }

    let (host, port) = match address.strip_prefix('[') {
        Some(rest) => match rest.split_once(']') {
            Some((host, "")) => (host, None),
            Some((host, port)) => match port.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(invalid_address(address)),
            },
            None => return Err(invalid_address(address)),
        },
        None => match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            Some(_) => return Err(invalid_address(address)),
            None => (address, None),
        },
    };

    if host.is_empty() {
        return Err(invalid_address(address));
    }
    let port = match port {
        Some(port) => port.parse().map_err(|_| invalid_address(address))?,
        None => DEFAULT_PORT,
    };
    Ok((host.to_string(), port))
}

fn invalid_address(address: &str) -> FloodgateError {
    FloodgateError::Config(format!(
        "redis address '{}' must be host:port or [ipv6]:port",
        address
    ))
}

/// Convert a TTL to whole milliseconds, at least one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis implementation of [`Store`].
pub struct RedisStore {
    pool: Vec<ConnectionManager>,
    next: AtomicUsize,
    config: RedisStoreConfig,
    increment_script: Script,
    compare_and_swap_script: Script,
    closed: AtomicBool,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and open the connection pool.
    ///
    /// # Errors
    /// Returns a configuration error for invalid settings, and a
    /// connectivity or timeout error if the server cannot be reached.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.connection_info()?)?;

        let mut pool = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let manager = tokio::time::timeout(config.timeout, ConnectionManager::new(client.clone()))
                .await
                .map_err(|_| FloodgateError::StoreTimeout {
                    operation: "connect",
                    timeout: config.timeout,
                })??;
            pool.push(manager);
        }

        info!(
            address = %config.address,
            database = config.database,
            pool_size = config.pool_size,
            "Connected to Redis store"
        );

        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
            config,
            increment_script: Script::new(INCREMENT_SCRIPT),
            compare_and_swap_script: Script::new(COMPARE_AND_SWAP_SCRIPT),
            closed: AtomicBool::new(false),
        })
    }

    /// The store configuration.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// Pick the next pooled connection.
    fn connection(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FloodgateError::Closed("redis store"));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        Ok(self.pool[index].clone())
    }

    fn ttl(&self, ttl: Duration) -> u64 {
        if ttl.is_zero() {
            ttl_millis(self.config.default_ttl)
        } else {
            ttl_millis(ttl)
        }
    }

    /// Run a command under the configured deadline.
    async fn run<T, F>(&self, operation: &'static str, command: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout, command).await {
            Ok(result) => result.map_err(|e| {
                debug!(operation, error = %e, "Redis command failed");
                match FloodgateError::from(e) {
                    FloodgateError::StoreTimeout { .. } => FloodgateError::StoreTimeout {
                        operation,
                        timeout: self.config.timeout,
                    },
                    other => other,
                }
            }),
            Err(_) => Err(FloodgateError::StoreTimeout {
                operation,
                timeout: self.config.timeout,
            }),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection()?;
        self.run("get", async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        let millis = self.ttl(ttl);
        self.run("set", async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn increment_by(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection()?;
        let millis = self.ttl(ttl);
        let script = &self.increment_script;
        self.run("increment_by", async move {
            script
                .key(key)
                .arg(amount)
                .arg(millis)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection()?;
        let millis = self.ttl(ttl);
        let script = &self.compare_and_swap_script;
        let (has_expected, expected) = match expected {
            Some(bytes) => ("1", bytes),
            None => ("0", &b""[..]),
        };

        let swapped: i64 = self
            .run("compare_and_swap", async move {
                script
                    .key(key)
                    .arg(has_expected)
                    .arg(expected)
                    .arg(value)
                    .arg(millis)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        self.run("delete", async move { conn.del(key).await }).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        self.run("exists", async move { conn.exists(key).await }).await
    }

    async fn health(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let reply: String = self
            .run("ping", async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        if reply != "PONG" {
            return Err(FloodgateError::StoreConnectivity(format!(
                "unexpected PING reply '{}'",
                reply
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(address = %self.config.address, "Redis store closed");
        }
        Ok(())
    }
}
