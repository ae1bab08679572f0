//! In-process store with TTL expiry and bounded size.
//!
//! All entries live in one mutex-guarded map, so every operation on a key
//! is serialized with every other. Expiry is both lazy (reads treat expired
//! entries as missing) and eager (a background task sweeps the map on a
//! fixed interval).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::Store;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::duration_serde;

/// Which entry to drop when the store is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest entry by creation time
    #[default]
    Fifo,
    /// Entry that was read or written least recently
    Lru,
}

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Maximum number of keys held (0 = unbounded)
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// How often the background sweep runs (0 = lazy expiry only)
    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub cleanup_interval: Duration,

    /// TTL applied when callers pass a zero TTL
    #[serde(default = "default_ttl", with = "duration_serde")]
    pub default_ttl: Duration,

    /// Eviction order once `max_keys` is reached
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_keys: default_max_keys(),
            cleanup_interval: default_cleanup_interval(),
            default_ttl: default_ttl(),
            eviction: EvictionPolicy::default(),
        }
    }
}

fn default_max_keys() -> usize {
    10000
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
    /// Fixed at insert, disambiguates equal expiry instants
    id: u64,
    /// Position in the eviction order
    rank: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// The entries plus the two orderings that eviction and the sweep need,
/// so neither has to scan the whole map.
#[derive(Debug)]
struct Table {
    entries: HashMap<String, Entry>,
    /// Eviction order: creation for FIFO, last access for LRU
    ranks: BTreeMap<u64, String>,
    expiries: BTreeMap<(Instant, u64), String>,
    next_rank: u64,
    max_keys: usize,
    eviction: EvictionPolicy,
}

impl Table {
    fn new(max_keys: usize, eviction: EvictionPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            ranks: BTreeMap::new(),
            expiries: BTreeMap::new(),
            next_rank: 0,
            max_keys,
            eviction,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn next_rank(&mut self) -> u64 {
        let rank = self.next_rank;
        self.next_rank += 1;
        rank
    }

    /// The entry for `key` if it is present and not expired. An expired
    /// entry is dropped.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Record an access to `key`. Only LRU ordering cares.
    fn touch(&mut self, key: &str) {
        if self.eviction != EvictionPolicy::Lru {
            return;
        }
        let rank = self.next_rank();
        if let Some(entry) = self.entries.get_mut(key) {
            self.ranks.remove(&entry.rank);
            entry.rank = rank;
            self.ranks.insert(rank, key.to_string());
        }
    }

    fn set_expiry(&mut self, key: &str, expires_at: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.expires_at != expires_at {
                self.expiries.remove(&(entry.expires_at, entry.id));
                entry.expires_at = expires_at;
                self.expiries.insert((expires_at, entry.id), key.to_string());
            }
        }
    }

    /// Insert a key that is not present, evicting one entry first if the
    /// table is full.
    fn insert(&mut self, key: &str, value: Vec<u8>, expires_at: Instant, now: Instant) {
        if self.max_keys > 0 && self.entries.len() >= self.max_keys {
            self.evict_one(now);
        }
        let id = self.next_rank();
        self.ranks.insert(id, key.to_string());
        self.expiries.insert((expires_at, id), key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                id,
                rank: id,
            },
        );
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.ranks.remove(&entry.rank);
        self.expiries.remove(&(entry.expires_at, entry.id));
        Some(entry)
    }

    /// Key of the entry that expires first, if it already has.
    fn first_expired(&self, now: Instant) -> Option<String> {
        self.expiries
            .first_key_value()
            .filter(|((expires_at, _), _)| *expires_at <= now)
            .map(|(_, key)| key.clone())
    }

    fn evict_one(&mut self, now: Instant) {
        let victim = self
            .first_expired(now)
            .or_else(|| self.ranks.first_key_value().map(|(_, key)| key.clone()));

        if let Some(key) = victim {
            self.remove(&key);
            debug!(key = %key, policy = ?self.eviction, "Evicted entry from full memory store");
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(key) = self.first_expired(now) {
            self.remove(&key);
            removed += 1;
        }
        removed
    }

    fn clear(&mut self) -> usize {
        let len = self.entries.len();
        self.entries.clear();
        self.ranks.clear();
        self.expiries.clear();
        len
    }
}

type Entries = Arc<Mutex<Table>>;

/// Background task removing expired entries.
struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn(runtime: &tokio::runtime::Handle, entries: Entries, interval: Duration) -> Self {
        let (shutdown, mut stop) = oneshot::channel();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = entries.lock().purge_expired(Instant::now());
                        if removed > 0 {
                            trace!(removed, "Swept expired entries");
                        }
                    }
                    // Fires on an explicit stop and when the store is dropped.
                    _ = &mut stop => break,
                }
            }
        });

        Self { shutdown, handle }
    }
}

fn parse_counter(key: &str, value: &[u8]) -> Result<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            FloodgateError::Algorithm(format!("value at '{}' is not an integer counter", key))
        })
}

/// Process-local implementation of [`Store`].
pub struct MemoryStore {
    entries: Entries,
    config: MemoryStoreConfig,
    sweeper: Mutex<Option<Sweeper>>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create a store. The sweep task is started when a tokio runtime is
    /// available; without one, expiry is lazy only.
    pub fn new(config: MemoryStoreConfig) -> Self {
        let entries: Entries = Arc::new(Mutex::new(Table::new(config.max_keys, config.eviction)));

        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !config.cleanup_interval.is_zero() => Some(Sweeper::spawn(
                &runtime,
                Arc::clone(&entries),
                config.cleanup_interval,
            )),
            Ok(_) => None,
            Err(_) => {
                debug!("No tokio runtime available, memory store expiry is lazy only");
                None
            }
        };

        Self {
            entries,
            config,
            sweeper: Mutex::new(sweeper),
            closed: AtomicBool::new(false),
        }
    }

    /// The store configuration.
    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    /// Number of entries currently held, including expired entries that
    /// have not been swept yet.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries now instead of waiting for the sweep.
    pub fn purge_expired(&self) -> usize {
        self.entries.lock().purge_expired(Instant::now())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FloodgateError::Closed("memory store"));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration, now: Instant) -> Instant {
        let ttl = if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl
        };
        // Far enough out to never expire in practice.
        now.checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 86_400))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut guard = self.entries.lock();
        let table = &mut *guard;

        let value = table.live(key, now).map(|entry| entry.value.clone());
        if value.is_some() {
            table.touch(key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let now = Instant::now();
        let expires_at = self.expiry(ttl, now);
        let mut guard = self.entries.lock();
        let table = &mut *guard;

        match table.live(key, now) {
            Some(entry) => {
                entry.value = value.to_vec();
                table.set_expiry(key, expires_at);
                table.touch(key);
            }
            None => table.insert(key, value.to_vec(), expires_at, now),
        }
        Ok(())
    }

    async fn increment_by(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut guard = self.entries.lock();
        let table = &mut *guard;

        match table.live(key, now) {
            Some(entry) => {
                let current = parse_counter(key, &entry.value)?;
                let next = current.checked_add(amount).ok_or_else(|| {
                    FloodgateError::Algorithm(format!("counter at '{}' overflowed", key))
                })?;
                entry.value = next.to_string().into_bytes();
                table.touch(key);
                Ok(next)
            }
            None => {
                let expires_at = self.expiry(ttl, now);
                table.insert(key, amount.to_string().into_bytes(), expires_at, now);
                Ok(amount)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let expires_at = self.expiry(ttl, now);
        let mut guard = self.entries.lock();
        let table = &mut *guard;

        match table.live(key, now) {
            Some(entry) => {
                if expected != Some(entry.value.as_slice()) {
                    return Ok(false);
                }
                entry.value = value.to_vec();
                table.set_expiry(key, expires_at);
                table.touch(key);
            }
            None => {
                if expected.is_some() {
                    return Ok(false);
                }
                table.insert(key, value.to_vec(), expires_at, now);
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        Ok(self.entries.lock().live(key, now).is_some())
    }

    async fn health(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(());
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "Memory store sweep task did not shut down cleanly");
            }
        }

        let dropped = self.entries.lock().clear();
        info!(entries = dropped, "Memory store closed");
        Ok(())
    }
}
