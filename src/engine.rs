//! The admission engine.
//!
//! Wires the limit hierarchy, key builder, algorithm and store together
//! and owns their lifecycle. An [`Engine`] is shared between tasks by
//! reference or `Arc`; every method takes `&self`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::clock::SystemClock;
use crate::config::{EngineConfig, StoreKind};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{Algorithm, Decision, Entity, KeyBuilder, Resolution, StateSnapshot};
use crate::store::{MemoryStore, RedisStore, Store};

/// Configuration snapshot used by checks. Replaced wholesale on update.
#[derive(Debug)]
struct Settings {
    config: EngineConfig,
    keys: KeyBuilder,
}

impl Settings {
    fn new(config: EngineConfig) -> Arc<Self> {
        let keys = KeyBuilder::new(config.key_prefix.clone());
        Arc::new(Self { config, keys })
    }

    fn resolve<'a>(&'a self, entity: &Entity, scope: &'a str) -> Result<Resolution<'a>> {
        self.config
            .limits
            .resolve(entity, scope)
            .ok_or_else(|| FloodgateError::NoLimit {
                entity: entity.to_string(),
                tier: entity.tier.clone(),
                scope: scope.to_string(),
            })
    }
}

#[derive(Debug)]
struct EngineState {
    settings: Arc<Settings>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Checks performed, including those answered while disabled
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    /// Checks that returned an error
    pub errors: u64,
    pub algorithm: &'static str,
    pub store: &'static str,
    pub enabled: bool,
    pub closed: bool,
}

/// Admission-control engine.
pub struct Engine {
    state: RwLock<EngineState>,
    store: Arc<dyn Store>,
    algorithm: Arc<dyn Algorithm>,
    counters: Counters,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("algorithm", &self.algorithm.name())
            .field("store", &self.store.name())
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine, creating the store and algorithm the configuration
    /// names.
    ///
    /// # Errors
    /// Fails on invalid configuration or if the remote store cannot be
    /// reached.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = match config.store {
            StoreKind::Memory => Arc::new(MemoryStore::new(config.memory.clone())),
            StoreKind::Remote => Arc::new(RedisStore::connect(config.remote.clone()).await?),
        };
        Self::with_store(config, store)
    }

    /// Build an engine on an existing store.
    pub fn with_store(config: EngineConfig, store: Arc<dyn Store>) -> Result<Self> {
        let algorithm = config.algorithm.build(Arc::new(SystemClock));
        Self::with_components(config, store, algorithm)
    }

    /// Build an engine from explicit parts.
    ///
    /// The configuration's `algorithm` and `store` fields are not consulted.
    pub fn with_components(
        config: EngineConfig,
        store: Arc<dyn Store>,
        algorithm: Arc<dyn Algorithm>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            algorithm = algorithm.name(),
            store = store.name(),
            enabled = config.enabled,
            key_prefix = %config.key_prefix,
            "Rate limiting engine initialized"
        );

        Ok(Self {
            state: RwLock::new(EngineState {
                settings: Settings::new(config),
                closed: false,
            }),
            store,
            algorithm,
            counters: Counters::default(),
        })
    }

    /// Current settings, or an error if the engine is closed.
    fn open_settings(&self) -> Result<Arc<Settings>> {
        let state = self.state.read();
        if state.closed {
            return Err(FloodgateError::Closed("engine"));
        }
        Ok(state.settings.clone())
    }

    /// Decide whether `entity` may spend `n` units on `scope`.
    ///
    /// A disabled engine admits everything without touching the store,
    /// even after it has been closed.
    pub async fn check(&self, entity: &Entity, scope: &str, n: u64) -> Result<Decision> {
        let settings = {
            let state = self.state.read();
            if !state.settings.config.enabled {
                self.counters.checks.fetch_add(1, Ordering::Relaxed);
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                return Ok(Decision::unlimited());
            }
            if state.closed {
                return Err(FloodgateError::Closed("engine"));
            }
            state.settings.clone()
        };

        self.counters.checks.fetch_add(1, Ordering::Relaxed);
        let result = self.evaluate(&settings, entity, scope, n).await;

        match &result {
            Ok(decision) if decision.allowed => {
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!(entity = %entity, scope = %scope, error = %e, "Rate limit check failed");
            }
        }
        result
    }

    async fn evaluate(
        &self,
        settings: &Settings,
        entity: &Entity,
        scope: &str,
        n: u64,
    ) -> Result<Decision> {
        let resolution = settings.resolve(entity, scope)?;
        let key = settings.keys.build(entity, scope);

        trace!(
            key = %key,
            limit = %resolution.limit,
            source = %resolution.source,
            matched_scope = resolution.matched_scope,
            cost = n,
            "Checking rate limit"
        );

        let mut decision = self
            .algorithm
            .allow(self.store.as_ref(), &key, resolution.limit, n)
            .await?;
        decision.window = resolution.limit.window;

        if !decision.allowed {
            debug!(
                key = %key,
                limit = decision.limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Forget the state for (`entity`, `scope`). Resetting twice is harmless,
    /// and so is resetting a scope that no longer resolves to a limit.
    pub async fn reset(&self, entity: &Entity, scope: &str) -> Result<()> {
        let settings = self.open_settings()?;
        let key = settings.keys.build(entity, scope);

        match settings.config.limits.resolve(entity, scope) {
            Some(resolution) => {
                self.algorithm
                    .reset(self.store.as_ref(), &key, resolution.limit)
                    .await?
            }
            // No window to locate without a limit; drop whatever sits at the key.
            None => self.store.delete(&key).await?,
        }
        debug!(key = %key, "Rate limit state reset");
        Ok(())
    }

    /// Snapshot of the algorithm state for (`entity`, `scope`).
    ///
    /// Returns `None` when the algorithm is not inspectable or no state is
    /// stored yet.
    pub async fn inspect(&self, entity: &Entity, scope: &str) -> Result<Option<StateSnapshot>> {
        let settings = self.open_settings()?;
        let Some(inspectable) = self.algorithm.as_inspectable() else {
            return Ok(None);
        };
        let resolution = settings.resolve(entity, scope)?;
        let key = settings.keys.build(entity, scope);

        inspectable
            .inspect(self.store.as_ref(), &key, resolution.limit)
            .await
    }

    /// Check that the engine is open and its store usable.
    pub async fn health(&self) -> Result<()> {
        self.open_settings()?;
        self.store.health().await
    }

    /// Close the engine and its store. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        self.store.close().await?;
        info!(store = self.store.name(), "Rate limiting engine closed");
        Ok(())
    }

    /// Swap in a new configuration.
    ///
    /// The enabled flag, key prefix and limits take effect for the next
    /// check. The algorithm and store are fixed at construction; changes to
    /// them are ignored with a warning.
    pub fn update_config(&self, mut config: EngineConfig) -> Result<()> {
        config.validate()?;

        let mut state = self.state.write();
        if state.closed {
            return Err(FloodgateError::Closed("engine"));
        }

        let current = &state.settings.config;
        if config.algorithm != current.algorithm {
            warn!(
                current = %current.algorithm,
                requested = %config.algorithm,
                "Ignoring algorithm change; restart the engine to switch algorithms"
            );
            config.algorithm = current.algorithm;
        }
        if config.store != current.store
            || config.memory != current.memory
            || config.remote != current.remote
        {
            warn!(
                current = current.store.as_str(),
                requested = config.store.as_str(),
                "Ignoring store change; restart the engine to switch stores"
            );
            config.store = current.store;
            config.memory = current.memory.clone();
            config.remote = current.remote.clone();
        }

        info!(
            enabled = config.enabled,
            key_prefix = %config.key_prefix,
            "Configuration updated"
        );
        state.settings = Settings::new(config);
        Ok(())
    }

    /// The active configuration.
    pub fn config(&self) -> EngineConfig {
        self.state.read().settings.config.clone()
    }

    /// Current statistics.
    pub fn stats(&self) -> EngineStats {
        let state = self.state.read();
        EngineStats {
            checks: self.counters.checks.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            algorithm: self.algorithm.name(),
            store: self.store.name(),
            enabled: state.settings.config.enabled,
            closed: state.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::ErrorKind;
    use crate::ratelimit::{AlgorithmKind, LimitsConfig, RateLimit, GLOBAL_SCOPE};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Store double that counts every call before delegating.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn touch(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Store for CountingStore {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.touch();
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            self.touch();
            self.inner.set(key, value, ttl).await
        }

        async fn increment_by(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
            self.touch();
            self.inner.increment_by(key, amount, ttl).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            value: &[u8],
            ttl: Duration,
        ) -> Result<bool> {
            self.touch();
            self.inner.compare_and_swap(key, expected, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.touch();
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.touch();
            self.inner.exists(key).await
        }

        async fn health(&self) -> Result<()> {
            self.touch();
            self.inner.health().await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    /// Store double whose every operation fails.
    struct UnreachableStore;

    #[async_trait]
    impl Store for UnreachableStore {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(FloodgateError::StoreConnectivity("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
            Err(FloodgateError::StoreConnectivity("connection refused".into()))
        }

        async fn increment_by(&self, _key: &str, _amount: i64, _ttl: Duration) -> Result<i64> {
            Err(FloodgateError::StoreConnectivity("connection refused".into()))
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&[u8]>,
            _value: &[u8],
            _ttl: Duration,
        ) -> Result<bool> {
            Err(FloodgateError::StoreConnectivity("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(FloodgateError::StoreConnectivity("connection refused".into()))
        }

        async fn exists(&self, _key: &str) -> Result<bool> {
            Err(FloodgateError::StoreConnectivity("connection refused".into()))
        }

        async fn health(&self) -> Result<()> {
            Err(FloodgateError::StoreConnectivity("connection refused".into()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn limits() -> LimitsConfig {
        LimitsConfig::new()
            .with_default(GLOBAL_SCOPE, RateLimit::per_hour(1000))
            .with_scope_limit("upload", RateLimit::per_minute(3))
            .with_tier_scope_limit("premium", "upload", RateLimit::per_minute(10))
    }

    fn manual_engine(kind: AlgorithmKind, limits: LimitsConfig) -> (Engine, ManualClock) {
        // Aligned to a whole hour.
        let clock = ManualClock::new(chrono::DateTime::from_timestamp(1_699_999_200, 0).unwrap());
        let algorithm = kind.build(Arc::new(clock.clone()) as Arc<dyn Clock>);
        let engine = Engine::with_components(
            EngineConfig::new(limits).with_algorithm(kind),
            Arc::new(MemoryStore::default()),
            algorithm,
        )
        .unwrap();
        (engine, clock)
    }

    #[tokio::test]
    async fn test_check_enforces_scope_limit() {
        let (engine, _clock) = manual_engine(AlgorithmKind::TokenBucket, limits());
        let alice = Entity::user("alice");

        for _ in 0..3 {
            assert!(engine.check(&alice, "upload", 1).await.unwrap().allowed);
        }
        let denied = engine.check(&alice, "upload", 1).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.window, Duration::from_secs(60));
        assert!(denied.retry_after > Duration::ZERO);

        // Another scope has its own state and limit.
        assert!(engine.check(&alice, "search", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_tier_limit_takes_precedence() {
        let (engine, _clock) = manual_engine(AlgorithmKind::FixedWindow, limits());
        let premium = Entity::user("bob").with_tier("premium");

        let decision = engine.check(&premium, "upload", 1).await.unwrap();
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_unresolvable_scope_is_config_error() {
        let (engine, _clock) = manual_engine(AlgorithmKind::TokenBucket, LimitsConfig::new());

        let err = engine.check(&Entity::user("alice"), "upload", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(matches!(err, FloodgateError::NoLimit { .. }));
        assert_eq!(engine.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_disabled_engine_never_touches_store() {
        let store = Arc::new(CountingStore::default());
        let config = EngineConfig::new(limits()).with_enabled(false);
        let engine = Engine::with_store(config, store.clone()).unwrap();

        for _ in 0..100 {
            let decision = engine.check(&Entity::ip("10.0.0.1"), "upload", 1).await.unwrap();
            assert!(decision.allowed);
            assert!(decision.is_unlimited());
        }
        assert_eq!(store.calls(), 0);

        // Disabled wins over closed.
        engine.close().await.unwrap();
        let decision = engine.check(&Entity::ip("10.0.0.1"), "upload", 1).await.unwrap();
        assert!(decision.is_unlimited());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_the_limit() {
        const TASKS: u64 = 8;
        const CHECKS: u64 = 50;
        let limit = TASKS * CHECKS / 2;

        for kind in [
            AlgorithmKind::TokenBucket,
            AlgorithmKind::SlidingWindow,
            AlgorithmKind::FixedWindow,
        ] {
            let limits = LimitsConfig::new().with_scope_limit("export", RateLimit::per_hour(limit));
            let (engine, _clock) = manual_engine(kind, limits);
            let engine = Arc::new(engine);

            let handles: Vec<_> = (0..TASKS)
                .map(|_| {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let tenant = Entity::tenant("acme");
                        let mut allowed = 0u64;
                        for _ in 0..CHECKS {
                            if engine.check(&tenant, "export", 1).await.unwrap().allowed {
                                allowed += 1;
                            }
                        }
                        allowed
                    })
                })
                .collect();

            let total: u64 = futures::future::join_all(handles)
                .await
                .into_iter()
                .map(|result| result.unwrap())
                .sum();

            assert_eq!(total, limit, "{} admitted the wrong number of requests", kind);
            let stats = engine.stats();
            assert_eq!(stats.allowed, limit);
            assert_eq!(stats.denied, TASKS * CHECKS - limit);
        }
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (engine, _clock) = manual_engine(AlgorithmKind::SlidingWindow, limits());
        let alice = Entity::user("alice");

        for _ in 0..3 {
            engine.check(&alice, "upload", 1).await.unwrap();
        }
        assert!(!engine.check(&alice, "upload", 1).await.unwrap().allowed);

        engine.reset(&alice, "upload").await.unwrap();
        engine.reset(&alice, "upload").await.unwrap();
        engine.reset(&Entity::user("never-seen"), "upload").await.unwrap();

        assert!(engine.check(&alice, "upload", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_without_resolvable_limit() {
        let upload_only = || LimitsConfig::new().with_scope_limit("upload", RateLimit::per_minute(3));
        let (engine, _clock) = manual_engine(AlgorithmKind::SlidingWindow, upload_only());
        let alice = Entity::user("alice");

        engine.reset(&alice, "never-configured").await.unwrap();

        for _ in 0..3 {
            engine.check(&alice, "upload", 1).await.unwrap();
        }
        assert!(!engine.check(&alice, "upload", 1).await.unwrap().allowed);

        // The limit goes away but its state is still in the store.
        let search_only = LimitsConfig::new().with_scope_limit("search", RateLimit::per_minute(3));
        engine.update_config(EngineConfig::new(search_only)).unwrap();
        engine.reset(&alice, "upload").await.unwrap();
        engine.reset(&alice, "upload").await.unwrap();

        engine.update_config(EngineConfig::new(upload_only())).unwrap();
        assert!(engine.check(&alice, "upload", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_operations() {
        let (engine, _clock) = manual_engine(AlgorithmKind::TokenBucket, limits());
        engine.health().await.unwrap();

        engine.close().await.unwrap();
        engine.close().await.unwrap();

        let alice = Entity::user("alice");
        let err = engine.check(&alice, "upload", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineClosed);
        assert_eq!(
            engine.reset(&alice, "upload").await.unwrap_err().kind(),
            ErrorKind::EngineClosed
        );
        assert_eq!(engine.health().await.unwrap_err().kind(), ErrorKind::EngineClosed);
        assert!(engine.update_config(EngineConfig::new(limits())).is_err());
        assert!(engine.stats().closed);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let engine =
            Engine::with_store(EngineConfig::new(limits()), Arc::new(UnreachableStore)).unwrap();

        let err = engine.check(&Entity::user("alice"), "upload", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreConnectivity);
        assert!(err.is_retryable());
        assert!(engine.health().await.is_err());

        let stats = engine.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.allowed + stats.denied, 0);
    }

    #[tokio::test]
    async fn test_update_config_swaps_limits() {
        let (engine, _clock) = manual_engine(AlgorithmKind::TokenBucket, limits());
        let alice = Entity::user("alice");

        let stricter = LimitsConfig::new().with_scope_limit("upload", RateLimit::per_minute(1));
        let requested = EngineConfig::new(stricter).with_algorithm(AlgorithmKind::FixedWindow);
        engine.update_config(requested).unwrap();

        assert_eq!(engine.config().algorithm, AlgorithmKind::TokenBucket);
        assert_eq!(engine.stats().algorithm, "token_bucket");

        let decision = engine.check(&alice, "upload", 1).await.unwrap();
        assert_eq!(decision.limit, 1);
        assert!(!engine.check(&alice, "upload", 1).await.unwrap().allowed);
        // The global default was dropped with the old limits.
        assert!(engine.check(&alice, "search", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid_limits() {
        let (engine, _clock) = manual_engine(AlgorithmKind::TokenBucket, limits());

        let invalid = LimitsConfig::new()
            .with_scope_limit("upload", RateLimit::per_minute(10).with_burst(5));
        assert!(engine.update_config(EngineConfig::new(invalid)).is_err());
        assert_eq!(engine.config().limits, limits());
    }

    #[tokio::test]
    async fn test_update_config_can_disable() {
        let (engine, _clock) = manual_engine(AlgorithmKind::TokenBucket, limits());
        engine
            .update_config(EngineConfig::new(limits()).with_enabled(false))
            .unwrap();

        assert!(engine.check(&Entity::user("alice"), "nowhere", 1).await.unwrap().is_unlimited());
        assert!(!engine.stats().enabled);
    }

    #[tokio::test]
    async fn test_inspect_through_engine() {
        let (engine, clock) = manual_engine(AlgorithmKind::TokenBucket, limits());
        let alice = Entity::user("alice");

        assert_eq!(engine.inspect(&alice, "upload").await.unwrap(), None);
        engine.check(&alice, "upload", 2).await.unwrap();
        clock.advance(Duration::from_secs(20));

        match engine.inspect(&alice, "upload").await.unwrap() {
            Some(StateSnapshot::TokenBucket { tokens, capacity, .. }) => {
                assert_eq!(capacity, 3);
                assert!((tokens - 2.0).abs() < 1e-9);
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }

        let (fixed, _clock) = manual_engine(AlgorithmKind::FixedWindow, limits());
        fixed.check(&alice, "upload", 1).await.unwrap();
        assert_eq!(fixed.inspect(&alice, "upload").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_key_prefix_reaches_the_store() {
        let store = Arc::new(MemoryStore::default());
        let config = EngineConfig::new(limits())
            .with_key_prefix("edge")
            .with_algorithm(AlgorithmKind::SlidingWindow);
        let engine = Engine::with_store(config, store.clone()).unwrap();

        engine.check(&Entity::api_key("k1"), "upload", 1).await.unwrap();
        assert!(store.exists("edge:api_key:k1:upload").await.unwrap());
    }

    #[tokio::test]
    async fn test_token_bucket_refills_in_real_time() {
        let limits = LimitsConfig::new()
            .with_scope_limit("burst", RateLimit::new(2, Duration::from_millis(100)));
        let engine = Engine::from_config(EngineConfig::new(limits)).await.unwrap();
        let alice = Entity::user("alice");

        assert!(engine.check(&alice, "burst", 2).await.unwrap().allowed);
        assert!(!engine.check(&alice, "burst", 1).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(engine.check(&alice, "burst", 2).await.unwrap().allowed);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sliding_window_decays_in_real_time() {
        let limits = LimitsConfig::new()
            .with_scope_limit("burst", RateLimit::new(5, Duration::from_millis(100)));
        let config = EngineConfig::new(limits).with_algorithm(AlgorithmKind::SlidingWindow);
        let engine = Engine::from_config(config).await.unwrap();
        let alice = Entity::user("alice");

        assert!(engine.check(&alice, "burst", 5).await.unwrap().allowed);
        assert!(!engine.check(&alice, "burst", 1).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(engine.check(&alice, "burst", 5).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_stats_track_outcomes() {
        let (engine, _clock) = manual_engine(AlgorithmKind::TokenBucket, limits());
        let alice = Entity::user("alice");

        for _ in 0..5 {
            let _ = engine.check(&alice, "upload", 1).await;
        }

        let stats = engine.stats();
        assert_eq!(stats.checks, 5);
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.denied, 2);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.store, "memory");
        assert!(stats.enabled);
    }
}
