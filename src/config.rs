//! Configuration management for Floodgate.
//!
//! Files are YAML (or JSON, chosen by extension). Scalar settings can be
//! overridden from the environment with `FLOODGATE_`-prefixed variables;
//! nested keys use a double underscore, e.g. `FLOODGATE_REMOTE__ADDRESS`.

use std::path::Path;

use config::{ConfigError, Environment};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{AlgorithmKind, LimitsConfig};
use crate::store::{MemoryStoreConfig, RedisStoreConfig};

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "FLOODGATE";

/// Which store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// In-process memory
    #[default]
    Memory,
    /// Shared Redis server
    #[serde(alias = "redis")]
    Remote,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Remote => "remote",
        }
    }
}

impl std::str::FromStr for StoreKind {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "remote" | "redis" => Ok(StoreKind::Remote),
            other => Err(FloodgateError::Config(format!(
                "unknown store '{}' (expected memory or remote)",
                other
            ))),
        }
    }
}

/// Main configuration for a Floodgate engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When false every check is admitted without touching the store
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Admission algorithm
    #[serde(default)]
    pub algorithm: AlgorithmKind,

    /// Storage backend
    #[serde(default)]
    pub store: StoreKind,

    /// Prefix for every storage key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Limit hierarchy
    #[serde(default)]
    pub limits: LimitsConfig,

    /// In-memory store settings
    #[serde(default)]
    pub memory: MemoryStoreConfig,

    /// Redis store settings
    #[serde(default)]
    pub remote: RedisStoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            algorithm: AlgorithmKind::default(),
            store: StoreKind::default(),
            key_prefix: default_key_prefix(),
            limits: LimitsConfig::default(),
            memory: MemoryStoreConfig::default(),
            remote: RedisStoreConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_key_prefix() -> String {
    "floodgate".to_string()
}

impl EngineConfig {
    /// Configuration with the given limits and defaults for everything else.
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: AlgorithmKind) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Load configuration from a file path.
    ///
    /// `.json` files are parsed as JSON, anything else as YAML. The result
    /// is validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLOODGATE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(env_layer())
    }

    fn apply_overrides(mut self, environment: Environment) -> Result<Self> {
        let env = config::Config::builder()
            .add_source(environment)
            .build()
            .map_err(|e| FloodgateError::Config(format!("Failed to read environment: {}", e)))?;

        if let Some(enabled) = lookup::<bool>(&env, "enabled")? {
            self.enabled = enabled;
        }
        if let Some(algorithm) = lookup::<String>(&env, "algorithm")? {
            self.algorithm = algorithm.parse()?;
        }
        if let Some(store) = lookup::<String>(&env, "store")? {
            self.store = store.parse()?;
        }
        if let Some(prefix) = lookup::<String>(&env, "key_prefix")? {
            self.key_prefix = prefix;
        }
        if let Some(address) = lookup::<String>(&env, "remote.address")? {
            self.remote.address = address;
        }
        if let Some(password) = lookup::<String>(&env, "remote.password")? {
            self.remote.password = Some(password);
        }

        self.validate()?;
        Ok(self)
    }

    /// Check the configuration for errors.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.store == StoreKind::Remote {
            self.remote.validate()?;
        }

        if self.limits.is_empty() {
            debug!("No limits configured; every enabled check will fail to resolve");
        }
        Ok(())
    }
}

/// `FLOODGATE_KEY_PREFIX` sets `key_prefix`; `FLOODGATE_REMOTE__ADDRESS`
/// sets `remote.address`.
fn env_layer() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

/// Read an optional override, treating a missing key as `None`.
fn lookup<T: DeserializeOwned>(env: &config::Config, key: &str) -> Result<Option<T>> {
    match env.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(FloodgateError::Config(format!(
            "invalid environment override for '{}': {}",
            key, e
        ))),
    }
}
