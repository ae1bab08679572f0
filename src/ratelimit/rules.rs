//! Rate limit rules and the precedence walk that resolves them.
//!
//! Limits are configured at four levels. For a given entity and scope the
//! first match wins:
//!
//! 1. `entity_overrides[entity.id].limits[scope]`
//! 2. `tier_limits[entity.tier].scope_limits[scope]`, then
//!    `tier_limits[entity.tier].default_limits[scope]`
//! 3. `scope_limits[scope]`
//! 4. `default_limits[scope]`, then `default_limits["global"]`
//!
//! If nothing matches, levels 1-3 are tried once more for the `"global"`
//! scope before resolution gives up.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::entity::Entity;
use super::rate::RateLimit;
use crate::error::{FloodgateError, Result};

/// Scope used as the catch-all fallback.
pub const GLOBAL_SCOPE: &str = "global";

/// The complete limit hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Fallback limits per scope, including `"global"`
    #[serde(default)]
    pub default_limits: HashMap<String, RateLimit>,
    /// Tier-independent limits per scope
    #[serde(default)]
    pub scope_limits: HashMap<String, RateLimit>,
    /// Limits per service tier
    #[serde(default)]
    pub tier_limits: HashMap<String, TierLimits>,
    /// Limits for individual entities, keyed by entity id
    #[serde(default)]
    pub entity_overrides: HashMap<String, EntityOverride>,
}

/// Limits for one service tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Tier limits for specific scopes
    #[serde(default)]
    pub scope_limits: HashMap<String, RateLimit>,
    /// Tier fallbacks, consulted after `scope_limits`
    #[serde(default)]
    pub default_limits: HashMap<String, RateLimit>,
}

/// Limits pinned to a single entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityOverride {
    /// Override limits per scope
    #[serde(default)]
    pub limits: HashMap<String, RateLimit>,
}

/// Which level of the hierarchy produced a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitSource {
    EntityOverride,
    TierScope,
    TierDefault,
    Scope,
    Default,
}

impl fmt::Display for LimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitSource::EntityOverride => "entity_override",
            LimitSource::TierScope => "tier_scope",
            LimitSource::TierDefault => "tier_default",
            LimitSource::Scope => "scope",
            LimitSource::Default => "default",
        };
        f.write_str(name)
    }
}

/// A resolved limit together with where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    /// The effective limit
    pub limit: &'a RateLimit,
    /// Hierarchy level that supplied it
    pub source: LimitSource,
    /// The scope name it was configured under (the requested scope or `"global"`)
    pub matched_scope: &'a str,
}

impl LimitsConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load limits from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load limits from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimitsConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse limits: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set a default limit for a scope (use [`GLOBAL_SCOPE`] for the catch-all).
    pub fn with_default(mut self, scope: impl Into<String>, limit: RateLimit) -> Self {
        self.default_limits.insert(scope.into(), limit);
        self
    }

    /// Set a tier-independent limit for a scope.
    pub fn with_scope_limit(mut self, scope: impl Into<String>, limit: RateLimit) -> Self {
        self.scope_limits.insert(scope.into(), limit);
        self
    }

    /// Set a tier limit for a specific scope.
    pub fn with_tier_scope_limit(
        mut self,
        tier: impl Into<String>,
        scope: impl Into<String>,
        limit: RateLimit,
    ) -> Self {
        self.tier_limits
            .entry(tier.into())
            .or_default()
            .scope_limits
            .insert(scope.into(), limit);
        self
    }

    /// Set a tier fallback limit for a scope.
    pub fn with_tier_default(
        mut self,
        tier: impl Into<String>,
        scope: impl Into<String>,
        limit: RateLimit,
    ) -> Self {
        self.tier_limits
            .entry(tier.into())
            .or_default()
            .default_limits
            .insert(scope.into(), limit);
        self
    }

    /// Pin a limit to one entity id.
    pub fn with_entity_override(
        mut self,
        entity_id: impl Into<String>,
        scope: impl Into<String>,
        limit: RateLimit,
    ) -> Self {
        self.entity_overrides
            .entry(entity_id.into())
            .or_default()
            .limits
            .insert(scope.into(), limit);
        self
    }

    /// Whether no limits are configured at all.
    pub fn is_empty(&self) -> bool {
        self.default_limits.is_empty()
            && self.scope_limits.is_empty()
            && self.tier_limits.is_empty()
            && self.entity_overrides.is_empty()
    }

    /// Check every configured limit.
    pub fn validate(&self) -> Result<()> {
        let annotate = |path: String, limit: &RateLimit| {
            limit
                .validate()
                .map_err(|e| FloodgateError::Config(format!("{}: {}", path, e)))
        };

        for (scope, limit) in &self.default_limits {
            annotate(format!("default_limits.{}", scope), limit)?;
        }
        for (scope, limit) in &self.scope_limits {
            annotate(format!("scope_limits.{}", scope), limit)?;
        }
        for (tier, tier_limits) in &self.tier_limits {
            for (scope, limit) in &tier_limits.scope_limits {
                annotate(format!("tier_limits.{}.scope_limits.{}", tier, scope), limit)?;
            }
            for (scope, limit) in &tier_limits.default_limits {
                annotate(format!("tier_limits.{}.default_limits.{}", tier, scope), limit)?;
            }
        }
        for (entity_id, entity_override) in &self.entity_overrides {
            for (scope, limit) in &entity_override.limits {
                annotate(format!("entity_overrides.{}.limits.{}", entity_id, scope), limit)?;
            }
        }
        Ok(())
    }

    /// Find the effective limit for an entity and scope.
    pub fn resolve<'a>(&'a self, entity: &Entity, scope: &'a str) -> Option<Resolution<'a>> {
        self.lookup(entity, scope)
            .or_else(|| self.lookup_default(GLOBAL_SCOPE))
            .or_else(|| {
                if scope == GLOBAL_SCOPE {
                    None
                } else {
                    self.lookup(entity, GLOBAL_SCOPE)
                }
            })
    }

    /// Walk the four levels for one exact scope name.
    fn lookup<'a>(&'a self, entity: &Entity, scope: &'a str) -> Option<Resolution<'a>> {
        let found = |limit: &'a RateLimit, source: LimitSource| Resolution {
            limit,
            source,
            matched_scope: scope,
        };

        if let Some(limit) = self
            .entity_overrides
            .get(&entity.id)
            .and_then(|o| o.limits.get(scope))
        {
            return Some(found(limit, LimitSource::EntityOverride));
        }

        if !entity.tier.is_empty() {
            if let Some(tier) = self.tier_limits.get(&entity.tier) {
                if let Some(limit) = tier.scope_limits.get(scope) {
                    return Some(found(limit, LimitSource::TierScope));
                }
                if let Some(limit) = tier.default_limits.get(scope) {
                    return Some(found(limit, LimitSource::TierDefault));
                }
            }
        }

        if let Some(limit) = self.scope_limits.get(scope) {
            return Some(found(limit, LimitSource::Scope));
        }

        self.lookup_default(scope)
    }

    fn lookup_default<'a>(&'a self, scope: &'a str) -> Option<Resolution<'a>> {
        self.default_limits.get(scope).map(|limit| Resolution {
            limit,
            source: LimitSource::Default,
            matched_scope: scope,
        })
    }
}
