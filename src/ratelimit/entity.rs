//! Identities being rate limited.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FloodgateError;

/// The kind of identity an [`Entity`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// An API key presented by a client
    ApiKey,
    /// An authenticated user
    User,
    /// A tenant or organisation
    Tenant,
    /// A client IP address
    Ip,
    /// Anything else the caller wants to limit
    Custom,
}

impl EntityKind {
    /// The stable string used in storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ApiKey => "api_key",
            EntityKind::User => "user",
            EntityKind::Tenant => "tenant",
            EntityKind::Ip => "ip",
            EntityKind::Custom => "custom",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_key" | "apikey" | "api-key" => Ok(EntityKind::ApiKey),
            "user" => Ok(EntityKind::User),
            "tenant" => Ok(EntityKind::Tenant),
            "ip" => Ok(EntityKind::Ip),
            "custom" => Ok(EntityKind::Custom),
            other => Err(FloodgateError::Config(format!(
                "unknown entity kind '{}'",
                other
            ))),
        }
    }
}

/// An identity being rate limited.
///
/// Entities are value objects built by the caller for every request. The
/// engine reads `kind`, `id` and `tier`; `metadata` is carried along for
/// adapters and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Opaque identifier
    pub id: String,
    /// What sort of identity this is
    pub kind: EntityKind,
    /// Service tier, empty when the entity has none
    #[serde(default)]
    pub tier: String,
    /// Free-form caller data
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Entity {
    /// Create an entity with no tier and no metadata.
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            tier: String::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(EntityKind::User, id)
    }

    pub fn api_key(id: impl Into<String>) -> Self {
        Self::new(EntityKind::ApiKey, id)
    }

    pub fn tenant(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Tenant, id)
    }

    pub fn ip(addr: impl Into<String>) -> Self {
        Self::new(EntityKind::Ip, addr)
    }

    pub fn custom(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Custom, id)
    }

    /// Set the service tier.
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata entry.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
