//! Storage key generation.

use super::entity::Entity;

/// Separator between key segments.
const SEPARATOR: char = ':';

/// Builds the storage key for an (entity, scope) pair.
///
/// Keys have the form `[prefix:]kind:id:scope`. The same inputs always
/// produce the same key, so counters in a remote store keep accumulating
/// across process restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// Create a key builder. A trailing separator on the prefix is dropped.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches(SEPARATOR).to_string(),
        }
    }

    /// The configured prefix, without the trailing separator.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the key for an entity and scope.
    ///
    /// Segments are joined as-is, without escaping. An id or scope that
    /// itself contains `:` (an IPv6 address, say) can therefore collide
    /// with another pair: `ip` id `a:b` on scope `c` and id `a` on scope
    /// `b:c` share a key. Keep `:` out of scope names, or normalize such ids
    /// before building the entity, when that matters.
    pub fn build(&self, entity: &Entity, scope: &str) -> String {
        let kind = entity.kind.as_str();
        let mut key = String::with_capacity(
            self.prefix.len() + kind.len() + entity.id.len() + scope.len() + 3,
        );
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
            key.push(SEPARATOR);
        }
        key.push_str(kind);
        key.push(SEPARATOR);
        key.push_str(&entity.id);
        key.push(SEPARATOR);
        key.push_str(scope);
        key
    }
}
