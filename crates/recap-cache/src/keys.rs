//! Cache key builders
//!
//! Every recap occupies two keys derived from one prefix:
//!
//! - `{prefix}:{key}` - the cached record
//! - `{prefix}:{key}:lock` - the repopulation lock
//!
//! # Example
//!
//! ```
//! use recap_cache::keys::RecapKeys;
//! use recap_core::models::RecapKey;
//!
//! let keys = RecapKeys::default();
//! assert_eq!(keys.entry(RecapKey(42)), "recap:42");
//! assert_eq!(keys.lock(RecapKey(42)), "recap:42:lock");
//! ```

use recap_core::models::RecapKey;

/// Default prefix for recap entries
pub const RECAP_PREFIX: &str = "recap";

/// Suffix appended to an entry key to form its lock key
pub const LOCK_SUFFIX: &str = "lock";

/// Key builder bound to one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecapKeys {
    prefix: String,
}

impl RecapKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of the cached record: `{prefix}:{key}`
    pub fn entry(&self, key: RecapKey) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Key of the repopulation lock: `{prefix}:{key}:lock`
    pub fn lock(&self, key: RecapKey) -> String {
        format!("{}:{}:{}", self.prefix, key, LOCK_SUFFIX)
    }
}

impl Default for RecapKeys {
    fn default() -> Self {
        Self::new(RECAP_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_and_lock_keys() {
        let keys = RecapKeys::default();
        assert_eq!(keys.entry(RecapKey(42)), "recap:42");
        assert_eq!(keys.lock(RecapKey(42)), "recap:42:lock");
        assert_eq!(keys.entry(RecapKey(-1)), "recap:-1");
    }

    #[test]
    fn test_custom_prefix() {
        let keys = RecapKeys::new("user:recap");
        assert_eq!(keys.entry(RecapKey(7)), "user:recap:7");
        assert_eq!(keys.lock(RecapKey(7)), "user:recap:7:lock");
        assert_eq!(keys.prefix(), "user:recap");
    }

    #[test]
    fn test_entry_and_lock_never_collide() {
        let keys = RecapKeys::default();
        for id in [0, 1, 42, 4242] {
            assert_ne!(keys.entry(RecapKey(id)), keys.lock(RecapKey(id)));
        }
    }
}
