// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::{AbortHandle, AbortToken};

/// Maps caller-chosen keys to one-shot abort signals.
///
/// A registry entry is created lazily on first use of a key and is
/// single-fire: once [`abort`][Self::abort] has been called for a key,
/// every token issued for that key (past and future) observes the fired
/// state until [`clear`][Self::clear] discards the entry. Clearing is the
/// only way to obtain a fresh, unfired token for a previously aborted key.
///
/// # Example
///
/// ```
/// use ripcord::AbortRegistry;
///
/// let registry = AbortRegistry::new();
/// let token = registry.token_for("job-7");
///
/// registry.abort("job-7");
/// assert!(token.is_aborted());
/// assert!(registry.is_aborted("job-7"));
///
/// registry.clear("job-7");
/// assert!(!registry.token_for("job-7").is_aborted());
/// ```
pub struct AbortRegistry {
    entries: DashMap<Arc<str>, AbortHandle>,
}

impl AbortRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns a token for `key`, creating the entry if absent.
    pub fn token_for(&self, key: impl AsRef<str>) -> AbortToken {
        let key = key.as_ref();
        if let Some(entry) = self.entries.get(key) {
            return entry.token();
        }

        self.entries
            .entry(Arc::from(key))
            .or_default()
            .token()
    }

    /// Fires the signal for `key`.
    ///
    /// Aborting a key that has never issued a token records the fired
    /// state, so a later [`token_for`][Self::token_for] starts out fired.
    pub fn abort(&self, key: impl AsRef<str>) {
        self.entries
            .entry(Arc::from(key.as_ref()))
            .or_default()
            .abort();
    }

    /// Fires the signal for every key in `keys`.
    pub fn abort_many<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            self.abort(key);
        }
    }

    /// Whether the signal for `key` has fired. Unknown keys are not
    /// aborted.
    #[must_use]
    pub fn is_aborted(&self, key: impl AsRef<str>) -> bool {
        self.entries
            .get(key.as_ref())
            .is_some_and(|entry| entry.is_aborted())
    }

    /// Discards the entry for `key`, allowing a fresh signal to be issued.
    ///
    /// Tokens issued before the clear keep observing the old signal.
    pub fn clear(&self, key: impl AsRef<str>) {
        self.entries.remove(key.as_ref());
    }

    /// Discards every entry.
    pub fn clear_all(&self) {
        self.entries.clear();
    }
}

impl Default for AbortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(AbortRegistry: Send, Sync);
    }

    #[test]
    fn tokens_for_same_key_share_a_signal() {
        let registry = AbortRegistry::new();

        let first = registry.token_for("k");
        let second = registry.token_for("k");

        registry.abort("k");
        assert!(first.is_aborted());
        assert!(second.is_aborted());
    }

    #[test]
    fn abort_before_first_token() {
        let registry = AbortRegistry::new();

        registry.abort("k");
        assert!(registry.is_aborted("k"));
        assert!(registry.token_for("k").is_aborted());
    }

    #[test]
    fn unknown_key_is_not_aborted() {
        let registry = AbortRegistry::new();
        assert!(!registry.is_aborted("missing"));
    }

    #[test]
    fn clear_issues_a_fresh_signal() {
        let registry = AbortRegistry::new();

        let stale = registry.token_for("k");
        registry.abort("k");
        registry.clear("k");

        let fresh = registry.token_for("k");
        assert!(stale.is_aborted());
        assert!(!fresh.is_aborted());
        assert!(!registry.is_aborted("k"));
    }

    #[test]
    fn abort_many_covers_every_key() {
        let registry = AbortRegistry::new();

        let a = registry.token_for("a");
        let b = registry.token_for("b");
        registry.abort_many(["a", "b"]);

        assert!(a.is_aborted());
        assert!(b.is_aborted());
    }

    #[test]
    fn clear_all_discards_everything() {
        let registry = AbortRegistry::new();

        registry.abort("a");
        registry.abort("b");
        registry.clear_all();

        assert!(!registry.is_aborted("a"));
        assert!(!registry.is_aborted("b"));
    }
}
