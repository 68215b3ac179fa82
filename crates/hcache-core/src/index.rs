//! Local parameter index for entries held in L1.
//!
//! Maps each hierarchical pattern to the physical keys registered under it,
//! and each key back to its patterns so a removal can unlink it everywhere.
//! The index may name keys L1 has already dropped; readers check liveness in
//! L1 and call [`ParameterIndex::forget`] for stale keys.

use std::collections::HashSet;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub(crate) struct ParameterIndex {
    patterns: DashMap<String, HashSet<String>>,
    memberships: DashMap<String, HashSet<String>>,
}

impl ParameterIndex {
    pub(crate) fn register(&self, key: &str, patterns: &[String]) {
        self.memberships
            .entry(key.to_string())
            .or_default()
            .extend(patterns.iter().cloned());
        for pattern in patterns {
            self.patterns
                .entry(pattern.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    pub(crate) fn members(&self, pattern: &str) -> Vec<String> {
        self.patterns
            .get(pattern)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Unlink `key` from every pattern it was registered under.
    pub(crate) fn forget(&self, key: &str) {
        let Some((_, patterns)) = self.memberships.remove(key) else {
            return;
        };
        for pattern in patterns {
            if let Some(mut keys) = self.patterns.get_mut(&pattern) {
                keys.remove(key);
            }
            self.patterns.remove_if(&pattern, |_, keys| keys.is_empty());
        }
    }

    pub(crate) fn clear(&self) {
        self.patterns.clear();
        self.memberships.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.memberships.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_register_and_lookup() {
        let index = ParameterIndex::default();
        index.register("k1", &patterns(&["a", "a>b"]));
        index.register("k2", &patterns(&["a"]));

        let mut members = index.members("a");
        members.sort();
        assert_eq!(members, vec!["k1", "k2"]);
        assert_eq!(index.members("a>b"), vec!["k1"]);
        assert!(index.members("b").is_empty());
    }

    #[test]
    fn test_forget_unlinks_every_pattern() {
        let index = ParameterIndex::default();
        index.register("k1", &patterns(&["a", "a>b"]));
        index.register("k2", &patterns(&["a"]));

        index.forget("k1");
        assert_eq!(index.members("a"), vec!["k2"]);
        assert!(index.members("a>b").is_empty());
        assert!(!index.patterns.contains_key("a>b"));
        assert_eq!(index.len(), 1);

        index.forget("missing");
        index.clear();
        assert_eq!(index.len(), 0);
        assert!(index.members("a").is_empty());
    }
}
