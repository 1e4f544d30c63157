use std::num::NonZeroUsize;

use lru::LruCache;

/// Fixed-capacity active-reference cache: `<did>/<rkey>` -> target post id.
/// A `get` promotes the entry to most-recently-used; a `put` evicts the
/// least-recently-used entry once the cache is full. Eviction never touches
/// KV storage; the row there remains the durable fallback for a later
/// `delete` lookup.
pub struct ActiveRefCache {
    entries: LruCache<String, u64>,
}

impl ActiveRefCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self { entries: LruCache::new(capacity) }
    }

    pub fn get(&mut self, key: &str) -> Option<u64> {
        self.entries.get(key).copied()
    }

    pub fn put(&mut self, key: String, post_id: u64) {
        self.entries.put(key, post_id);
    }

    pub fn remove(&mut self, key: &str) -> Option<u64> {
        self.entries.pop(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Removes every entry whose target post id is in `removed_ids`,
    /// returning the reference keys that were dropped. Used by the pruner's
    /// cascade step.
    pub fn remove_targets(&mut self, removed_ids: &std::collections::HashSet<u64>) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, id)| removed_ids.contains(id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.entries.pop(key);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn get_promotes_and_eviction_is_lru() {
        let mut cache = ActiveRefCache::new(2);
        cache.put("did:a/r1".to_string(), 1);
        cache.put("did:b/r2".to_string(), 2);
        // touch the first entry so it's no longer the LRU one
        assert_eq!(cache.get("did:a/r1"), Some(1));
        cache.put("did:c/r3".to_string(), 3);
        // did:b/r2 should have been evicted, not did:a/r1
        assert_eq!(cache.get("did:b/r2"), None);
        assert_eq!(cache.get("did:a/r1"), Some(1));
        assert_eq!(cache.get("did:c/r3"), Some(3));
    }

    #[test]
    fn remove_targets_cascades() {
        let mut cache = ActiveRefCache::new(10);
        cache.put("did:a/r1".to_string(), 1);
        cache.put("did:b/r2".to_string(), 2);
        cache.put("did:c/r3".to_string(), 1);

        let removed_ids: HashSet<u64> = [1].into_iter().collect();
        let mut dropped = cache.remove_targets(&removed_ids);
        dropped.sort();
        assert_eq!(dropped, vec!["did:a/r1".to_string(), "did:c/r3".to_string()]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("did:b/r2"), Some(2));
    }
}
