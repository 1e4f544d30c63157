use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-post counters, the `post:<uri>` KV row shape verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostStats {
    pub likes: u64,
    pub reposts: u64,
    pub last_updated: i64,
    pub id: u64,
}

/// In-memory mapping from post URI to its current counters.
#[derive(Debug, Default)]
pub struct TallyTable {
    posts: HashMap<String, PostStats>,
}

impl TallyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<&PostStats> {
        self.posts.get(uri)
    }

    pub fn insert(&mut self, uri: String, stats: PostStats) {
        self.posts.insert(uri, stats);
    }

    pub fn remove(&mut self, uri: &str) -> Option<PostStats> {
        self.posts.remove(uri)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PostStats)> {
        self.posts.iter()
    }

    /// Adjusts likes or reposts by `delta`, floored at 0, bumping `last_updated`.
    /// Returns the updated stats, or `None` if `uri` is untracked.
    pub fn adjust(
        &mut self,
        uri: &str,
        likes_delta: i64,
        reposts_delta: i64,
        now_ms: i64,
    ) -> Option<PostStats> {
        let stats = self.posts.get_mut(uri)?;
        stats.likes = adjust_floored(stats.likes, likes_delta);
        stats.reposts = adjust_floored(stats.reposts, reposts_delta);
        stats.last_updated = now_ms;
        Some(*stats)
    }

    /// Retains only entries for which `keep` returns true, returning the
    /// `(uri, id)` of everything removed.
    pub fn retain_and_collect_removed(
        &mut self,
        mut keep: impl FnMut(&str, &PostStats) -> bool,
    ) -> Vec<(String, u64)> {
        let mut removed = Vec::new();
        self.posts.retain(|uri, stats| {
            let keep = keep(uri, stats);
            if !keep {
                removed.push((uri.clone(), stats.id));
            }
            keep
        });
        removed
    }

    /// If the table has more than `target_len` entries, removes the oldest
    /// (by `last_updated`) until it fits, returning their `(uri, id)`.
    pub fn evict_oldest_beyond(&mut self, target_len: usize) -> Vec<(String, u64)> {
        if self.posts.len() <= target_len {
            return Vec::new();
        }
        let mut by_age: Vec<(String, i64)> = self
            .posts
            .iter()
            .map(|(uri, stats)| (uri.clone(), stats.last_updated))
            .collect();
        by_age.sort_by_key(|(_, last_updated)| *last_updated);
        let excess = self.posts.len() - target_len;
        let mut removed = Vec::with_capacity(excess);
        for (uri, _) in by_age.into_iter().take(excess) {
            if let Some(stats) = self.posts.remove(&uri) {
                removed.push((uri, stats.id));
            }
        }
        removed
    }
}

fn adjust_floored(current: u64, delta: i64) -> u64 {
    let next = current as i64 + delta;
    next.max(0) as u64
}
