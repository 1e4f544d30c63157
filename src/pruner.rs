use std::collections::HashSet;
use std::time::Duration;

use crate::cache::ActiveRefCache;
use crate::config::PRUNE_BATCH_THRESHOLD;
use crate::error::AggregatorError;
use crate::handlers::RefValue;
use crate::registry::PostIdRegistry;
use crate::storage::{KvStore, WriteBatcher};
use crate::tally::TallyTable;

pub struct PruneOutcome {
    pub removed_posts: usize,
    pub removed_refs: usize,
}

/// Retention-window eviction plus cascade purge of stale active-cache/KV
/// references, executed under one write batch.
pub fn run(
    store: &KvStore,
    tally: &mut TallyTable,
    registry: &mut PostIdRegistry,
    active_likes: &mut ActiveRefCache,
    active_reposts: &mut ActiveRefCache,
    retention_window: Duration,
    max_tracked_posts: usize,
    now_ms: i64,
) -> Result<PruneOutcome, AggregatorError> {
    let batcher = WriteBatcher::new(store, PRUNE_BATCH_THRESHOLD);
    let retention_ms = retention_window.as_millis() as i64;

    let mut removed = tally.retain_and_collect_removed(|_, stats| now_ms - stats.last_updated <= retention_ms);
    removed.extend(tally.evict_oldest_beyond(max_tracked_posts));

    let removed_posts = removed.len();
    let removed_ids: HashSet<u64> = removed.iter().map(|(_, id)| *id).collect();

    for (uri, id) in &removed {
        registry.remove(&batcher, *id)?;
        batcher.delete(format!("post:{uri}"))?;
    }

    let mut removed_refs = 0;
    if !removed_ids.is_empty() {
        removed_refs += purge_cache_and_prefix(store, &batcher, active_likes, &removed_ids, "like:")?;
        removed_refs += purge_cache_and_prefix(store, &batcher, active_reposts, &removed_ids, "repost:")?;
    }

    batcher.flush()?;

    Ok(PruneOutcome { removed_posts, removed_refs })
}

fn purge_cache_and_prefix(
    store: &KvStore,
    batcher: &WriteBatcher<'_>,
    cache: &mut ActiveRefCache,
    removed_ids: &HashSet<u64>,
    prefix: &str,
) -> Result<usize, AggregatorError> {
    let mut count = 0;
    for key in cache.remove_targets(removed_ids) {
        batcher.delete(format!("{prefix}{key}"))?;
        count += 1;
    }

    // The cache may have already evicted a reference to a removed post
    // before pruning ran; those rows only live in KV now. Scan for them too.
    let stale_rows: Vec<String> = store
        .iter_prefix(prefix)
        .filter_map(|entry| {
            let (key, value) = entry.ok()?;
            let parsed: RefValue = serde_json::from_slice(&value).ok()?;
            let id = match parsed {
                RefValue::Id(id) => id,
                RefValue::LegacyUri(_) => return None,
            };
            removed_ids.contains(&id).then_some(key)
        })
        .collect();
    for key in stale_rows {
        batcher.delete(key)?;
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStore;
    use crate::tally::PostStats;
    use tempfile::TempDir;

    fn setup() -> (KvStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn retention_eviction_cascades_into_kv_and_caches() {
        let (store, _dir) = setup();
        let mut tally = TallyTable::new();
        let mut registry = PostIdRegistry::new();
        let mut active_likes = ActiveRefCache::new(10);
        let mut active_reposts = ActiveRefCache::new(10);

        let uri = "at://did:p/app.bsky.feed.post/r1";
        let id = 7u64;
        tally.insert(uri.to_string(), PostStats { likes: 1, reposts: 0, last_updated: 0, id });
        registry.load_postid(uri.to_string(), id);
        registry.load_posturi(id, uri.to_string());
        // reference already evicted from the active cache but still in KV
        store
            .put("like:did:q/k", &serde_json::to_vec(&RefValue::Id(id)).unwrap())
            .unwrap();
        store
            .put(&format!("post:{uri}"), &serde_json::to_vec(&PostStats { likes: 1, reposts: 0, last_updated: 0, id }).unwrap())
            .unwrap();
        store.put(&format!("postid:{uri}"), &serde_json::to_vec(&id).unwrap()).unwrap();
        store.put(&format!("posturi:{id}"), &serde_json::to_vec(&serde_json::json!(uri)).unwrap()).unwrap();

        let now_ms = 25 * 3_600_000; // 25h after epoch
        let retention = Duration::from_secs(24 * 3_600);
        let outcome = run(
            &store,
            &mut tally,
            &mut registry,
            &mut active_likes,
            &mut active_reposts,
            retention,
            100_000,
            now_ms,
        )
        .unwrap();

        assert_eq!(outcome.removed_posts, 1);
        assert!(store.get(&format!("post:{uri}")).unwrap().is_none());
        assert!(store.get(&format!("postid:{uri}")).unwrap().is_none());
        assert!(store.get("like:did:q/k").unwrap().is_none());
        assert!(tally.get(uri).is_none());
    }

    #[test]
    fn no_op_tick_skips_cache_and_kv_scan() {
        let (store, _dir) = setup();
        let mut tally = TallyTable::new();
        let mut registry = PostIdRegistry::new();
        let mut active_likes = ActiveRefCache::new(10);
        let mut active_reposts = ActiveRefCache::new(10);

        let uri = "at://did:p/app.bsky.feed.post/fresh";
        tally.insert(uri.to_string(), PostStats { likes: 1, reposts: 0, last_updated: 0, id: 1 });
        store.put("like:did:q/k", &serde_json::to_vec(&RefValue::Id(99u64)).unwrap()).unwrap();

        let outcome = run(
            &store,
            &mut tally,
            &mut registry,
            &mut active_likes,
            &mut active_reposts,
            Duration::from_secs(24 * 3_600),
            100_000,
            0,
        )
        .unwrap();

        assert_eq!(outcome.removed_posts, 0);
        assert_eq!(outcome.removed_refs, 0);
        // a row referencing an id that was never evicted this tick is untouched
        assert!(store.get("like:did:q/k").unwrap().is_some());
    }

    #[test]
    fn size_cap_evicts_oldest_first() {
        let (store, _dir) = setup();
        let mut tally = TallyTable::new();
        let mut registry = PostIdRegistry::new();
        let mut active_likes = ActiveRefCache::new(10);
        let mut active_reposts = ActiveRefCache::new(10);

        for i in 0..5u64 {
            let uri = format!("at://p{i}");
            tally.insert(uri.clone(), PostStats { likes: 1, reposts: 0, last_updated: i as i64, id: i });
            registry.load_postid(uri.clone(), i);
            registry.load_posturi(i, uri);
        }

        let outcome = run(
            &store,
            &mut tally,
            &mut registry,
            &mut active_likes,
            &mut active_reposts,
            Duration::from_secs(3600),
            3,
            4,
        )
        .unwrap();

        assert_eq!(outcome.removed_posts, 2);
        assert_eq!(tally.len(), 3);
        assert!(tally.get("at://p0").is_none());
        assert!(tally.get("at://p1").is_none());
    }
}
