use serde::{Deserialize, Serialize};

use crate::cache::ActiveRefCache;
use crate::error::AggregatorError;
use crate::registry::PostIdRegistry;
use crate::storage::{KvStore, WriteBatcher};
use crate::tally::{PostStats, TallyTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Like,
    Repost,
}

impl RefKind {
    pub fn key_prefix(self) -> &'static str {
        match self {
            RefKind::Like => "like:",
            RefKind::Repost => "repost:",
        }
    }
}

/// `like:*`/`repost:*` row value: a post id (current format) or a bare URI
/// (legacy, to be migrated on next write).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefValue {
    Id(u64),
    LegacyUri(String),
}

pub struct HandlerContext<'a> {
    pub tally: &'a mut TallyTable,
    pub registry: &'a mut PostIdRegistry,
    pub cache: &'a mut ActiveRefCache,
    pub store: &'a KvStore,
    pub batcher: &'a WriteBatcher<'a>,
}

/// `create` of a like/repost record: ensures the target post is tracked,
/// increments its counter, and records the active reference.
pub fn handle_create(
    ctx: &mut HandlerContext<'_>,
    kind: RefKind,
    actor_did: &str,
    rkey: &str,
    subject_uri: &str,
    now_ms: i64,
) -> Result<(), AggregatorError> {
    let reference = format!("{actor_did}/{rkey}");
    let post_id = ctx.registry.get_or_allocate(ctx.batcher, subject_uri)?;

    if ctx.tally.get(subject_uri).is_none() {
        ctx.tally.insert(
            subject_uri.to_string(),
            PostStats { likes: 0, reposts: 0, last_updated: now_ms, id: post_id },
        );
    }

    let (likes_delta, reposts_delta) = match kind {
        RefKind::Like => (1, 0),
        RefKind::Repost => (0, 1),
    };
    if let Some(stats) = ctx.tally.adjust(subject_uri, likes_delta, reposts_delta, now_ms) {
        ctx.batcher
            .put(format!("post:{subject_uri}"), serde_json::to_vec(&stats)?)?;
    }

    ctx.cache.put(reference.clone(), post_id);
    ctx.batcher
        .put(format!("{}{reference}", kind.key_prefix()), serde_json::to_vec(&RefValue::Id(post_id))?)?;
    Ok(())
}

/// `delete` of a like/repost record: resolves the reference to a post id
/// (cache, falling back to KV), decrements the counter if the post is still
/// tracked, and removes the reference everywhere.
pub fn handle_delete(
    ctx: &mut HandlerContext<'_>,
    kind: RefKind,
    actor_did: &str,
    rkey: &str,
    now_ms: i64,
) -> Result<(), AggregatorError> {
    let reference = format!("{actor_did}/{rkey}");
    let ref_key = format!("{}{reference}", kind.key_prefix());

    let post_id = match ctx.cache.get(&reference) {
        Some(id) => Some(id),
        None => resolve_ref_from_kv(ctx.store, ctx.registry, &ref_key)?,
    };

    let Some(post_id) = post_id else {
        // unresolved: silent drop, nothing to undo or delete.
        return Ok(());
    };

    if let Some(uri) = ctx.registry.uri_for_id(post_id).map(str::to_string) {
        let (likes_delta, reposts_delta) = match kind {
            RefKind::Like => (-1, 0),
            RefKind::Repost => (0, -1),
        };
        if let Some(stats) = ctx.tally.adjust(&uri, likes_delta, reposts_delta, now_ms) {
            if stats.likes == 0 && stats.reposts == 0 {
                ctx.tally.remove(&uri);
                ctx.registry.remove(ctx.batcher, post_id)?;
                ctx.batcher.delete(format!("post:{uri}"))?;
            } else {
                ctx.batcher
                    .put(format!("post:{uri}"), serde_json::to_vec(&stats)?)?;
            }
        }
        // else: post already pruned out of the tally; the KV ref row is
        // still removed below, but the (nonexistent) counter is left alone;
        // intentional undercounting during retention overflow.
    }

    ctx.cache.remove(&reference);
    ctx.batcher.delete(ref_key)?;
    Ok(())
}

fn resolve_ref_from_kv(
    store: &KvStore,
    registry: &PostIdRegistry,
    ref_key: &str,
) -> Result<Option<u64>, AggregatorError> {
    let Some(raw) = store.get(ref_key)? else {
        return Ok(None);
    };
    let value: RefValue = serde_json::from_slice(&raw)?;
    Ok(match value {
        RefValue::Id(id) => Some(id),
        RefValue::LegacyUri(uri) => registry.id_for_uri(&uri),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStore;
    use tempfile::TempDir;

    fn context<'a>(
        tally: &'a mut TallyTable,
        registry: &'a mut PostIdRegistry,
        cache: &'a mut ActiveRefCache,
        store: &'a KvStore,
        batcher: &'a WriteBatcher<'a>,
    ) -> HandlerContext<'a> {
        HandlerContext { tally, registry, cache, store, batcher }
    }

    #[test]
    fn like_unlike_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let batcher = WriteBatcher::new(&store, 1);
        let mut tally = TallyTable::new();
        let mut registry = PostIdRegistry::new();
        let mut cache = ActiveRefCache::new(10);
        let uri = "at://did:p/app.bsky.feed.post/r1";

        {
            let mut ctx = context(&mut tally, &mut registry, &mut cache, &store, &batcher);
            handle_create(&mut ctx, RefKind::Like, "did:a", "x1", uri, 1).unwrap();
            handle_create(&mut ctx, RefKind::Like, "did:b", "x2", uri, 2).unwrap();
            handle_delete(&mut ctx, RefKind::Like, "did:a", "x1", 3).unwrap();
        }

        let stats = tally.get(uri).unwrap();
        assert_eq!(stats.likes, 1);
        assert_eq!(stats.reposts, 0);
        assert_eq!(cache.get("did:b/x2"), Some(stats.id));
        assert_eq!(cache.get("did:a/x1"), None);
    }

    #[test]
    fn delete_without_prior_create_is_silent_noop() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let batcher = WriteBatcher::new(&store, 1);
        let mut tally = TallyTable::new();
        let mut registry = PostIdRegistry::new();
        let mut cache = ActiveRefCache::new(10);

        let mut ctx = context(&mut tally, &mut registry, &mut cache, &store, &batcher);
        handle_delete(&mut ctx, RefKind::Like, "did:c", "z", 1).unwrap();
        assert!(tally.is_empty());
        assert!(store.get("like:did:c/z").unwrap().is_none());
    }

    #[test]
    fn delete_resolves_through_kv_fallback_after_cache_eviction() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let batcher = WriteBatcher::new(&store, 1);
        let mut tally = TallyTable::new();
        let mut registry = PostIdRegistry::new();
        let mut cache = ActiveRefCache::new(10);
        let uri = "at://did:p/app.bsky.feed.post/r1";

        {
            let mut ctx = context(&mut tally, &mut registry, &mut cache, &store, &batcher);
            handle_create(&mut ctx, RefKind::Like, "did:a", "x1", uri, 1).unwrap();
        }
        // simulate LRU eviction: drop from cache but leave the KV row.
        cache.remove("did:a/x1");

        {
            let mut ctx = context(&mut tally, &mut registry, &mut cache, &store, &batcher);
            handle_delete(&mut ctx, RefKind::Like, "did:a", "x1", 2).unwrap();
        }
        assert!(tally.get(uri).is_none(), "likes+reposts reached zero, post dropped");
    }

    #[test]
    fn delete_after_post_pruned_is_undercounted_not_errored() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let batcher = WriteBatcher::new(&store, 1);
        let mut tally = TallyTable::new();
        let mut registry = PostIdRegistry::new();
        let mut cache = ActiveRefCache::new(10);
        let uri = "at://did:p/app.bsky.feed.post/r1";

        {
            let mut ctx = context(&mut tally, &mut registry, &mut cache, &store, &batcher);
            handle_create(&mut ctx, RefKind::Like, "did:a", "x1", uri, 1).unwrap();
        }
        // simulate pruning: tally entry gone, but the ref row/cache entry survive.
        tally.remove(uri);

        {
            let mut ctx = context(&mut tally, &mut registry, &mut cache, &store, &batcher);
            let result = handle_delete(&mut ctx, RefKind::Like, "did:a", "x1", 2);
            assert!(result.is_ok());
        }
        assert!(store.get("like:did:a/x1").unwrap().is_none());
    }
}
