use std::time::Duration;

use tracing::{info, warn};

use crate::cache::ActiveRefCache;
use crate::config::{AggregatorConfig, RECOVERY_BATCH_THRESHOLD};
use crate::error::AggregatorError;
use crate::handlers::RefValue;
use crate::registry::{PostIdRegistry, PostUriValue, KEY_NEXT_POST_ID};
use crate::storage::{KvStore, WriteBatcher};
use crate::tally::{PostStats, TallyTable};

pub struct RecoveredState {
    pub tally: TallyTable,
    pub registry: PostIdRegistry,
    pub active_likes: ActiveRefCache,
    pub active_reposts: ActiveRefCache,
    pub needs_compaction: bool,
}

/// Replays the KV store at startup: reconciles id/URI mappings, migrates
/// legacy value shapes, drops stale/orphaned rows, and rebuilds the
/// in-memory tally and active caches. Runs under one write batch so repairs
/// apply atomically; a bad row is logged and dropped, never aborts the walk.
pub fn run(store: &KvStore, config: &AggregatorConfig, now_ms: i64) -> Result<RecoveredState, AggregatorError> {
    let batcher = WriteBatcher::new(store, RECOVERY_BATCH_THRESHOLD);
    let mut registry = PostIdRegistry::new();
    let mut tally = TallyTable::new();
    let mut active_likes = ActiveRefCache::new(config.max_active_likes);
    let mut active_reposts = ActiveRefCache::new(config.max_active_reposts);

    // 1. meta:nextPostId
    let stored_next: u64 = store
        .get(KEY_NEXT_POST_ID)?
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .unwrap_or(1);

    // 2. postid:<uri> -> id
    let mut postid_count = 0;
    let mut max_id = 0u64;
    for entry in store.iter_prefix("postid:") {
        let (key, value) = entry?;
        let Some(uri) = key.strip_prefix("postid:") else { continue };
        match serde_json::from_slice::<u64>(&value) {
            Ok(id) => {
                registry.load_postid(uri.to_string(), id);
                max_id = max_id.max(id);
                postid_count += 1;
            }
            Err(e) => {
                warn!(key, error = %e, "dropping malformed postid row");
                batcher.delete(key)?;
            }
        }
    }
    info!(count = postid_count, "recovery: loaded postid mappings");

    // 3. posturi:<id> -> uri
    let mut posturi_count = 0;
    for entry in store.iter_prefix("posturi:") {
        let (key, value) = entry?;
        let Some(id_str) = key.strip_prefix("posturi:") else { continue };
        let Ok(id) = id_str.parse::<u64>() else {
            warn!(key, "dropping posturi row with unparseable id");
            batcher.delete(key)?;
            continue;
        };
        match serde_json::from_slice::<PostUriValue>(&value) {
            Ok(parsed) => {
                registry.load_posturi(id, parsed.uri().to_string());
                max_id = max_id.max(id);
                posturi_count += 1;
            }
            Err(e) => {
                warn!(key, error = %e, "dropping malformed posturi row");
                batcher.delete(key)?;
            }
        }
    }
    info!(count = posturi_count, "recovery: loaded posturi mappings");

    // 4. posturl:<id> -> url
    let mut posturl_count = 0;
    for entry in store.iter_prefix("posturl:") {
        let (key, value) = entry?;
        let Some(id_str) = key.strip_prefix("posturl:") else { continue };
        let Ok(id) = id_str.parse::<u64>() else {
            batcher.delete(key)?;
            continue;
        };
        match serde_json::from_slice::<Option<String>>(&value) {
            Ok(url) => {
                registry.load_posturl(id, url);
                posturl_count += 1;
            }
            Err(e) => {
                warn!(key, error = %e, "dropping malformed posturl row");
                batcher.delete(key)?;
            }
        }
    }
    info!(count = posturl_count, "recovery: loaded posturl cache");

    // 5. next_post_id = max(stored_next, max_id + 1, 1)
    let next_id = stored_next.max(max_id + 1).max(1);
    registry.set_next_id(next_id);
    batcher.put(KEY_NEXT_POST_ID, serde_json::to_vec(&next_id)?)?;

    // 6. post:<uri> -> {likes, reposts, lastUpdated, id}
    let mut loaded_posts = 0;
    let mut stale_removed = 0;
    let retention_ms = config.retention_window.as_millis() as i64;
    for entry in store.iter_prefix("post:") {
        let (key, value) = entry?;
        let Some(uri) = key.strip_prefix("post:") else { continue };
        let stats = match serde_json::from_slice::<PostStats>(&value) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(key, error = %e, "dropping malformed post row");
                batcher.delete(key)?;
                continue;
            }
        };

        if stats.likes == 0 && stats.reposts == 0 {
            batcher.delete(key)?;
            continue;
        }
        if now_ms - stats.last_updated > retention_ms {
            batcher.delete(key)?;
            registry.remove(&batcher, stats.id)?;
            stale_removed += 1;
            continue;
        }

        let id = reconcile_post_id(&mut registry, &batcher, uri, stats.id)?;
        let canonical = PostStats { id, ..stats };
        if canonical != stats {
            batcher.put(key.clone(), serde_json::to_vec(&canonical)?)?;
        }
        tally.insert(uri.to_string(), canonical);
        loaded_posts += 1;
    }
    info!(loaded = loaded_posts, stale_removed, "recovery: loaded post tallies");

    // 7 & 8. like:* / repost:*
    let like_refs = reconcile_refs(store, &batcher, &registry, &tally, &mut active_likes, "like:")?;
    let repost_refs = reconcile_refs(store, &batcher, &registry, &tally, &mut active_reposts, "repost:")?;
    info!(like_refs, repost_refs, "recovery: loaded active references");

    batcher.flush()?;

    Ok(RecoveredState {
        tally,
        registry,
        active_likes,
        active_reposts,
        needs_compaction: stale_removed > 0,
    })
}

fn reconcile_post_id(
    registry: &mut PostIdRegistry,
    batcher: &WriteBatcher<'_>,
    uri: &str,
    stats_id: u64,
) -> Result<u64, AggregatorError> {
    if let Some(id) = registry.id_for_uri(uri) {
        return Ok(id);
    }
    if stats_id != 0 && registry.uri_for_id(stats_id).is_none() {
        registry.load_postid(uri.to_string(), stats_id);
        registry.load_posturi(stats_id, uri.to_string());
        batcher.put(format!("postid:{uri}"), serde_json::to_vec(&stats_id)?)?;
        batcher.put(
            format!("posturi:{stats_id}"),
            serde_json::to_vec(&PostUriValue::Plain(uri.to_string()))?,
        )?;
        return Ok(stats_id);
    }
    registry.get_or_allocate(batcher, uri)
}

fn reconcile_refs(
    store: &KvStore,
    batcher: &WriteBatcher<'_>,
    registry: &PostIdRegistry,
    tally: &TallyTable,
    cache: &mut ActiveRefCache,
    prefix: &str,
) -> Result<usize, AggregatorError> {
    let mut count = 0;
    for entry in store.iter_prefix(prefix) {
        let (key, value) = entry?;
        let Some(reference) = key.strip_prefix(prefix) else { continue };

        let parsed: RefValue = match serde_json::from_slice(&value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "dropping malformed ref row");
                batcher.delete(key)?;
                continue;
            }
        };

        let resolved_id = match &parsed {
            RefValue::Id(id) => Some(*id),
            RefValue::LegacyUri(uri) => registry.id_for_uri(uri),
        };

        let Some(id) = resolved_id else {
            batcher.delete(key)?;
            continue;
        };

        let target_tracked = registry
            .uri_for_id(id)
            .map(|uri| tally.get(uri).is_some())
            .unwrap_or(false);

        if !target_tracked {
            batcher.delete(key)?;
            continue;
        }

        if matches!(parsed, RefValue::LegacyUri(_)) {
            batcher.put(key.clone(), serde_json::to_vec(&RefValue::Id(id))?)?;
        }
        cache.put(reference.to_string(), id);
        count += 1;
    }
    Ok(count)
}
