use crate::config::REPOST_WEIGHT;
use crate::registry::PostIdRegistry;
use crate::tally::{PostStats, TallyTable};

#[derive(Debug, Clone, PartialEq)]
pub struct RankedPost {
    pub rank: usize,
    pub uri: String,
    pub url: Option<String>,
    pub post_id: u64,
    pub likes: u64,
    pub reposts: u64,
    pub score: f64,
    pub hotness: f64,
    pub last_updated: i64,
}

/// `S = likes + 2 * reposts`.
pub fn score(stats: &PostStats) -> f64 {
    stats.likes as f64 + REPOST_WEIGHT * stats.reposts as f64
}

/// `H = S * exp(-age_hours / half_life_hours)`, `0` if `S <= 0`, `S` if the
/// decay factor is non-finite.
pub fn hotness(stats: &PostStats, now_ms: i64, half_life_hours: f64) -> f64 {
    let s = score(stats);
    if s <= 0.0 {
        return 0.0;
    }
    let age_hours = ((now_ms - stats.last_updated).max(0) as f64) / 3_600_000.0;
    let decay = (-age_hours / half_life_hours).exp();
    if decay.is_finite() {
        s * decay
    } else {
        s
    }
}

/// Builds the top-N leaderboard, ordered by `(-hotness, -score, -last_updated, uri)`.
pub fn top_n(
    tally: &TallyTable,
    registry: &PostIdRegistry,
    now_ms: i64,
    half_life_hours: f64,
    n: usize,
) -> Vec<RankedPost> {
    let mut entries: Vec<(String, PostStats, f64, f64)> = tally
        .iter()
        .map(|(uri, stats)| {
            (uri.clone(), *stats, score(stats), hotness(stats, now_ms, half_life_hours))
        })
        .collect();

    entries.sort_by(|a, b| {
        b.3.partial_cmp(&a.3)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| b.1.last_updated.cmp(&a.1.last_updated))
            .then_with(|| a.0.cmp(&b.0))
    });

    entries
        .into_iter()
        .take(n)
        .enumerate()
        .map(|(i, (uri, stats, score, hotness))| RankedPost {
            rank: i + 1,
            url: registry.url_for_id(stats.id),
            post_id: stats.id,
            likes: stats.likes,
            reposts: stats.reposts,
            score,
            hotness,
            last_updated: stats.last_updated,
            uri,
        })
        .collect()
}
