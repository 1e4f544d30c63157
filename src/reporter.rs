use std::fs;
use std::time::Instant;

use tracing::info;

use crate::cache::ActiveRefCache;
use crate::config::AggregatorConfig;
use crate::ranker::{self, RankedPost};
use crate::registry::PostIdRegistry;
use crate::tally::TallyTable;

const CLK_TCK_HZ: f64 = 100.0;

/// Carries the previous CPU-tick sample across reporter ticks so `run` can
/// compute a percentage delta rather than a cumulative total.
pub struct ReporterState {
    last_cpu_ticks: u64,
    last_sample_at: Instant,
}

impl ReporterState {
    pub fn new() -> Self {
        Self { last_cpu_ticks: read_cpu_ticks().unwrap_or(0), last_sample_at: Instant::now() }
    }
}

impl Default for ReporterState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub rss_bytes: u64,
    pub heap_bytes: u64,
    pub cpu_percent: f64,
}

/// Samples RSS, heap, and CPU usage since the last call. Never errors: all
/// sources fall back to zero when `/proc` is unavailable (non-Linux,
/// sandboxed).
pub fn sample_resources(state: &mut ReporterState) -> ResourceSample {
    let rss_bytes = read_rss_bytes().unwrap_or(0);
    let heap_bytes = read_heap_bytes().unwrap_or(0);
    let cpu_percent = match read_cpu_ticks() {
        Some(ticks) => {
            let elapsed = state.last_sample_at.elapsed().as_secs_f64();
            let delta_ticks = ticks.saturating_sub(state.last_cpu_ticks) as f64;
            let percent = if elapsed > 0.0 { (delta_ticks / CLK_TCK_HZ) / elapsed * 100.0 } else { 0.0 };
            state.last_cpu_ticks = ticks;
            state.last_sample_at = Instant::now();
            percent
        }
        None => 0.0,
    };
    ResourceSample { rss_bytes, heap_bytes, cpu_percent }
}

fn read_rss_bytes() -> Option<u64> {
    read_status_field("VmRSS:")
}

/// Data-segment size (`VmData`) as a heap-usage proxy; there's no custom
/// allocator here to report precise arena stats, so this reads from the same
/// `/proc/self/status` table as RSS.
fn read_heap_bytes() -> Option<u64> {
    read_status_field("VmData:")
}

fn read_status_field(label: &str) -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    status.lines().find_map(|line| {
        let rest = line.strip_prefix(label)?;
        let kb: u64 = rest.trim().split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

/// Sum of `utime` + `stime` (fields 14/15 of `/proc/self/stat`), in clock
/// ticks. The comm field may itself contain spaces or parens, so we split on
/// the last `)` rather than whitespace position from the start of the line.
fn read_cpu_ticks() -> Option<u64> {
    let stat = fs::read_to_string("/proc/self/stat").ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// One reporter tick: logs RSS/heap/CPU/cache occupancy, then the leaderboard.
pub fn run(
    state: &mut ReporterState,
    tally: &TallyTable,
    registry: &PostIdRegistry,
    active_likes: &ActiveRefCache,
    active_reposts: &ActiveRefCache,
    config: &AggregatorConfig,
    now_ms: i64,
) {
    let sample = sample_resources(state);
    info!(
        rss_bytes = sample.rss_bytes,
        heap_bytes = sample.heap_bytes,
        cpu_percent = format!("{:.1}", sample.cpu_percent),
        tracked_posts = tally.len(),
        active_likes = active_likes.len(),
        active_likes_capacity = active_likes.capacity(),
        active_reposts = active_reposts.len(),
        active_reposts_capacity = active_reposts.capacity(),
        "resource report"
    );

    let leaderboard = ranker::top_n(tally, registry, now_ms, config.half_life_hours, config.top_n);
    if leaderboard.is_empty() {
        info!("No data yet");
    }
    for post in &leaderboard {
        log_ranked(post);
    }
}

fn log_ranked(post: &RankedPost) {
    info!(
        rank = post.rank,
        uri = %post.uri,
        url = post.url.as_deref().unwrap_or(""),
        likes = post.likes,
        reposts = post.reposts,
        score = format!("{:.2}", post.score),
        hotness = format!("{:.4}", post.hotness),
        "leaderboard entry"
    );
}
