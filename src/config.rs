use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

pub const COLLECTION_LIKE: &str = "app.bsky.feed.like";
pub const COLLECTION_REPOST: &str = "app.bsky.feed.repost";

pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
pub const STEADY_BATCH_THRESHOLD: usize = 1_000;
pub const RECOVERY_BATCH_THRESHOLD: usize = 5_000;
pub const PRUNE_BATCH_THRESHOLD: usize = 2_000;
pub const PRUNE_COMPACTION_DELAY: Duration = Duration::from_secs(3 * 60);
pub const RECOVERY_COMPACTION_DELAY: Duration = Duration::from_secs(30);
pub const REPOST_WEIGHT: f64 = 2.0;

/// Real-time like/repost aggregator over the Jetstream firehose.
#[derive(Debug, Clone, Parser)]
#[command(name = "hotlist", about = "Aggregate Bluesky likes and reposts into a decaying hotness leaderboard")]
pub struct Args {
    /// Reporter period, in milliseconds.
    #[arg(long = "interval-ms", default_value_t = 30_000)]
    pub interval_ms: u64,

    /// Leaderboard size.
    #[arg(long = "top", default_value_t = 10)]
    pub top: usize,

    /// Tally hard cap.
    #[arg(long = "max-posts", default_value_t = 100_000)]
    pub max_posts: usize,

    /// Retention window, in hours.
    #[arg(long = "window-hours", default_value_t = 24)]
    pub window_hours: u64,

    /// Decay half-life for hotness, in hours.
    #[arg(long = "half-life-hours", default_value_t = 3.0)]
    pub half_life_hours: f64,

    /// Snapshotter period, in milliseconds.
    #[arg(long = "snapshot-interval-ms", default_value_t = 600_000)]
    pub snapshot_interval_ms: u64,

    /// Directory snapshots are written under.
    #[arg(long = "snapshot-dir", env = "SNAPSHOT_DIR", default_value = "./data/aggregator-snapshots")]
    pub snapshot_dir: PathBuf,

    /// Location of the embedded KV store.
    #[arg(long = "state", env = "STATE_FILE", default_value = "./data/aggregator-db")]
    pub state: PathBuf,

    /// Override the retention window directly, in milliseconds.
    #[arg(long = "stale-ms")]
    pub stale_ms: Option<u64>,

    /// Active-like-reference LRU capacity.
    #[arg(long = "max-active-likes", default_value_t = 200_000)]
    pub max_active_likes: usize,

    /// Active-repost-reference LRU capacity.
    #[arg(long = "max-active-reposts", default_value_t = 120_000)]
    pub max_active_reposts: usize,

    /// Jetstream endpoint to subscribe to.
    #[arg(long = "jetstream-url", env = "JETSTREAM_URL", default_value = DEFAULT_JETSTREAM_URL)]
    pub jetstream_url: String,
}

/// Resolved, process-wide configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub report_interval: Duration,
    pub top_n: usize,
    pub max_tracked_posts: usize,
    pub retention_window: Duration,
    pub half_life_hours: f64,
    pub snapshot_interval: Duration,
    pub snapshot_dir: PathBuf,
    pub state_path: PathBuf,
    pub max_active_likes: usize,
    pub max_active_reposts: usize,
    pub jetstream_url: String,
}

impl From<Args> for AggregatorConfig {
    fn from(args: Args) -> Self {
        let retention_window = match args.stale_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(args.window_hours * 3_600),
        };
        Self {
            report_interval: Duration::from_millis(args.interval_ms),
            top_n: args.top,
            max_tracked_posts: args.max_posts,
            retention_window,
            half_life_hours: args.half_life_hours,
            snapshot_interval: Duration::from_millis(args.snapshot_interval_ms),
            snapshot_dir: args.snapshot_dir,
            state_path: args.state,
            max_active_likes: args.max_active_likes,
            max_active_reposts: args.max_active_reposts,
            jetstream_url: args.jetstream_url,
        }
    }
}

impl AggregatorConfig {
    /// Pruner tick interval: `clamp(15s, 5 * report_interval, retention_window)`.
    pub fn prune_interval(&self) -> Duration {
        let lo = Duration::from_secs(15);
        let mid = self.report_interval * 5;
        let hi = self.retention_window;
        mid.clamp(lo, hi.max(lo))
    }
}
