use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::AggregatorConfig;
use crate::error::AggregatorError;
use crate::ranker;
use crate::registry::PostIdRegistry;
use crate::tally::TallyTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    Connected,
    Initial,
    Periodic,
    Final,
}

impl SnapshotReason {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotReason::Connected => "connected",
            SnapshotReason::Initial => "initial",
            SnapshotReason::Periodic => "periodic",
            SnapshotReason::Final => "final",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPost {
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

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub generated_at: String,
    pub reason: String,
    pub window_hours: f64,
    pub half_life_hours: f64,
    pub top_count: usize,
    pub posts: Vec<SnapshotPost>,
}

/// Renders the current state into a snapshot payload. Pure and synchronous:
/// called on the ingestor's own task, before the result crosses into the
/// single-lane writer queue.
pub fn build(
    tally: &TallyTable,
    registry: &PostIdRegistry,
    config: &AggregatorConfig,
    reason: SnapshotReason,
    now_ms: i64,
) -> SnapshotPayload {
    let ranked = ranker::top_n(tally, registry, now_ms, config.half_life_hours, config.top_n);
    let posts = ranked
        .into_iter()
        .map(|p| SnapshotPost {
            rank: p.rank,
            uri: p.uri,
            url: p.url,
            post_id: p.post_id,
            likes: p.likes,
            reposts: p.reposts,
            score: round6(p.score),
            hotness: round6(p.hotness),
            last_updated: p.last_updated,
        })
        .collect();

    SnapshotPayload {
        generated_at: format_instant(now_ms),
        reason: reason.as_str().to_string(),
        window_hours: config.retention_window.as_secs_f64() / 3_600.0,
        half_life_hours: config.half_life_hours,
        top_count: config.top_n,
        posts,
    }
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn format_instant(now_ms: i64) -> String {
    Utc.timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
        .to_rfc3339()
}

/// `<snapshot_dir>/<YYYY-MM-DD>/<YYYY-MM-DD>T<HH-MM>Z.json`.
pub fn target_path(snapshot_dir: &Path, now_ms: i64) -> PathBuf {
    let dt = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    let date = dt.format("%Y-%m-%d").to_string();
    let filename = format!("{}.json", dt.format("%Y-%m-%dT%H-%MZ"));
    snapshot_dir.join(date).join(filename)
}

/// Writes the payload to `path`, creating parent directories as needed.
/// Write-then-close, not rename-based: a reader may observe a partial file.
pub async fn write_to_disk(path: &Path, payload: &SnapshotPayload) -> Result<(), AggregatorError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(payload)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// A queued, already-rendered snapshot waiting for its turn on the writer task.
pub struct SnapshotJob {
    pub path: PathBuf,
    pub payload: SnapshotPayload,
}

/// Handle to the single-lane snapshot writer. Cloning shares one queue;
/// dropping every clone lets the writer task finish once drained.
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::Sender<SnapshotJob>,
}

impl SnapshotHandle {
    pub async fn enqueue(&self, job: SnapshotJob) {
        if self.tx.send(job).await.is_err() {
            tracing::warn!("snapshot writer task is gone, dropping snapshot job");
        }
    }
}

/// Spawns the dedicated writer task and returns a handle plus its join
/// handle, so shutdown can drop the handle then await the join to drain.
pub fn spawn_writer(queue_capacity: usize) -> (SnapshotHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SnapshotJob>(queue_capacity);
    let join = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(e) = write_to_disk(&job.path, &job.payload).await {
                tracing::warn!(path = %job.path.display(), error = %e, "snapshot write failed, skipping");
            }
        }
    });
    (SnapshotHandle { tx }, join)
}
