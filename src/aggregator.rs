use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::cache::ActiveRefCache;
use crate::config::{
    AggregatorConfig, PRUNE_COMPACTION_DELAY, RECONNECT_BACKOFF, RECOVERY_COMPACTION_DELAY,
    STEADY_BATCH_THRESHOLD,
};
use crate::error::AggregatorError;
use crate::event::{Operation, Record};
use crate::handlers::{self, HandlerContext, RefKind};
use crate::ingestor;
use crate::pruner;
use crate::recovery;
use crate::registry::PostIdRegistry;
use crate::reporter::{self, ReporterState};
use crate::snapshot::{self, SnapshotHandle, SnapshotJob, SnapshotReason};
use crate::storage::{KvStore, WriteBatcher};
use crate::tally::TallyTable;

const SNAPSHOT_QUEUE_CAPACITY: usize = 16;

/// Owns every piece of process-wide state and the top-level event loop:
/// startup (recovery, then connect), the select loop over the jetstream
/// socket and the reporter/pruner/snapshotter timers, and shutdown.
///
/// Single-threaded cooperative model: everything below runs on one
/// `current_thread` runtime, so interior state is `RefCell`-guarded rather
/// than behind a `Mutex`; no handler ever executes concurrently with
/// another, only interleaved at `.await` points.
pub struct Aggregator {
    config: AggregatorConfig,
    store: KvStore,
    tally: RefCell<TallyTable>,
    registry: RefCell<PostIdRegistry>,
    active_likes: RefCell<ActiveRefCache>,
    active_reposts: RefCell<ActiveRefCache>,
    shutting_down: Arc<AtomicBool>,
    compaction_deadline: RefCell<Option<tokio::time::Instant>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, shutting_down: Arc<AtomicBool>) -> Result<Self, AggregatorError> {
        let store = KvStore::open(&config.state_path)?;
        let active_likes = ActiveRefCache::new(config.max_active_likes);
        let active_reposts = ActiveRefCache::new(config.max_active_reposts);
        Ok(Self {
            tally: RefCell::new(TallyTable::new()),
            registry: RefCell::new(PostIdRegistry::new()),
            active_likes: RefCell::new(active_likes),
            active_reposts: RefCell::new(active_reposts),
            store,
            config,
            shutting_down,
            compaction_deadline: RefCell::new(None),
        })
    }

    /// Replays the KV store into memory. Must run before the ingestor
    /// connects.
    fn recover(&self) -> Result<(), AggregatorError> {
        let recovered = recovery::run(&self.store, &self.config, now_ms())?;
        *self.tally.borrow_mut() = recovered.tally;
        *self.registry.borrow_mut() = recovered.registry;
        *self.active_likes.borrow_mut() = recovered.active_likes;
        *self.active_reposts.borrow_mut() = recovered.active_reposts;
        if recovered.needs_compaction {
            self.schedule_compaction(RECOVERY_COMPACTION_DELAY);
        }
        Ok(())
    }

    /// Requests a deferred compaction. A pending request already further out
    /// is left alone; a pending request that would fire sooner is kept
    /// rather than pushed back, so repeated triggers coalesce into the
    /// earliest one instead of resetting the clock forever.
    fn schedule_compaction(&self, delay: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        let mut pending = self.compaction_deadline.borrow_mut();
        if pending.is_none_or(|existing| deadline < existing) {
            *pending = Some(deadline);
        }
    }

    /// The sleep future for the pending compaction, or one that never
    /// resolves if nothing is scheduled. Re-evaluated fresh on every select
    /// loop iteration, so a coalesced deadline set mid-wait takes effect
    /// immediately on the next iteration.
    async fn wait_for_compaction(&self) {
        let deadline = *self.compaction_deadline.borrow();
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn run_due_compaction(&self) {
        *self.compaction_deadline.borrow_mut() = None;
        self.store.compact();
    }

    fn report(&self, state: &mut ReporterState) {
        reporter::run(
            state,
            &self.tally.borrow(),
            &self.registry.borrow(),
            &self.active_likes.borrow(),
            &self.active_reposts.borrow(),
            &self.config,
            now_ms(),
        );
    }

    fn prune(&self) {
        let outcome = pruner::run(
            &self.store,
            &mut self.tally.borrow_mut(),
            &mut self.registry.borrow_mut(),
            &mut self.active_likes.borrow_mut(),
            &mut self.active_reposts.borrow_mut(),
            self.config.retention_window,
            self.config.max_tracked_posts,
            now_ms(),
        );
        match outcome {
            Ok(outcome) if outcome.removed_posts > 0 || outcome.removed_refs > 0 => {
                info!(
                    removed_posts = outcome.removed_posts,
                    removed_refs = outcome.removed_refs,
                    "prune cycle removed stale entries"
                );
                self.schedule_compaction(PRUNE_COMPACTION_DELAY);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "prune cycle failed"),
        }
    }

    async fn enqueue_snapshot(&self, handle: &SnapshotHandle, reason: SnapshotReason) {
        let now = now_ms();
        let payload = snapshot::build(&self.tally.borrow(), &self.registry.borrow(), &self.config, reason, now);
        let path = snapshot::target_path(&self.config.snapshot_dir, now);
        handle.enqueue(SnapshotJob { path, payload }).await;
    }

    /// Applies one parsed commit frame: routes `like`/`repost` creates and
    /// deletes to the handlers, ignores `update` explicitly, and ignores any
    /// other collection. `batcher` is the long-lived steady-state batch
    /// shared across every frame, so puts/deletes actually coalesce up to
    /// `STEADY_BATCH_THRESHOLD` ops into one atomic commit instead of each
    /// event paying for its own.
    fn handle_frame(&self, batcher: &WriteBatcher<'_>, text: &str) {
        let Some(msg) = ingestor::parse_commit(text) else { return };
        let Some(kind) = ingestor::collection_kind(&msg.commit.collection) else { return };

        let mut tally = self.tally.borrow_mut();
        let mut registry = self.registry.borrow_mut();
        let mut cache = match kind {
            RefKind::Like => self.active_likes.borrow_mut(),
            RefKind::Repost => self.active_reposts.borrow_mut(),
        };
        let mut ctx = HandlerContext {
            tally: &mut tally,
            registry: &mut registry,
            cache: &mut cache,
            store: &self.store,
            batcher,
        };

        let now = now_ms();
        let result = match msg.commit.operation {
            Operation::Create => {
                let subject_uri = match &msg.commit.record {
                    Some(Record::Like { subject, .. }) | Some(Record::Repost { subject, .. }) => &subject.uri,
                    _ => return,
                };
                handlers::handle_create(&mut ctx, kind, &msg.did, &msg.commit.rkey, subject_uri, now)
            }
            Operation::Delete => handlers::handle_delete(&mut ctx, kind, &msg.did, &msg.commit.rkey, now),
            // Explicitly ignored: the source collapses anything that isn't
            // create/delete into a no-op, so updates never reach a handler.
            Operation::Update => return,
        };

        if let Err(e) = result {
            if e.is_transient() {
                warn!(error = %e, collection = %msg.commit.collection, "handler failed, dropping event");
            } else {
                tracing::error!(error = %e, collection = %msg.commit.collection, "handler failed with non-transient error, dropping event");
            }
        }
    }

    /// Runs the aggregator until `shutting_down` is observed, then performs
    /// an orderly shutdown: final report, final prune, final snapshot, drain
    /// the snapshot queue, close the store.
    pub async fn run(self) -> Result<(), AggregatorError> {
        self.recover()?;

        let mut report_timer = tokio::time::interval(self.config.report_interval);
        let mut prune_timer = tokio::time::interval(self.config.prune_interval());
        let mut snapshot_timer = tokio::time::interval(self.config.snapshot_interval);
        let mut reporter_state = ReporterState::new();
        let (snap_handle, snap_join) = snapshot::spawn_writer(SNAPSHOT_QUEUE_CAPACITY);
        let steady_batcher = WriteBatcher::new(&self.store, STEADY_BATCH_THRESHOLD);

        self.enqueue_snapshot(&snap_handle, SnapshotReason::Initial).await;

        'outer: while !self.shutting_down.load(Ordering::SeqCst) {
            let mut stream = match ingestor::connect(&self.config.jetstream_url).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "jetstream connection failed, retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };
            info!(url = %self.config.jetstream_url, "jetstream connected");
            self.enqueue_snapshot(&snap_handle, SnapshotReason::Connected).await;

            loop {
                tokio::select! {
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => self.handle_frame(&steady_batcher, text.as_str()),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "jetstream read error");
                                break;
                            }
                        }
                    }
                    _ = report_timer.tick() => self.report(&mut reporter_state),
                    _ = prune_timer.tick() => self.prune(),
                    _ = snapshot_timer.tick() => self.enqueue_snapshot(&snap_handle, SnapshotReason::Periodic).await,
                    _ = self.wait_for_compaction() => self.run_due_compaction(),
                }

                if self.shutting_down.load(Ordering::SeqCst) {
                    let _ = stream.close(None).await;
                    break 'outer;
                }
            }

            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            warn!(backoff_secs = RECONNECT_BACKOFF.as_secs(), "jetstream disconnected, reconnecting");
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }

        info!("shutting down");
        self.report(&mut reporter_state);
        self.prune();
        self.enqueue_snapshot(&snap_handle, SnapshotReason::Final).await;
        drop(snap_handle);
        if let Err(e) = snap_join.await {
            warn!(error = %e, "snapshot writer task panicked during shutdown drain");
        }
        if let Err(e) = steady_batcher.flush() {
            warn!(error = %e, "failed to flush steady-state batch during shutdown");
        }
        drop(steady_batcher);
        self.store.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AggregatorConfig {
        let mut args = Args::parse_from(["hotlist"]);
        args.state = dir.path().join("db");
        args.snapshot_dir = dir.path().join("snaps");
        AggregatorConfig::from(args)
    }

    #[test]
    fn handle_frame_routes_like_create_into_tally() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let agg = Aggregator::new(config, Arc::new(AtomicBool::new(false))).unwrap();

        let frame = r#"{"did":"did:plc:a","time_us":1,"kind":"commit","commit":{"rev":"r","operation":"create","collection":"app.bsky.feed.like","rkey":"k1","record":{"$type":"app.bsky.feed.like","subject":{"uri":"at://did:plc:p/app.bsky.feed.post/r1"}}}}"#;
        let batcher = WriteBatcher::new(&agg.store, STEADY_BATCH_THRESHOLD);
        agg.handle_frame(&batcher, frame);

        let tally = agg.tally.borrow();
        let stats = tally.get("at://did:plc:p/app.bsky.feed.post/r1").unwrap();
        assert_eq!(stats.likes, 1);
    }

    #[test]
    fn handle_frame_ignores_update_operation() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let agg = Aggregator::new(config, Arc::new(AtomicBool::new(false))).unwrap();

        let frame = r#"{"did":"did:plc:a","time_us":1,"kind":"commit","commit":{"rev":"r","operation":"update","collection":"app.bsky.feed.like","rkey":"k1","record":{"$type":"app.bsky.feed.like","subject":{"uri":"at://did:plc:p/app.bsky.feed.post/r1"}}}}"#;
        let batcher = WriteBatcher::new(&agg.store, STEADY_BATCH_THRESHOLD);
        agg.handle_frame(&batcher, frame);

        assert!(agg.tally.borrow().is_empty());
    }

    #[test]
    fn handle_frame_ignores_unrelated_collection() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let agg = Aggregator::new(config, Arc::new(AtomicBool::new(false))).unwrap();

        let frame = r#"{"did":"did:plc:a","time_us":1,"kind":"commit","commit":{"rev":"r","operation":"create","collection":"app.bsky.feed.post","rkey":"k1","record":{"$type":"app.bsky.feed.post"}}}"#;
        let batcher = WriteBatcher::new(&agg.store, STEADY_BATCH_THRESHOLD);
        agg.handle_frame(&batcher, frame);

        assert!(agg.tally.borrow().is_empty());
    }
}
