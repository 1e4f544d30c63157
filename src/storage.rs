use std::cell::RefCell;
use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::error::AggregatorError;

const CACHE_SIZE: u64 = 64 * 1024 * 1024;
const WRITE_BUFFER_SIZE: u64 = 32 * 1024 * 1024;
const FSYNC_MS: Option<u16> = Some(1_000);

/// A single pending write, queued for the next batch flush.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Thin wrapper over a single fjall keyspace/partition pair, matching the
/// ordered-keyspace-with-atomic-batches contract: flat UTF-8 keys, JSON
/// values, `get`/`put`/`del`/`batch`/prefix-`iterator`/`compact`/`close`.
pub struct KvStore {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl KvStore {
    pub fn open(path: &Path) -> Result<Self, AggregatorError> {
        match Self::open_inner(path) {
            Ok(store) => Ok(store),
            Err(AggregatorError::Storage(e)) if is_storage_corrupted(&e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "detected corrupted storage, deleting and recreating"
                );
                std::fs::remove_dir_all(path).map_err(AggregatorError::Io)?;
                Self::open_inner(path)
            }
            Err(e) => Err(e),
        }
    }

    fn open_inner(path: &Path) -> Result<Self, AggregatorError> {
        let keyspace = Config::new(path)
            .cache_size(CACHE_SIZE)
            .max_write_buffer_size(WRITE_BUFFER_SIZE)
            .fsync_ms(FSYNC_MS)
            .open()?;
        let partition =
            keyspace.open_partition("hotlist", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, partition })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AggregatorError> {
        Ok(self.partition.get(key.as_bytes())?.map(|slice| slice.to_vec()))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), AggregatorError> {
        self.partition.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), AggregatorError> {
        self.partition.remove(key.as_bytes())?;
        Ok(())
    }

    /// Iterates every row whose key starts with `prefix`, in key order.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &str,
    ) -> impl Iterator<Item = Result<(String, Vec<u8>), AggregatorError>> + 'a {
        let prefix = prefix.to_string();
        self.partition.prefix(prefix.as_bytes()).map(|entry| {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).into_owned();
            Ok((key, value.to_vec()))
        })
    }

    /// Applies a list of writes as one atomic batch.
    pub fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), AggregatorError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                WriteOp::Put(key, value) => batch.insert(&self.partition, key.as_bytes(), value.as_slice()),
                WriteOp::Delete(key) => batch.remove(&self.partition, key.as_bytes()),
            }
        }
        batch.commit()?;
        Ok(())
    }

    /// Triggers a major compaction of the partition, collapsing the
    /// tombstones a prune/recovery cycle leaves behind. Runs synchronously on
    /// the calling task; callers defer/coalesce calls (see
    /// `Aggregator::schedule_compaction`) so this never overlaps a snapshot
    /// write.
    pub fn compact(&self) {
        let strategy: std::sync::Arc<dyn fjall::compaction::CompactionStrategy + Send + Sync> =
            std::sync::Arc::new(fjall::compaction::Leveled::default());
        if let Err(e) = self.partition.compact(strategy, u64::MAX) {
            tracing::warn!(error = %e, "compaction request failed");
        }
    }

    pub fn close(self) {
        drop(self.partition);
        drop(self.keyspace);
    }
}

fn is_storage_corrupted(err: &fjall::Error) -> bool {
    matches!(err, fjall::Error::Poisoned)
}

/// Coalesces `put`/`del` calls into atomic batches, per the scoped
/// ambient-batch contract: callers push through [`WriteBatcher::put`]/
/// [`WriteBatcher::delete`], and a batch scope (recovery, prune) installs
/// itself as the active batch for its duration, flushing on drop instead of
/// on every call.
pub struct WriteBatcher<'a> {
    store: &'a KvStore,
    threshold: usize,
    pending: RefCell<Vec<WriteOp>>,
}

impl<'a> WriteBatcher<'a> {
    pub fn new(store: &'a KvStore, threshold: usize) -> Self {
        Self {
            store,
            threshold,
            pending: RefCell::new(Vec::new()),
        }
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) -> Result<(), AggregatorError> {
        self.pending.borrow_mut().push(WriteOp::Put(key.into(), value));
        self.maybe_flush()
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<(), AggregatorError> {
        self.pending.borrow_mut().push(WriteOp::Delete(key.into()));
        self.maybe_flush()
    }

    fn maybe_flush(&self) -> Result<(), AggregatorError> {
        if self.pending.borrow().len() >= self.threshold {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Flushes any pending ops as a single atomic batch.
    pub fn flush(&self) -> Result<(), AggregatorError> {
        let ops = std::mem::take(&mut *self.pending.borrow_mut());
        self.store.apply_batch(&ops)
    }

}

impl Drop for WriteBatcher<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush write batch on drop");
        }
    }
}
