//! Reader composition: the read path assembles a set of sorted mutation
//! sources (memtables, row cache, sstables) and merges them into one
//! stream, with admission control layered on the outside.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::config::TableId;
use crate::error::{StoreError, StoreResult};
use crate::memtable::Memtable;
use crate::metrics::{DbMetrics, TableMetrics};
use crate::mutation::{
    Cell, ClusteringKey, DecoratedKey, FrozenMutation, Mutation, PartitionData, PartitionRange,
    QuerySlice,
};
use crate::schema::Schema;
use crate::sstable::{filter_for_single_key, Sstable, SstableSet};

/// A stream of mutations ordered by decorated key.
///
/// `next_mutation` yields partitions in key order until exhausted.
/// `fast_forward_to` repositions a range reader onto a new partition range;
/// sources that only serve one range reject it.
pub trait MutationReader: Send {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>>;

    fn fast_forward_to(&mut self, range: PartitionRange) -> BoxFuture<'_, StoreResult<()>> {
        let _ = range;
        async { Err(StoreError::invalid_state("reader does not support fast-forward")) }.boxed()
    }
}

/// Reader over a range that is known to hold nothing, e.g. a range owned by
/// another shard.
pub struct EmptyReader;

impl MutationReader for EmptyReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        async { Ok(None) }.boxed()
    }

    fn fast_forward_to(&mut self, _range: PartitionRange) -> BoxFuture<'_, StoreResult<()>> {
        async { Ok(()) }.boxed()
    }
}

/// Streams one memtable. The partition snapshot is taken at construction,
/// so the reader stays consistent while the memtable keeps taking writes or
/// gets retired.
pub struct MemtableReader {
    schema: Arc<Schema>,
    memtable: Arc<Memtable>,
    entries: VecDeque<(DecoratedKey, PartitionData)>,
}

impl MemtableReader {
    pub fn new(memtable: Arc<Memtable>, range: &PartitionRange) -> Self {
        let schema = memtable.schema();
        let entries = memtable.partitions_in_range(range).into();
        Self {
            schema,
            memtable,
            entries,
        }
    }
}

impl MutationReader for MemtableReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        let next = self.entries.pop_front().map(|(key, partition)| Mutation {
            schema: self.schema.clone(),
            key,
            partition,
        });
        async move { Ok(next) }.boxed()
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> BoxFuture<'_, StoreResult<()>> {
        self.entries = self.memtable.partitions_in_range(&range).into();
        async { Ok(()) }.boxed()
    }
}

/// Single-partition sstable reader: runs the filter pipeline, fans out to
/// the surviving sstables in parallel and merges what comes back.
pub struct SingleKeyReader {
    schema: Arc<Schema>,
    sstables: Arc<SstableSet>,
    key: DecoratedKey,
    slice: QuerySlice,
    metrics: Arc<TableMetrics>,
    done: bool,
}

impl SingleKeyReader {
    pub fn new(
        schema: Arc<Schema>,
        sstables: Arc<SstableSet>,
        key: DecoratedKey,
        slice: QuerySlice,
        metrics: Arc<TableMetrics>,
    ) -> Self {
        Self {
            schema,
            sstables,
            key,
            slice,
            metrics,
            done: false,
        }
    }
}

impl MutationReader for SingleKeyReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        async move {
            if self.done {
                return Ok(None);
            }
            self.done = true;
            let range = PartitionRange::singular(self.key.clone());
            let candidates = filter_for_single_key(
                self.sstables.select(&range),
                &self.schema,
                &self.key,
                &self.slice,
                &self.metrics,
            );
            trace!(key = ?self.key.token, candidates = candidates.len(), "single-key sstable read");
            let reads = future::join_all(
                candidates
                    .iter()
                    .map(|sstable| sstable.read_partition(&self.key)),
            )
            .await;
            let mut merged: Option<PartitionData> = None;
            for read in reads {
                if let Some(partition) = read? {
                    match &mut merged {
                        Some(existing) => existing.apply(partition),
                        None => merged = Some(partition),
                    }
                }
            }
            Ok(merged.map(|partition| Mutation {
                schema: self.schema.clone(),
                key: self.key.clone(),
                partition,
            }))
        }
        .boxed()
    }
}

struct RangeEntry {
    sstable: Arc<Sstable>,
    /// Loaded lazily on first pull; reset when the reader fast-forwards.
    queue: Option<VecDeque<(DecoratedKey, PartitionData)>>,
}

/// Range reader over an sstable-set snapshot.
///
/// `fast_forward_to` computes the set difference between the sstables
/// selected for the old and new ranges and surgically adds and removes
/// per-sstable state, leaving unaffected entries in place.
pub struct RangeSstableReader {
    schema: Arc<Schema>,
    set: Arc<SstableSet>,
    range: PartitionRange,
    entries: Vec<RangeEntry>,
    /// `(shard_id, shard_count)`: partitions of shared sstables that hash
    /// to another shard are skipped.
    shard: (u32, u32),
}

impl RangeSstableReader {
    pub fn new(
        schema: Arc<Schema>,
        set: Arc<SstableSet>,
        range: PartitionRange,
        shard: (u32, u32),
    ) -> Self {
        let entries = set
            .select(&range)
            .into_iter()
            .map(|sstable| RangeEntry {
                sstable,
                queue: None,
            })
            .collect();
        Self {
            schema,
            set,
            range,
            entries,
            shard,
        }
    }

    async fn fill_queues(&mut self) -> StoreResult<()> {
        let (shard_id, shard_count) = self.shard;
        for entry in &mut self.entries {
            if entry.queue.is_none() {
                let mut rows = entry.sstable.scan_range(&self.range).await?;
                if entry.sstable.is_shared() {
                    rows.retain(|(key, _)| key.token.shard_of(shard_count) == shard_id);
                }
                entry.queue = Some(rows.into());
            }
        }
        Ok(())
    }
}

impl MutationReader for RangeSstableReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        async move {
            self.fill_queues().await?;
            let min_key = self
                .entries
                .iter()
                .filter_map(|e| e.queue.as_ref().and_then(|q| q.front()))
                .map(|(key, _)| key.clone())
                .min();
            let Some(min_key) = min_key else {
                return Ok(None);
            };
            let mut merged: Option<PartitionData> = None;
            for entry in &mut self.entries {
                let Some(queue) = entry.queue.as_mut() else {
                    continue;
                };
                if queue.front().map(|(key, _)| key == &min_key).unwrap_or(false) {
                    let (_, partition) = queue.pop_front().expect("front checked above");
                    match &mut merged {
                        Some(existing) => existing.apply(partition),
                        None => merged = Some(partition),
                    }
                }
            }
            Ok(merged.map(|partition| Mutation {
                schema: self.schema.clone(),
                key: min_key,
                partition,
            }))
        }
        .boxed()
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> BoxFuture<'_, StoreResult<()>> {
        let selected = self.set.select(&range);
        let mut next_entries = Vec::with_capacity(selected.len());
        for sstable in selected {
            let existing = self
                .entries
                .iter_mut()
                .find(|e| e.sstable.generation() == sstable.generation());
            match existing {
                Some(entry) => next_entries.push(RangeEntry {
                    sstable: entry.sstable.clone(),
                    queue: None,
                }),
                None => next_entries.push(RangeEntry {
                    sstable,
                    queue: None,
                }),
            }
        }
        self.entries = next_entries;
        self.range = range;
        async { Ok(()) }.boxed()
    }
}

/// Merges N key-ordered readers into one, reconciling partitions that
/// appear in several sources.
pub struct CombinedReader {
    readers: Vec<Box<dyn MutationReader>>,
    buffers: Vec<Option<Mutation>>,
}

impl CombinedReader {
    pub fn new(readers: Vec<Box<dyn MutationReader>>) -> Self {
        let buffers = readers.iter().map(|_| None).collect();
        Self { readers, buffers }
    }
}

impl MutationReader for CombinedReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        async move {
            for (reader, buffer) in self.readers.iter_mut().zip(self.buffers.iter_mut()) {
                if buffer.is_none() {
                    *buffer = reader.next_mutation().await?;
                }
            }
            let min_key = self
                .buffers
                .iter()
                .flatten()
                .map(|m| m.key.clone())
                .min();
            let Some(min_key) = min_key else {
                return Ok(None);
            };
            let mut merged: Option<Mutation> = None;
            for buffer in &mut self.buffers {
                if buffer.as_ref().map(|m| m.key == min_key).unwrap_or(false) {
                    let mutation = buffer.take().expect("buffer checked above");
                    match &mut merged {
                        Some(existing) => existing.partition.apply(mutation.partition),
                        None => merged = Some(mutation),
                    }
                }
            }
            Ok(merged)
        }
        .boxed()
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> BoxFuture<'_, StoreResult<()>> {
        async move {
            for buffer in &mut self.buffers {
                *buffer = None;
            }
            for reader in &mut self.readers {
                reader.fast_forward_to(range.clone()).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// Applies a predicate per mutation, e.g. shard ownership for shared
/// sstables.
pub struct FilteringReader {
    inner: Box<dyn MutationReader>,
    predicate: Arc<dyn Fn(&Mutation) -> bool + Send + Sync>,
}

impl FilteringReader {
    pub fn new(
        inner: Box<dyn MutationReader>,
        predicate: Arc<dyn Fn(&Mutation) -> bool + Send + Sync>,
    ) -> Self {
        Self { inner, predicate }
    }
}

impl MutationReader for FilteringReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        async move {
            loop {
                match self.inner.next_mutation().await? {
                    Some(mutation) if !(self.predicate)(&mutation) => continue,
                    other => return Ok(other),
                }
            }
        }
        .boxed()
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> BoxFuture<'_, StoreResult<()>> {
        self.inner.fast_forward_to(range)
    }
}

/// Admission settings shared by every restricted reader of one class.
#[derive(Clone)]
pub struct ReadConcurrencyConfig {
    pub semaphore: Arc<Semaphore>,
    pub queued: Arc<AtomicUsize>,
    pub max_queue_length: usize,
    pub timeout: Option<Duration>,
}

impl ReadConcurrencyConfig {
    pub fn new(max_concurrent: usize, max_queue_length: usize, timeout: Option<Duration>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            queued: Arc::new(AtomicUsize::new(0)),
            max_queue_length,
            timeout,
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

/// Gates a reader behind a concurrency semaphore with a queue-length cap.
/// Queueing past the cap fails with `Overloaded`; waiting past the timeout
/// fails with `Timeout` and releases the slot.
pub struct RestrictedReader {
    inner: Box<dyn MutationReader>,
    config: ReadConcurrencyConfig,
    db_metrics: Option<Arc<DbMetrics>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl RestrictedReader {
    pub fn new(
        inner: Box<dyn MutationReader>,
        config: ReadConcurrencyConfig,
        db_metrics: Option<Arc<DbMetrics>>,
    ) -> Self {
        Self {
            inner,
            config,
            db_metrics,
            permit: None,
        }
    }

    async fn admit(&mut self) -> StoreResult<()> {
        if self.permit.is_some() {
            return Ok(());
        }
        let must_queue = self.config.semaphore.available_permits() == 0;
        if must_queue {
            let queued = self.config.queued.fetch_add(1, Ordering::AcqRel) + 1;
            if queued > self.config.max_queue_length {
                self.config.queued.fetch_sub(1, Ordering::AcqRel);
                if let Some(metrics) = &self.db_metrics {
                    metrics.incr_read_queue_overloads();
                }
                return Err(StoreError::Overloaded);
            }
        }
        let acquire = self.config.semaphore.clone().acquire_owned();
        let permit = match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, acquire).await {
                Ok(result) => result,
                Err(_) => {
                    if must_queue {
                        self.config.queued.fetch_sub(1, Ordering::AcqRel);
                    }
                    return Err(StoreError::Timeout);
                }
            },
            None => acquire.await,
        };
        if must_queue {
            self.config.queued.fetch_sub(1, Ordering::AcqRel);
        }
        self.permit = Some(permit.map_err(|_| StoreError::Shutdown)?);
        Ok(())
    }
}

impl MutationReader for RestrictedReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        async move {
            self.admit().await?;
            self.inner.next_mutation().await
        }
        .boxed()
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> BoxFuture<'_, StoreResult<()>> {
        self.inner.fast_forward_to(range)
    }
}

/// A read request against one table.
#[derive(Clone, Debug)]
pub struct ReadCommand {
    pub table_id: TableId,
    pub slice: QuerySlice,
    pub row_limit: u32,
    pub partition_limit: u32,
    /// Query timestamp; reserved for expiry decisions.
    pub timestamp: i64,
}

impl ReadCommand {
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            slice: QuerySlice::full(),
            row_limit: u32::MAX,
            partition_limit: u32::MAX,
            timestamp: 0,
        }
    }
}

/// One partition of a cell-oriented result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultPartition {
    pub key: Vec<u8>,
    pub static_cells: Vec<(String, Cell)>,
    pub rows: Vec<(ClusteringKey, Vec<(String, Cell)>)>,
}

/// Cell-oriented result of a `query`.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub partitions: Vec<ResultPartition>,
    pub row_count: u32,
}

/// Mutation-oriented result for digest reconciliation.
#[derive(Clone, Debug, Default)]
pub struct ReconcilableResult {
    pub row_count: u32,
    pub mutations: Vec<FrozenMutation>,
}

/// Build the visible portion of a merged partition under `slice`. Returns
/// `None` when nothing is visible.
pub fn build_result_partition(mutation: &Mutation, slice: &QuerySlice) -> Option<ResultPartition> {
    let partition = &mutation.partition;
    let static_cells: Vec<(String, Cell)> = partition
        .static_row
        .live_cells(partition.tombstone)
        .map(|(name, cell)| (name.to_string(), cell.clone()))
        .collect();
    let rows: Vec<(ClusteringKey, Vec<(String, Cell)>)> = partition
        .live_rows()
        .into_iter()
        .filter(|(ck, _)| slice.clustering_ranges.iter().any(|r| r.contains(ck)))
        .collect();
    if rows.is_empty() && static_cells.is_empty() {
        return None;
    }
    Some(ResultPartition {
        key: mutation.key.key.clone(),
        static_cells,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DirtyMemoryManager, MemoryRegion};
    use crate::mutation::Tombstone;

    fn memtable_with(
        rows: &[(&[u8], &str, i64)],
    ) -> (Arc<Memtable>, Arc<Schema>) {
        let dirty = DirtyMemoryManager::new("test", 1 << 20, None);
        let schema = Arc::new(Schema::for_tests("ks", "cf"));
        let memtable = Memtable::new(schema.clone(), MemoryRegion::new(dirty.group().clone()));
        for (pk, ck, ts) in rows {
            let mut m = Mutation::new(schema.clone(), pk.to_vec());
            m.set_cell(
                vec![ck.as_bytes().to_vec()],
                "v",
                Cell::live(*ts, ts.to_string().into_bytes()),
            );
            memtable.apply(&m, crate::position::ReplayPosition::ZERO);
        }
        (memtable, schema)
    }

    async fn drain(reader: &mut dyn MutationReader) -> Vec<Mutation> {
        let mut out = Vec::new();
        while let Some(m) = reader.next_mutation().await.expect("read") {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn memtable_reader_streams_in_key_order() {
        let (memtable, _schema) = memtable_with(&[(b"b", "x", 1), (b"a", "x", 1), (b"c", "x", 1)]);
        let mut reader = MemtableReader::new(memtable, &PartitionRange::full());
        let out = drain(&mut reader).await;
        assert_eq!(out.len(), 3);
        for pair in out.windows(2) {
            assert!(pair[0].key < pair[1].key);
        }
    }

    #[tokio::test]
    async fn combined_reader_reconciles_across_sources() {
        let (older, _) = memtable_with(&[(b"k", "a", 10)]);
        let (newer, _) = memtable_with(&[(b"k", "a", 20), (b"other", "a", 5)]);
        let mut combined = CombinedReader::new(vec![
            Box::new(MemtableReader::new(older, &PartitionRange::full())),
            Box::new(MemtableReader::new(newer, &PartitionRange::full())),
        ]);
        let out = drain(&mut combined).await;
        assert_eq!(out.len(), 2);
        let k = out.iter().find(|m| m.key.key == b"k".to_vec()).unwrap();
        let row = k.partition.live_rows();
        assert_eq!(row.len(), 1);
        assert_eq!(row[0].1[0].1.timestamp, 20);
    }

    #[tokio::test]
    async fn combined_reader_honors_partition_tombstones() {
        let (data, schema) = memtable_with(&[(b"k", "a", 10)]);
        let dirty = DirtyMemoryManager::new("test2", 1 << 20, None);
        let deleter = Memtable::new(schema.clone(), MemoryRegion::new(dirty.group().clone()));
        let mut del = Mutation::new(schema, b"k".to_vec());
        del.partition_delete(Tombstone::new(20, 100));
        deleter.apply(&del, crate::position::ReplayPosition::ZERO);

        let mut combined = CombinedReader::new(vec![
            Box::new(MemtableReader::new(data, &PartitionRange::full())),
            Box::new(MemtableReader::new(deleter, &PartitionRange::full())),
        ]);
        let out = drain(&mut combined).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].partition.live_row_count(), 0);
    }

    #[tokio::test]
    async fn filtering_reader_skips_rejected_mutations() {
        let (memtable, _) = memtable_with(&[(b"keep", "a", 1), (b"drop", "a", 1)]);
        let mut reader = FilteringReader::new(
            Box::new(MemtableReader::new(memtable, &PartitionRange::full())),
            Arc::new(|m: &Mutation| m.key.key == b"keep".to_vec()),
        );
        let out = drain(&mut reader).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.key, b"keep".to_vec());
    }

    #[tokio::test]
    async fn restricted_reader_fails_overloaded_past_queue_cap() {
        let config = ReadConcurrencyConfig::new(1, 0, None);
        let permit = config
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("permit");

        let (memtable, _) = memtable_with(&[(b"k", "a", 1)]);
        let mut reader = RestrictedReader::new(
            Box::new(MemtableReader::new(memtable, &PartitionRange::full())),
            config,
            None,
        );
        let err = reader.next_mutation().await.unwrap_err();
        assert!(matches!(err, StoreError::Overloaded));
        drop(permit);
    }

    #[tokio::test]
    async fn restricted_reader_times_out_and_releases() {
        let config = ReadConcurrencyConfig::new(1, 8, Some(Duration::from_millis(20)));
        let permit = config
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("permit");

        let (memtable, _) = memtable_with(&[(b"k", "a", 1)]);
        let mut reader = RestrictedReader::new(
            Box::new(MemtableReader::new(memtable, &PartitionRange::full())),
            config.clone(),
            None,
        );
        let err = reader.next_mutation().await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout));
        assert_eq!(config.queued_len(), 0);
        drop(permit);
    }

    #[tokio::test]
    async fn build_result_applies_slice() {
        let (memtable, _) = memtable_with(&[(b"k", "a", 1), (b"k", "z", 1)]);
        let mut reader = MemtableReader::new(memtable, &PartitionRange::full());
        let m = reader.next_mutation().await.expect("read").expect("some");
        let slice = QuerySlice::for_key(vec![b"a".to_vec()]);
        let result = build_result_partition(&m, &slice).expect("visible");
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].0, vec![b"a".to_vec()]);

        let full = build_result_partition(&m, &QuerySlice::full()).expect("visible");
        assert_eq!(full.rows.len(), 2);
    }
}
