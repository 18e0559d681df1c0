//! One column family: its memtables, sstables, cache and the state
//! machines tying them together (flush, streaming ingest, directory probe,
//! snapshot, truncate).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{PartitionPresenceChecker, PresenceResult, RowCache};
use crate::config::{Generation, Priority, TableId};
use crate::error::{StoreError, StoreResult};
use crate::flush::FlushQueue;
use crate::fs;
use crate::memory::DirtyMemoryManager;
use crate::memtable::{
    wait_for_outcome, FlushBehavior, Memtable, MemtableList, SchemaSource, SealFn,
};
use crate::metrics::{DbMetrics, TableMetrics};
use crate::mutation::{
    DecoratedKey, FrozenMutation, Mutation, PartitionData, PartitionRange, QuerySlice,
};
use crate::position::ReplayPosition;
use crate::reader::{
    build_result_partition, CombinedReader, EmptyReader, MemtableReader, MutationReader,
    QueryResult, RangeSstableReader, ReadCommand, ReadConcurrencyConfig, ReconcilableResult,
    RestrictedReader, SingleKeyReader,
};
use crate::schema::Schema;
use crate::sstable::{codec, ComponentType, EntryDescriptor, Sstable, SstableSet, SSTABLE_VERSION};
use crate::streaming::StreamPlanId;
use crate::wal::CommitLog;

/// Background compaction seam. Submission is decoupled from execution; the
/// engine only tells the scheduler what became eligible.
pub trait CompactionScheduler: Send + Sync {
    fn submit(&self, table: TableId);
    fn submit_rewrite(&self, table: TableId, sstable: Arc<Sstable>);
    fn remove(&self, table: TableId) -> BoxFuture<'static, ()>;
    fn stop(&self) -> BoxFuture<'static, ()>;
}

/// Recording no-op scheduler; the default until a real compaction manager
/// is plugged in.
#[derive(Default)]
pub struct NoopCompaction {
    submissions: Mutex<Vec<TableId>>,
    rewrites: Mutex<Vec<(TableId, Generation)>>,
}

impl NoopCompaction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submissions(&self) -> Vec<TableId> {
        self.submissions.lock().clone()
    }

    pub fn rewrites(&self) -> Vec<(TableId, Generation)> {
        self.rewrites.lock().clone()
    }
}

impl CompactionScheduler for NoopCompaction {
    fn submit(&self, table: TableId) {
        self.submissions.lock().push(table);
    }

    fn submit_rewrite(&self, table: TableId, sstable: Arc<Sstable>) {
        self.rewrites.lock().push((table, sstable.generation()));
    }

    fn remove(&self, _table: TableId) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }

    fn stop(&self) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

/// Counter gate: tracks in-flight work so shutdown can wait it out.
#[derive(Default)]
struct Gate {
    count: AtomicUsize,
    drained: tokio::sync::Notify,
}

impl Gate {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Per-table configuration handed down by the database.
pub struct TableConfig {
    pub datadir: PathBuf,
    pub enable_disk_writes: bool,
    pub enable_cache: bool,
    pub enable_commitlog: bool,
    pub enable_incremental_backups: bool,
    pub max_cached_partition_size: u64,
    pub shard_id: u32,
    pub shard_count: u32,
    pub dirty_memory_manager: Arc<DirtyMemoryManager>,
    pub streaming_dirty_memory_manager: Arc<DirtyMemoryManager>,
    pub read_concurrency: ReadConcurrencyConfig,
    pub streaming_read_concurrency: ReadConcurrencyConfig,
    pub flush_retry_delay: Duration,
    pub delayed_streaming_flush_interval: Duration,
    pub snapshots: Arc<fs::SnapshotCoordinator>,
    pub db_metrics: Option<Arc<DbMetrics>>,
}

/// Accumulates the sstables of one fragmented (large-partition) stream
/// plan; committed atomically when the plan completes.
struct StreamingBigEntry {
    memtables: Arc<MemtableList>,
    sstables: Mutex<Vec<Arc<Sstable>>>,
    flush_in_progress: Gate,
}

type StreamingOutcome = Option<Result<(), String>>;

struct StreamingFlushState {
    timer: Option<JoinHandle<()>>,
    waiters_tx: watch::Sender<StreamingOutcome>,
    waiters_rx: watch::Receiver<StreamingOutcome>,
}

impl StreamingFlushState {
    fn new() -> Self {
        let (waiters_tx, waiters_rx) = watch::channel(None);
        Self {
            timer: None,
            waiters_tx,
            waiters_rx,
        }
    }
}

/// Sizes of one snapshot: bytes exclusively held by the snapshot (`live`)
/// and total linked bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotDetails {
    pub total: u64,
    pub live: u64,
}

/// A table: schema plus all of its per-shard persistent state.
pub struct ColumnFamily {
    schema: Arc<RwLock<Arc<Schema>>>,
    config: TableConfig,
    memtables: Arc<MemtableList>,
    streaming_memtables: Arc<MemtableList>,
    streaming_big: Mutex<HashMap<StreamPlanId, Arc<StreamingBigEntry>>>,
    sstables: RwLock<Arc<SstableSet>>,
    /// Compacted away but not yet confirmed deleted; still considered for
    /// tombstone-retention decisions.
    compacted_not_deleted: Mutex<Vec<Arc<Sstable>>>,
    /// Shared sstables found at load, to be split once startup completes.
    need_rewrite: Mutex<Vec<Arc<Sstable>>>,
    cache: Arc<RowCache>,
    commitlog: Option<Arc<dyn CommitLog>>,
    compaction: Arc<dyn CompactionScheduler>,
    flush_queue: FlushQueue,
    /// Held for read by flushes, compactions and truncation so sstable
    /// directory changes serialize against exclusive maintenance.
    sstables_lock: tokio::sync::RwLock<()>,
    highest_flushed_rp: Mutex<ReplayPosition>,
    sstables_known_generation: AtomicU64,
    compaction_disabled: AtomicU32,
    streaming_flush: Mutex<StreamingFlushState>,
    streaming_flush_gate: Gate,
    sstable_deletion_gate: Gate,
    metrics: Arc<TableMetrics>,
    shutdown: CancellationToken,
}

impl ColumnFamily {
    pub fn new(
        schema: Arc<Schema>,
        config: TableConfig,
        commitlog: Option<Arc<dyn CommitLog>>,
        compaction: Arc<dyn CompactionScheduler>,
    ) -> Arc<Self> {
        if !config.enable_disk_writes {
            warn!(ks = %schema.ks_name, cf = %schema.cf_name,
                  "writes disabled, column family not durable");
        }
        let table = Arc::new_cyclic(|weak: &Weak<ColumnFamily>| {
            let schema_holder = Arc::new(RwLock::new(schema.clone()));
            let schema_source: SchemaSource = {
                let holder = schema_holder.clone();
                Arc::new(move || holder.read().clone())
            };
            let schema = schema_holder.clone();
            let memtables = if config.enable_disk_writes {
                Self::make_memtable_list(
                    weak.clone(),
                    schema_source.clone(),
                    config.dirty_memory_manager.clone(),
                )
            } else {
                Self::make_memory_only_memtable_list(
                    schema_source.clone(),
                    config.dirty_memory_manager.clone(),
                )
            };
            let streaming_memtables = if config.enable_disk_writes {
                Self::make_streaming_memtable_list(
                    weak.clone(),
                    schema_source.clone(),
                    config.streaming_dirty_memory_manager.clone(),
                )
            } else {
                Self::make_memory_only_memtable_list(
                    schema_source.clone(),
                    config.streaming_dirty_memory_manager.clone(),
                )
            };
            let cache = Arc::new(RowCache::new(
                schema_holder.read().clone(),
                config.max_cached_partition_size,
            ));
            ColumnFamily {
                schema,
                memtables,
                streaming_memtables,
                streaming_big: Mutex::new(HashMap::new()),
                sstables: RwLock::new(Arc::new(SstableSet::new())),
                compacted_not_deleted: Mutex::new(Vec::new()),
                need_rewrite: Mutex::new(Vec::new()),
                cache,
                commitlog: if config.enable_commitlog {
                    commitlog
                } else {
                    None
                },
                compaction,
                flush_queue: FlushQueue::new(),
                sstables_lock: tokio::sync::RwLock::new(()),
                highest_flushed_rp: Mutex::new(ReplayPosition::ZERO),
                sstables_known_generation: AtomicU64::new(0),
                compaction_disabled: AtomicU32::new(0),
                streaming_flush: Mutex::new(StreamingFlushState::new()),
                streaming_flush_gate: Gate::default(),
                sstable_deletion_gate: Gate::default(),
                metrics: Arc::new(TableMetrics::default()),
                shutdown: CancellationToken::new(),
                config,
            }
        });
        table
            .config
            .dirty_memory_manager
            .register_memtable_list(&table.memtables);
        table
            .config
            .streaming_dirty_memory_manager
            .register_memtable_list(&table.streaming_memtables);
        table
    }

    fn make_memtable_list(
        weak: Weak<ColumnFamily>,
        schema_source: SchemaSource,
        dirty: Arc<DirtyMemoryManager>,
    ) -> Arc<MemtableList> {
        let seal: SealFn = Arc::new(move |behavior| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(table) => table.seal_active_memtable(behavior).await,
                    None => Ok(()),
                }
            }
            .boxed()
        });
        MemtableList::new(seal, schema_source, dirty)
    }

    fn make_streaming_memtable_list(
        weak: Weak<ColumnFamily>,
        schema_source: SchemaSource,
        dirty: Arc<DirtyMemoryManager>,
    ) -> Arc<MemtableList> {
        let seal: SealFn = Arc::new(move |behavior| {
            let weak = weak.clone();
            async move {
                let Some(table) = weak.upgrade() else {
                    return Ok(());
                };
                match behavior {
                    FlushBehavior::Immediate => {
                        table.seal_active_streaming_memtable_immediate().await
                    }
                    FlushBehavior::Delayed => {
                        table.seal_active_streaming_memtable_delayed().await
                    }
                }
            }
            .boxed()
        });
        MemtableList::new(seal, schema_source, dirty)
    }

    fn make_memory_only_memtable_list(
        schema_source: SchemaSource,
        dirty: Arc<DirtyMemoryManager>,
    ) -> Arc<MemtableList> {
        let seal: SealFn = Arc::new(|_behavior| async { Ok(()) }.boxed());
        MemtableList::new(seal, schema_source, dirty)
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.read().clone()
    }

    pub fn id(&self) -> TableId {
        self.schema.read().id
    }

    pub fn metrics(&self) -> &Arc<TableMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<RowCache> {
        &self.cache
    }

    pub fn datadir(&self) -> &Path {
        &self.config.datadir
    }

    pub fn highest_flushed_rp(&self) -> ReplayPosition {
        *self.highest_flushed_rp.lock()
    }

    /// The commitlog this table writes through, if durable.
    pub fn commitlog(&self) -> Option<Arc<dyn CommitLog>> {
        self.commitlog.clone()
    }

    pub fn sstables_count(&self) -> usize {
        self.sstables.read().len()
    }

    pub fn memtable_count(&self) -> usize {
        self.memtables.len()
    }

    /// Current sstable set snapshot.
    pub fn sstable_set(&self) -> Arc<SstableSet> {
        self.sstables.read().clone()
    }

    /// All sstables including compacted-but-not-deleted ones. As long as a
    /// compacted table is not confirmed deleted, compaction must not GC a
    /// tombstone that covers data in it.
    pub fn sstables_including_compacted_undeleted(&self) -> Vec<Arc<Sstable>> {
        let mut all: Vec<Arc<Sstable>> = self.sstables.read().iter().cloned().collect();
        all.extend(self.compacted_not_deleted.lock().iter().cloned());
        all
    }

    // ---- write path ----

    pub fn check_valid_rp(&self, rp: ReplayPosition) -> StoreResult<()> {
        if !rp.is_zero() && rp < *self.highest_flushed_rp.lock() {
            return Err(StoreError::ReplayPositionReordered);
        }
        Ok(())
    }

    pub fn apply(&self, mutation: &Mutation, rp: ReplayPosition) -> StoreResult<()> {
        self.check_valid_rp(rp)?;
        self.memtables.active().apply(mutation, rp);
        self.metrics.incr_writes();
        Ok(())
    }

    pub fn apply_frozen(&self, mutation: &FrozenMutation, rp: ReplayPosition) -> StoreResult<()> {
        self.check_valid_rp(rp)?;
        self.memtables.active().apply_frozen(mutation, rp);
        self.metrics.incr_writes();
        Ok(())
    }

    pub fn apply_streaming_mutation(
        self: &Arc<Self>,
        plan_id: StreamPlanId,
        mutation: &FrozenMutation,
        fragmented: bool,
    ) {
        if fragmented {
            self.apply_streaming_big_mutation(plan_id, mutation);
            return;
        }
        self.streaming_memtables
            .active()
            .apply_frozen(mutation, ReplayPosition::ZERO);
    }

    fn apply_streaming_big_mutation(self: &Arc<Self>, plan_id: StreamPlanId, m: &FrozenMutation) {
        let entry = {
            let mut plans = self.streaming_big.lock();
            plans
                .entry(plan_id)
                .or_insert_with(|| self.new_streaming_big_entry(plan_id))
                .clone()
        };
        entry.memtables.active().apply_frozen(m, ReplayPosition::ZERO);
    }

    fn new_streaming_big_entry(self: &Arc<Self>, plan_id: StreamPlanId) -> Arc<StreamingBigEntry> {
        let weak = Arc::downgrade(self);
        let schema_source: SchemaSource = {
            let holder = self.clone();
            Arc::new(move || holder.schema())
        };
        let seal: SealFn = Arc::new(move |_behavior| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(table) => table.seal_active_streaming_memtable_big(plan_id).await,
                    None => Ok(()),
                }
            }
            .boxed()
        });
        let memtables = if self.config.enable_disk_writes {
            MemtableList::new(
                seal,
                schema_source,
                self.config.streaming_dirty_memory_manager.clone(),
            )
        } else {
            Self::make_memory_only_memtable_list(
                schema_source,
                self.config.streaming_dirty_memory_manager.clone(),
            )
        };
        Arc::new(StreamingBigEntry {
            memtables,
            sstables: Mutex::new(Vec::new()),
            flush_in_progress: Gate::default(),
        })
    }

    // ---- flush state machine ----

    fn calculate_generation_for_new_table(&self) -> Generation {
        Generation::new(
            self.sstables_known_generation
                .fetch_add(1, Ordering::AcqRel)
                + 1,
        )
    }

    fn update_sstables_known_generation(&self, generation: Generation) {
        let mut current = self.sstables_known_generation.load(Ordering::Acquire);
        while current < generation.as_u64() {
            match self.sstables_known_generation.compare_exchange(
                current,
                generation.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Seal the active memtable and drive it through the flush pipeline:
    /// detach, flush to a fresh sstable (retrying on I/O failure), move to
    /// cache, retire, and discard commitlog segments in position order.
    pub fn seal_active_memtable(
        self: &Arc<Self>,
        _behavior: FlushBehavior,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let table = self.clone();
        async move {
            let old = table.memtables.active();
            let schema = table.schema();
            debug!(ks = %schema.ks_name, cf = %schema.cf_name,
                   partitions = old.partition_count(), occupancy = old.occupancy(),
                   "sealing active memtable");
            if old.is_empty() {
                debug!("memtable is empty");
                return Ok(());
            }
            table.memtables.add_memtable();
            table.metrics.incr_memtable_switch();

            let old_rp = old.replay_position();
            {
                let mut highest = table.highest_flushed_rp.lock();
                assert!(
                    *highest <= old_rp || old_rp.is_zero(),
                    "replay position went backwards: {} < {}",
                    old_rp,
                    *highest
                );
                if !old_rp.is_zero() {
                    *highest = old_rp;
                }
            }

            let bytes = old.occupancy();
            table.metrics.flush_started(bytes);
            let task_table = table.clone();
            let task_old = old.clone();
            let post_commitlog = table.commitlog.clone();
            let post_id = schema.id;
            let result = table
                .flush_queue
                .run_with_ordered_post_op(
                    old_rp,
                    async move { task_table.try_flush_until_success(task_old).await },
                    move || {
                        if let Some(commitlog) = post_commitlog {
                            commitlog.discard_completed_segments(post_id, old_rp);
                        }
                    },
                )
                .await;
            table.metrics.flush_finished(bytes);
            result
        }
        .boxed()
    }

    /// Retry loop around one flush attempt. Dirty memory cannot be released
    /// until the memtable is durable, so I/O failures retry until success
    /// or shutdown.
    async fn try_flush_memtable_to_sstable(self: &Arc<Self>, old: &Arc<Memtable>) -> StoreResult<()> {
        let generation = self.calculate_generation_for_new_table();
        let schema = self.schema();
        let newtab = codec::write_components(
            &schema,
            &self.config.datadir,
            generation,
            old.all_partitions(),
            old.replay_position(),
        )
        .await?;
        newtab.set_unshared();
        debug!(generation = generation.as_u64(), "flush write done");

        self.maybe_backup(&newtab).await?;

        // From here to the cache transfer there is no failure path that
        // leaves the memtable resident, so the flush stops needing this
        // memory now: hand the selection permit back so the next flush can
        // be picked, and let queued writes stop waiting.
        self.config
            .dirty_memory_manager
            .remove_from_flush_manager(old.region());
        old.region().release_virtual();

        // The sstable must be in the set before update_cache: once the
        // memtable moves into the cache its data may be evicted any time.
        self.add_sstable(newtab.clone());
        old.mark_flushed(newtab.clone());
        self.trigger_compaction();

        if let Err(err) = self.update_cache(old, newtab.clone()).await {
            error!(generation = generation.as_u64(), error = %err,
                   "failed to move memtable to cache");
        }
        self.memtables.erase(old);
        debug!(generation = generation.as_u64(), "memtable replaced");
        Ok(())
    }

    async fn try_flush_until_success(self: Arc<Self>, old: Arc<Memtable>) -> StoreResult<()> {
        loop {
            let attempt = {
                let _guard = self.sstables_lock.read().await;
                self.try_flush_memtable_to_sstable(&old).await
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // The failed attempt no longer holds the memory; free
                    // the selection slot so other flushes are not pinned
                    // behind the retry.
                    self.config
                        .dirty_memory_manager
                        .remove_from_flush_manager(old.region());
                    error!(error = %err, "failed to write sstable");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.flush_retry_delay) => {}
                        _ = self.shutdown.cancelled() => return Err(StoreError::Shutdown),
                    }
                }
            }
        }
    }

    fn add_sstable(&self, sstable: Arc<Sstable>) {
        // Replace the pointer, never mutate in place: in-progress reads
        // keep their snapshot.
        let mut guard = self.sstables.write();
        let mut next = (**guard).clone();
        self.metrics.add_live_sstable(sstable.bytes_on_disk());
        next.insert(sstable);
        *guard = Arc::new(next);
    }

    pub(crate) fn make_partition_presence_checker(
        &self,
        exclude: Option<Arc<Sstable>>,
    ) -> PartitionPresenceChecker {
        let set = self.sstables.read().clone();
        Box::new(move |key| {
            for sstable in set.iter() {
                if let Some(excluded) = &exclude {
                    if sstable.generation() == excluded.generation() {
                        continue;
                    }
                }
                if sstable.filter_has_key(key) {
                    return PresenceResult::MaybeExists;
                }
            }
            PresenceResult::DefinitelyDoesntExist
        })
    }

    async fn update_cache(&self, old: &Memtable, exclude: Arc<Sstable>) -> StoreResult<()> {
        if !self.config.enable_cache {
            return Ok(());
        }
        let checker = self.make_partition_presence_checker(Some(exclude));
        self.cache.update(old, checker).await
    }

    async fn maybe_backup(&self, sstable: &Arc<Sstable>) -> StoreResult<()> {
        if !self.config.enable_incremental_backups {
            return Ok(());
        }
        let backups = fs::backups_dir(&self.config.datadir);
        tokio::fs::create_dir_all(&backups).await?;
        sstable.create_links(&backups).await
    }

    pub fn trigger_compaction(&self) {
        if self.compaction_disabled.load(Ordering::Acquire) == 0 {
            self.compaction.submit(self.id());
        }
    }

    // ---- streaming seals ----

    /// Seal the active streaming memtable now and write it out.
    ///
    /// Differs from the main flush in three ways: no cache transfer (the
    /// streaming code invalidates the ranges it touched), no commitlog
    /// position to maintain, and no retry loop: a failed write fails the
    /// stream and the sender deals with it.
    pub fn seal_active_streaming_memtable_immediate(
        self: &Arc<Self>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let table = self.clone();
        async move {
            let old = table.streaming_memtables.active();
            if old.is_empty() {
                return Ok(());
            }
            table.streaming_memtables.add_memtable();
            table.streaming_memtables.erase(&old);

            let waiters_tx = {
                let mut state = table.streaming_flush.lock();
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                let (tx, rx) = watch::channel(None);
                state.waiters_rx = rx;
                std::mem::replace(&mut state.waiters_tx, tx)
            };

            table.streaming_flush_gate.enter();
            let result: StoreResult<()> = async {
                let _guard = table.sstables_lock.read().await;
                let generation = table.calculate_generation_for_new_table();
                let schema = table.schema();
                let newtab = codec::write_components(
                    &schema,
                    &table.config.datadir,
                    generation,
                    old.all_partitions(),
                    ReplayPosition::ZERO,
                )
                .await?;
                newtab.set_unshared();
                table.maybe_backup(&newtab).await?;
                old.region().release_virtual();
                table.add_sstable(newtab);
                table.trigger_compaction();
                Ok(())
            }
            .await;
            table.streaming_flush_gate.leave();

            if let Err(err) = &result {
                error!(error = %err, "failed to write streamed sstable");
            }
            let _ = waiters_tx.send(Some(match &result {
                Ok(()) => Ok(()),
                Err(err) => Err(err.to_string()),
            }));
            result
        }
        .boxed()
    }

    /// Seal the active streaming memtable within a bounded delay, batching
    /// with mutations that arrive in the meantime.
    ///
    /// Coalescing means mutations for one range can land in two different
    /// memtables; the completion covers the memtable that was active when
    /// the caller arrived, and the timer bounds the wait.
    pub fn seal_active_streaming_memtable_delayed(
        self: &Arc<Self>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let table = self.clone();
        async move {
            if table.streaming_memtables.active_is_empty() {
                return Ok(());
            }
            let rx = {
                let mut state = table.streaming_flush.lock();
                if state.timer.is_none() {
                    // The sender will not push more mutations until we
                    // respond, so don't sit on them for long.
                    let timer_table = table.clone();
                    state.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(
                            timer_table.config.delayed_streaming_flush_interval,
                        )
                        .await;
                        // Clear our own handle first: the seal below must
                        // not abort the task it is running on.
                        timer_table.streaming_flush.lock().timer = None;
                        let _ = timer_table
                            .seal_active_streaming_memtable_immediate()
                            .await;
                    }));
                }
                state.waiters_rx.clone()
            };
            table.streaming_flush_gate.enter();
            let result = wait_for_outcome(rx).await;
            table.streaming_flush_gate.leave();
            result
        }
        .boxed()
    }

    /// Seal one plan's large-partition streaming memtable. The sstable is
    /// kept aside with the plan; nothing becomes readable until the plan
    /// commits.
    pub fn seal_active_streaming_memtable_big(
        self: &Arc<Self>,
        plan_id: StreamPlanId,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let table = self.clone();
        async move {
            let entry = {
                let plans = table.streaming_big.lock();
                match plans.get(&plan_id) {
                    Some(entry) => entry.clone(),
                    None => return Ok(()),
                }
            };
            let old = entry.memtables.active();
            if old.is_empty() {
                return Ok(());
            }
            entry.memtables.add_memtable();
            entry.memtables.erase(&old);

            table.streaming_flush_gate.enter();
            entry.flush_in_progress.enter();
            let result = async {
                let _guard = table.sstables_lock.read().await;
                let generation = table.calculate_generation_for_new_table();
                let schema = table.schema();
                let newtab = codec::write_components(
                    &schema,
                    &table.config.datadir,
                    generation,
                    old.all_partitions(),
                    ReplayPosition::ZERO,
                )
                .await?;
                newtab.set_unshared();
                table.maybe_backup(&newtab).await?;
                old.region().release_virtual();
                entry.sstables.lock().push(newtab);
                Ok(())
            }
            .await;
            entry.flush_in_progress.leave();
            table.streaming_flush_gate.leave();
            if let Err(err) = &result {
                error!(error = %err, plan = %plan_id, "failed to write streamed sstable");
            }
            result
        }
        .boxed()
    }

    /// Flush everything a stream plan applied and make it readable;
    /// invalidates the cache over the ranges the stream touched.
    pub async fn flush_streaming_mutations(
        self: &Arc<Self>,
        plan_id: StreamPlanId,
        ranges: Vec<PartitionRange>,
    ) -> StoreResult<()> {
        self.streaming_flush_gate.enter();
        let result = async {
            self.flush_streaming_big_mutations(plan_id).await?;
            self.streaming_memtables.seal(FlushBehavior::Delayed).await
        }
        .await;
        self.streaming_flush_gate.leave();

        if self.config.enable_cache {
            for range in &ranges {
                self.cache.invalidate(range);
            }
        }
        result
    }

    async fn flush_streaming_big_mutations(
        self: &Arc<Self>,
        plan_id: StreamPlanId,
    ) -> StoreResult<()> {
        let entry = {
            let mut plans = self.streaming_big.lock();
            match plans.remove(&plan_id) {
                Some(entry) => entry,
                None => return Ok(()),
            }
        };
        entry.memtables.request_flush().await?;
        entry.flush_in_progress.wait_drained().await;
        let sstables: Vec<Arc<Sstable>> = std::mem::take(&mut *entry.sstables.lock());
        for sstable in sstables {
            self.add_sstable(sstable);
        }
        self.trigger_compaction();
        Ok(())
    }

    /// Abort a stream plan, dropping whatever it staged.
    pub async fn fail_streaming_mutations(&self, plan_id: StreamPlanId) -> StoreResult<()> {
        let entry = {
            let mut plans = self.streaming_big.lock();
            match plans.remove(&plan_id) {
                Some(entry) => entry,
                None => return Ok(()),
            }
        };
        entry.flush_in_progress.wait_drained().await;
        let sstables: Vec<Arc<Sstable>> = std::mem::take(&mut *entry.sstables.lock());
        if !sstables.is_empty() {
            if let Err(err) = codec::delete_atomically(&sstables).await {
                warn!(plan = %plan_id, error = %err, "failed to delete aborted stream sstables");
            }
        }
        Ok(())
    }

    // ---- read path ----

    /// Assemble the reader ensemble for `range`: every memtable (oldest to
    /// newest), then the row cache for cached singular reads or the sstable
    /// reader otherwise, merged and gated by the read-concurrency class for
    /// `priority`.
    ///
    /// Range reads always merge memtables with the sstable reader; the row
    /// cache serves only singular reads.
    pub fn make_reader(
        &self,
        range: PartitionRange,
        slice: QuerySlice,
        priority: Priority,
    ) -> Box<dyn MutationReader> {
        let mut readers: Vec<Box<dyn MutationReader>> = Vec::new();
        for memtable in self.memtables.all() {
            readers.push(Box::new(MemtableReader::new(memtable, &range)));
        }
        match (&range, self.config.enable_cache) {
            (PartitionRange::Singular(key), true) => {
                // Foreign tokens read as empty here just as they do on the
                // sstable path, or a shared sstable could leak another
                // shard's rows through the cache.
                if key.token.shard_of(self.config.shard_count) != self.config.shard_id {
                    readers.push(Box::new(EmptyReader));
                } else {
                    readers.push(Box::new(self.cache.make_single_key_reader(
                        key.clone(),
                        self.sstables.read().clone(),
                        self.metrics.clone(),
                    )));
                }
            }
            _ => {
                readers.push(self.make_sstable_reader(&range, &slice));
            }
        }
        let combined = CombinedReader::new(readers);
        let concurrency = match priority {
            Priority::Streaming => self.config.streaming_read_concurrency.clone(),
            _ => self.config.read_concurrency.clone(),
        };
        Box::new(RestrictedReader::new(
            Box::new(combined),
            concurrency,
            self.config.db_metrics.clone(),
        ))
    }

    /// Reader over sstables only (no cache). Singular ranges for tokens
    /// owned by another shard read as empty.
    pub fn make_sstable_reader(
        &self,
        range: &PartitionRange,
        slice: &QuerySlice,
    ) -> Box<dyn MutationReader> {
        let set = self.sstables.read().clone();
        let schema = self.schema();
        match range {
            PartitionRange::Singular(key) => {
                if key.token.shard_of(self.config.shard_count) != self.config.shard_id {
                    return Box::new(EmptyReader);
                }
                Box::new(SingleKeyReader::new(
                    schema,
                    set,
                    key.clone(),
                    slice.clone(),
                    self.metrics.clone(),
                ))
            }
            PartitionRange::Tokens(_) => Box::new(RangeSstableReader::new(
                schema,
                set,
                range.clone(),
                (self.config.shard_id, self.config.shard_count),
            )),
        }
    }

    /// Full-fidelity reader for outbound streaming: all memtables plus
    /// sstables, gated by the streaming read-concurrency class.
    pub fn make_streaming_reader(&self, range: PartitionRange) -> Box<dyn MutationReader> {
        let mut readers: Vec<Box<dyn MutationReader>> = Vec::new();
        for memtable in self.memtables.all() {
            readers.push(Box::new(MemtableReader::new(memtable, &range)));
        }
        readers.push(self.make_sstable_reader(&range, &QuerySlice::full()));
        Box::new(RestrictedReader::new(
            Box::new(CombinedReader::new(readers)),
            self.config.streaming_read_concurrency.clone(),
            self.config.db_metrics.clone(),
        ))
    }

    /// Cell-oriented query across `ranges` with row/partition limits.
    pub async fn query(
        &self,
        cmd: &ReadCommand,
        ranges: &[PartitionRange],
    ) -> StoreResult<QueryResult> {
        self.metrics.incr_reads();
        let mut result = QueryResult::default();
        let mut rows_left = cmd.row_limit;
        let mut partitions_left = cmd.partition_limit;
        for range in ranges {
            if rows_left == 0 || partitions_left == 0 {
                break;
            }
            let mut reader = self.make_reader(range.clone(), cmd.slice.clone(), Priority::User);
            while let Some(mutation) = reader.next_mutation().await? {
                let Some(mut partition) = build_result_partition(&mutation, &cmd.slice) else {
                    continue;
                };
                if (partition.rows.len() as u32) > rows_left {
                    partition.rows.truncate(rows_left as usize);
                }
                let live_rows = (partition.rows.len() as u32).max(1);
                result.row_count += live_rows;
                rows_left = rows_left.saturating_sub(live_rows);
                partitions_left -= 1;
                result.partitions.push(partition);
                if rows_left == 0 || partitions_left == 0 {
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Mutation-oriented query over one range, for digest reconciliation.
    pub async fn query_mutations(
        &self,
        cmd: &ReadCommand,
        range: PartitionRange,
    ) -> StoreResult<ReconcilableResult> {
        self.metrics.incr_reads();
        let mut result = ReconcilableResult::default();
        let mut rows_left = cmd.row_limit;
        let mut partitions_left = cmd.partition_limit;
        let mut reader = self.make_reader(range, cmd.slice.clone(), Priority::User);
        while rows_left > 0 && partitions_left > 0 {
            let Some(mutation) = reader.next_mutation().await? else {
                break;
            };
            let live_rows = mutation.partition.live_row_count() as u32;
            if live_rows == 0 && mutation.partition.is_empty() {
                continue;
            }
            result.row_count += live_rows.min(rows_left);
            rows_left = rows_left.saturating_sub(live_rows.max(1));
            partitions_left -= 1;
            result.mutations.push(mutation.freeze());
        }
        Ok(result)
    }

    /// Look up one partition; merges every source. Test-oriented.
    pub async fn find_partition(&self, key: &DecoratedKey) -> StoreResult<Option<PartitionData>> {
        let mut reader = self.make_reader(
            PartitionRange::singular(key.clone()),
            QuerySlice::full(),
            Priority::User,
        );
        Ok(reader.next_mutation().await?.map(|m| m.partition))
    }

    /// Look up one row of one partition. Test-oriented.
    pub async fn find_row(
        &self,
        key: &DecoratedKey,
        ck: &crate::mutation::ClusteringKey,
    ) -> StoreResult<Option<crate::mutation::Row>> {
        let partition = self.find_partition(key).await?;
        Ok(partition.and_then(|p| p.rows.get(ck).cloned()))
    }

    /// Run `f` over every partition until it returns false. Test-oriented.
    pub async fn for_all_partitions<F>(&self, mut f: F) -> StoreResult<bool>
    where
        F: FnMut(&DecoratedKey, &PartitionData) -> bool,
    {
        let mut reader = self.make_reader(
            PartitionRange::full(),
            QuerySlice::full(),
            Priority::System,
        );
        while let Some(mutation) = reader.next_mutation().await? {
            if !f(&mutation.key, &mutation.partition) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ---- flush entry points ----

    /// Flush the active memtable and wait for every earlier flush's
    /// commitlog discard.
    pub async fn flush(&self) -> StoreResult<()> {
        // If the active memtable has data, its position is the newest;
        // otherwise the high-water mark from the last flush is.
        let desired_rp = if self.memtables.active_is_empty() {
            *self.highest_flushed_rp.lock()
        } else {
            self.memtables.active().replay_position()
        };
        let result = self.memtables.request_flush().await;
        self.flush_queue.wait_for_pending(desired_rp).await;
        result
    }

    /// Commitlog pressure path: flush if anything at or below `pos` is
    /// still unflushed.
    pub async fn flush_up_to(&self, pos: ReplayPosition) -> StoreResult<()> {
        if pos < *self.highest_flushed_rp.lock() {
            return Ok(());
        }
        self.memtables.request_flush().await
    }

    // ---- directory probe ----

    /// Scan the table directory and load every complete generation.
    ///
    /// A lone temporary TOC is a crashed write: shard 0 removes its files.
    /// Components without any TOC fail the boot. Temporary statistics are
    /// removed unconditionally.
    pub async fn populate(self: &Arc<Self>) -> StoreResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum GenStatus {
            HasSomeFile,
            HasTocFile,
            HasTemporaryTocFile,
        }

        let files = fs::list_files(&self.config.datadir).await?;
        let mut statuses: HashMap<Generation, GenStatus> = HashMap::new();
        let mut versions: HashMap<Generation, String> = HashMap::new();
        for file_name in files {
            if fs::is_manifest(&file_name) {
                continue;
            }
            let descriptor = EntryDescriptor::make_descriptor(&file_name)?;
            versions
                .entry(descriptor.generation)
                .or_insert_with(|| descriptor.version.clone());
            if descriptor.component == ComponentType::TemporaryStatistics {
                tokio::fs::remove_file(self.config.datadir.join(&file_name)).await?;
                continue;
            }
            let status = statuses
                .entry(descriptor.generation)
                .or_insert(GenStatus::HasSomeFile);
            match descriptor.component {
                ComponentType::Toc => {
                    if *status == GenStatus::HasTocFile {
                        return Err(StoreError::malformed_sstable(
                            &file_name,
                            "TOC file already processed",
                        ));
                    }
                    *status = GenStatus::HasTocFile;
                }
                ComponentType::TemporaryToc => {
                    if *status != GenStatus::HasTocFile {
                        *status = GenStatus::HasTemporaryTocFile;
                    }
                }
                _ => {}
            }
        }

        let schema = self.schema();
        let mut generations: Vec<Generation> = statuses.keys().copied().collect();
        generations.sort();
        for generation in generations {
            self.update_sstables_known_generation(generation);
            let version = versions
                .get(&generation)
                .cloned()
                .unwrap_or_else(|| SSTABLE_VERSION.to_string());
            match statuses[&generation] {
                GenStatus::HasTemporaryTocFile => {
                    if self.config.shard_id != 0 {
                        debug!(generation = generation.as_u64(),
                               "partial sstable not relevant for this shard, ignoring");
                        continue;
                    }
                    info!(generation = generation.as_u64(),
                          "removing partial sstable left by a crashed write");
                    codec::remove_components(
                        &self.config.datadir,
                        &schema.ks_name,
                        &schema.cf_name,
                        &version,
                        generation,
                    )
                    .await?;
                }
                GenStatus::HasSomeFile => {
                    return Err(StoreError::malformed_sstable(
                        format!("generation {generation}"),
                        format!(
                            "at directory {}: no TOC found. Refusing to boot",
                            self.config.datadir.display()
                        ),
                    ));
                }
                GenStatus::HasTocFile => {
                    self.load_sstable_generation(&version, generation, false)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn load_sstable_generation(
        self: &Arc<Self>,
        version: &str,
        generation: Generation,
        reset_level: bool,
    ) -> StoreResult<()> {
        if self.sstables.read().contains_generation(generation) {
            return Err(StoreError::malformed_sstable(
                format!("generation {generation}"),
                "attempted to add sstable generation twice",
            ));
        }
        let schema = self.schema();
        let sstable = match codec::open(
            &self.config.datadir,
            &schema.ks_name,
            &schema.cf_name,
            version,
            generation,
        )
        .await
        {
            Ok(sstable) => sstable,
            Err(err) => {
                error!(generation = generation.as_u64(), error = %err,
                       "malformed sstable, refusing to boot");
                return Err(err);
            }
        };
        let owners = sstable.owner_shards(self.config.shard_count);
        if !owners.contains(&self.config.shard_id) {
            debug!(generation = generation.as_u64(),
                   "sstable not relevant for this shard, ignoring");
            sstable.mark_for_deletion();
            return Ok(());
        }
        if reset_level {
            // Migrated tables may overlap whatever the levels hold now.
            sstable.set_level(0);
        }
        if owners.len() > 1 {
            // Shared with other shards; split it once startup completes so
            // the disk space can be reclaimed.
            self.need_rewrite.lock().push(sstable.clone());
        } else {
            sstable.set_unshared();
        }
        self.add_sstable(sstable);
        Ok(())
    }

    /// Kick off split-rewrites of shared sstables found at load. Called
    /// once every table has finished probing.
    pub fn start_rewrite(&self) {
        let pending: Vec<Arc<Sstable>> = std::mem::take(&mut *self.need_rewrite.lock());
        for sstable in pending {
            info!(generation = sstable.generation().as_u64(), "splitting shared sstable");
            self.compaction.submit_rewrite(self.id(), sstable);
        }
    }

    /// Adopt sstables dropped into `upload/`: re-generation them into the
    /// live directory and remove the originals. Returns the descriptors of
    /// the adopted tables under their new generations.
    pub async fn flush_upload_dir(self: &Arc<Self>) -> StoreResult<Vec<EntryDescriptor>> {
        let upload = fs::upload_dir(&self.config.datadir);
        let mut flushed = Vec::new();
        for file_name in fs::list_files(&upload).await? {
            if fs::is_manifest(&file_name) {
                continue;
            }
            let descriptor = EntryDescriptor::make_descriptor(&file_name)?;
            if descriptor.component != ComponentType::Toc {
                continue;
            }
            let new_generation = self.calculate_generation_for_new_table();
            let adopted = self
                .relocate_generation(&upload, &descriptor, new_generation)
                .await?;
            codec::remove_components(
                &upload,
                &descriptor.ks,
                &descriptor.cf,
                &descriptor.version,
                descriptor.generation,
            )
            .await?;
            flushed.push(adopted);
        }
        Ok(flushed)
    }

    /// Renumber foreign sstable files found in the live directory into
    /// fresh local generations, starting at `start`.
    pub async fn reshuffle_sstables(
        self: &Arc<Self>,
        known_generations: &std::collections::HashSet<Generation>,
        start: Generation,
    ) -> StoreResult<Vec<EntryDescriptor>> {
        let mut current = start.max(Generation::new(1));
        let mut reshuffled = Vec::new();
        let datadir = self.config.datadir.clone();
        for file_name in fs::list_files(&datadir).await? {
            if fs::is_manifest(&file_name) {
                continue;
            }
            let descriptor = EntryDescriptor::make_descriptor(&file_name)?;
            if descriptor.component != ComponentType::Toc
                || known_generations.contains(&descriptor.generation)
            {
                continue;
            }
            if descriptor.generation == current {
                reshuffled.push(descriptor);
                current = current.next();
                continue;
            }
            let adopted = self
                .relocate_generation(&datadir, &descriptor, current)
                .await?;
            codec::remove_components(
                &datadir,
                &descriptor.ks,
                &descriptor.cf,
                &descriptor.version,
                descriptor.generation,
            )
            .await?;
            reshuffled.push(adopted);
            current = current.next();
        }
        self.update_sstables_known_generation(current);
        Ok(reshuffled)
    }

    /// Re-link one generation's components into the live directory under a
    /// new generation number. Statistics are rewritten (they embed the
    /// generation); data and filter are hard-linked.
    async fn relocate_generation(
        &self,
        src_dir: &Path,
        descriptor: &EntryDescriptor,
        new_generation: Generation,
    ) -> StoreResult<EntryDescriptor> {
        let src = codec::open(
            src_dir,
            &descriptor.ks,
            &descriptor.cf,
            &descriptor.version,
            descriptor.generation,
        )
        .await?;
        let mut meta = src.meta.clone();
        meta.generation = new_generation;

        let name_of = |component| {
            crate::sstable::component_filename(
                &descriptor.ks,
                &descriptor.cf,
                &descriptor.version,
                new_generation,
                component,
            )
        };
        for component in [ComponentType::Data, ComponentType::Filter] {
            let from = src.filename(component);
            let to = self.config.datadir.join(name_of(component));
            match tokio::fs::hard_link(&from, &to).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        let stats_bytes = bincode::serialize(&meta).map_err(StoreError::serialization)?;
        tokio::fs::write(
            self.config.datadir.join(name_of(ComponentType::Statistics)),
            stats_bytes,
        )
        .await?;
        let toc_listing = ComponentType::LIVE
            .iter()
            .map(|c| name_of(*c))
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(self.config.datadir.join(name_of(ComponentType::Toc)), toc_listing)
            .await?;
        fs::sync_dir(&self.config.datadir).await?;
        Ok(EntryDescriptor {
            ks: descriptor.ks.clone(),
            cf: descriptor.cf.clone(),
            version: descriptor.version.clone(),
            generation: new_generation,
            component: ComponentType::Toc,
        })
    }

    /// Load migrated sstables by descriptor, then start rewrites and drop
    /// the cache, which may hold stale rows for the adopted ranges.
    pub async fn load_new_sstables(
        self: &Arc<Self>,
        descriptors: Vec<EntryDescriptor>,
    ) -> StoreResult<()> {
        for descriptor in descriptors {
            self.load_sstable_generation(&descriptor.version, descriptor.generation, true)
                .await?;
        }
        self.start_rewrite();
        self.trigger_compaction();
        self.cache.clear().await
    }

    // ---- compaction bookkeeping ----

    /// Swap the sstable list after a compaction: `new_sstables` enter,
    /// `to_remove` leave the live set but stay queryable for tombstone
    /// decisions until their deletion is confirmed.
    pub async fn rebuild_sstable_list(
        self: &Arc<Self>,
        new_sstables: Vec<Arc<Sstable>>,
        to_remove: Vec<Arc<Sstable>>,
    ) {
        {
            let removed: Vec<Generation> = to_remove.iter().map(|s| s.generation()).collect();
            let mut guard = self.sstables.write();
            let mut next = SstableSet::new();
            for sstable in new_sstables.iter().chain(guard.iter()) {
                if removed.contains(&sstable.generation()) {
                    self.compacted_not_deleted.lock().push(sstable.clone());
                } else {
                    next.insert(sstable.clone());
                }
            }
            *guard = Arc::new(next);
        }
        self.rebuild_statistics();

        let table = self.clone();
        self.sstable_deletion_gate.enter();
        tokio::spawn(async move {
            let result = codec::delete_atomically(&to_remove).await;
            // Compacted tables leave the undeleted list whether or not the
            // delete went through, or they would pin disk space forever.
            {
                let removed: Vec<Generation> = to_remove.iter().map(|s| s.generation()).collect();
                table
                    .compacted_not_deleted
                    .lock()
                    .retain(|s| !removed.contains(&s.generation()));
            }
            table.rebuild_statistics();
            if let Err(err) = result {
                match err {
                    StoreError::AtomicDeletionCancelled(reason) => {
                        debug!(reason = %reason, "failed to delete sstables after compaction");
                    }
                    other => warn!(error = %other, "sstable deletion failed"),
                }
            }
            table.sstable_deletion_gate.leave();
        });
    }

    fn rebuild_statistics(&self) {
        self.metrics.reset_live_sstables();
        for sstable in self.sstables.read().iter() {
            self.metrics.add_live_sstable(sstable.bytes_on_disk());
        }
        for sstable in self.compacted_not_deleted.lock().iter() {
            self.metrics.add_live_sstable(sstable.bytes_on_disk());
        }
    }

    /// Run `f` with compaction submission suppressed.
    pub async fn run_with_compaction_disabled<F, T>(&self, f: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.compaction_disabled.fetch_add(1, Ordering::AcqRel);
        let result = f.await;
        self.compaction_disabled.fetch_sub(1, Ordering::AcqRel);
        result
    }

    // ---- truncate / snapshot / clear ----

    /// Drop every sstable whose newest data is at or below `truncated_at`
    /// (milliseconds). Returns the highest replay position among the
    /// dropped tables, for the truncation record.
    pub async fn discard_sstables(&self, truncated_at: i64) -> StoreResult<ReplayPosition> {
        assert!(
            self.compaction_disabled.load(Ordering::Acquire) > 0,
            "discard_sstables requires compaction to be disabled"
        );
        let _guard = self.sstables_lock.read().await;
        let mut rp = ReplayPosition::ZERO;
        let mut remove = Vec::new();
        {
            let mut guard = self.sstables.write();
            let mut pruned = SstableSet::new();
            for sstable in guard.iter() {
                if sstable.meta.max_data_age <= truncated_at {
                    rp = rp.max(sstable.meta.replay_position);
                    remove.push(sstable.clone());
                } else {
                    pruned.insert(sstable.clone());
                }
            }
            *guard = Arc::new(pruned);
        }
        self.rebuild_statistics();
        debug!("cleaning out row cache");
        self.cache.clear().await?;
        if !remove.is_empty() {
            codec::delete_atomically(&remove).await?;
        }
        Ok(rp)
    }

    /// Hard-link every live sstable into `snapshots/<tag>/` and rendezvous
    /// on the manifest. The snapshot holds exactly the sstables present
    /// when the flush inside it completed.
    pub async fn snapshot(&self, tag: &str) -> StoreResult<()> {
        self.flush().await?;
        let tables = self.sstables.read().clone();
        let jsondir = fs::snapshot_dir(&self.config.datadir, tag);
        tokio::fs::create_dir_all(&jsondir).await?;
        for sstable in tables.iter() {
            sstable.create_links(&jsondir).await?;
        }
        if !tables.is_empty() {
            fs::sync_dir(&jsondir).await?;
        }
        let mut file_names = Vec::new();
        for sstable in tables.iter() {
            for component in ComponentType::LIVE {
                let path = sstable.filename(component);
                if let Some(name) = path.file_name() {
                    file_names.push(name.to_string_lossy().to_string());
                }
            }
        }
        self.config.snapshots.rendezvous(jsondir, file_names).await
    }

    pub async fn snapshot_exists(&self, tag: &str) -> bool {
        fs::snapshot_dir(&self.config.datadir, tag).is_dir()
    }

    /// Remove snapshot directories: one tag, or all snapshots when `tag`
    /// is empty. Recursion is one level deep; anything deeper is refused.
    pub async fn clear_snapshot(&self, tag: &str) -> StoreResult<()> {
        let snapshots = fs::snapshots_dir(&self.config.datadir);
        let target = if tag.is_empty() {
            snapshots.clone()
        } else {
            snapshots.join(tag)
        };
        if !target.exists() {
            return Ok(());
        }
        for sub in fs::list_dirs(&target).await? {
            if !tag.is_empty() {
                return Err(StoreError::invalid_state(format!(
                    "unexpected directory {sub} found at {}",
                    target.display()
                )));
            }
            let subdir = target.join(&sub);
            for file in fs::list_files(&subdir).await? {
                tokio::fs::remove_file(subdir.join(file)).await?;
            }
            tokio::fs::remove_dir(&subdir).await?;
        }
        for file in fs::list_files(&target).await? {
            tokio::fs::remove_file(target.join(file)).await?;
        }
        if !tag.is_empty() {
            tokio::fs::remove_dir(&target).await?;
        }
        let parent = if tag.is_empty() {
            self.config.datadir.clone()
        } else {
            snapshots
        };
        if parent.exists() {
            fs::sync_dir(&parent).await?;
        }
        Ok(())
    }

    /// Sizes of every snapshot under this table.
    pub async fn snapshot_details(&self) -> StoreResult<HashMap<String, SnapshotDetails>> {
        let mut all = HashMap::new();
        let snapshots = fs::snapshots_dir(&self.config.datadir);
        for tag in fs::list_dirs(&snapshots).await? {
            let dir = snapshots.join(&tag);
            let mut details = SnapshotDetails::default();
            for file in fs::list_files(&dir).await? {
                if fs::is_manifest(&file) {
                    continue;
                }
                // Anything else in here must be an sstable component.
                EntryDescriptor::make_descriptor(&file)?;
                let size = tokio::fs::metadata(dir.join(&file)).await?.len();
                details.total += size;
                if !self.config.datadir.join(&file).exists() {
                    details.live += size;
                }
            }
            all.insert(tag, details);
        }
        Ok(all)
    }

    /// Drop all in-memory state and the cache. Non-durable truncate path.
    pub async fn clear(&self) -> StoreResult<()> {
        self.memtables.clear_and_reset();
        self.streaming_memtables.clear_and_reset();
        self.streaming_big.lock().clear();
        self.cache.clear().await
    }

    // ---- schema / lifecycle ----

    pub fn set_schema(&self, schema: Arc<Schema>) {
        let old = self.schema.read().clone();
        debug!(ks = %old.ks_name, cf = %old.cf_name,
               from = %old.version, to = %schema.version, "changing schema version");
        self.memtables.set_schema(schema.clone());
        self.streaming_memtables.set_schema(schema.clone());
        for entry in self.streaming_big.lock().values() {
            entry.memtables.set_schema(schema.clone());
        }
        self.cache.set_schema(schema.clone());
        *self.schema.write() = schema;
        self.trigger_compaction();
    }

    pub fn start(&self) {
        self.trigger_compaction();
    }

    /// Ordered shutdown: drain flushes, close the flush queue, wait out
    /// streaming writes and background deletions.
    pub async fn stop(self: &Arc<Self>) -> StoreResult<()> {
        let regular = self.memtables.request_flush();
        let streaming = self.streaming_memtables.request_flush();
        let (regular, streaming) = tokio::join!(regular, streaming);
        self.shutdown.cancel();
        self.compaction.remove(self.id()).await;
        self.flush_queue.close().await;
        self.streaming_flush_gate.wait_drained().await;
        self.sstable_deletion_gate.wait_drained().await;
        regular.and(streaming)
    }
}
