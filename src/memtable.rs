use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::memory::{DirtyMemoryManager, MemoryRegion};
use crate::mutation::{DecoratedKey, FrozenMutation, Mutation, PartitionData, PartitionRange};
use crate::position::ReplayPosition;
use crate::schema::Schema;
use crate::sstable::Sstable;

/// How urgently a seal wants its data on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushBehavior {
    /// Seal and write the sstable now.
    Immediate,
    /// Seal may wait a bounded interval to batch with later mutations.
    Delayed,
}

/// In-memory write buffer for one table.
///
/// An ordered partition map plus the bookkeeping the flush pipeline needs:
/// occupancy in its memory region, the highest replay position it contains,
/// and, once flushed, the sstable it became. A memtable is mutated only by
/// its own shard and never after it has been sealed.
pub struct Memtable {
    schema: RwLock<Arc<Schema>>,
    partitions: RwLock<BTreeMap<DecoratedKey, PartitionData>>,
    region: MemoryRegion,
    replay_position: Mutex<ReplayPosition>,
    flushed_to: Mutex<Option<Arc<Sstable>>>,
}

impl Memtable {
    pub fn new(schema: Arc<Schema>, region: MemoryRegion) -> Arc<Self> {
        Arc::new(Self {
            schema: RwLock::new(schema),
            partitions: RwLock::new(BTreeMap::new()),
            region,
            replay_position: Mutex::new(ReplayPosition::ZERO),
            flushed_to: Mutex::new(None),
        })
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.read().clone()
    }

    pub fn set_schema(&self, schema: Arc<Schema>) {
        *self.schema.write() = schema;
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn occupancy(&self) -> u64 {
        self.region.occupancy()
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// Highest replay position of any contained mutation; zero iff no
    /// logged mutation was applied.
    pub fn replay_position(&self) -> ReplayPosition {
        *self.replay_position.lock()
    }

    pub fn apply(&self, mutation: &Mutation, rp: ReplayPosition) {
        self.apply_partition(&mutation.key, &mutation.partition, rp);
    }

    pub fn apply_frozen(&self, mutation: &FrozenMutation, rp: ReplayPosition) {
        self.apply_partition(&mutation.decorated_key(), &mutation.partition, rp);
    }

    fn apply_partition(&self, key: &DecoratedKey, data: &PartitionData, rp: ReplayPosition) {
        let delta = {
            let mut partitions = self.partitions.write();
            let before = partitions.get(key).map(|p| p.memory_size()).unwrap_or(0);
            let entry = partitions.entry(key.clone()).or_default();
            entry.apply(data.clone());
            entry.memory_size().saturating_sub(before)
        };
        if delta > 0 {
            self.region.add(delta);
        }
        let mut current = self.replay_position.lock();
        if rp > *current {
            *current = rp;
        }
    }

    pub fn get(&self, key: &DecoratedKey) -> Option<PartitionData> {
        self.partitions.read().get(key).cloned()
    }

    /// Partitions overlapping `range`, in key order. Readers call this once
    /// at construction; the clone gives them a stable snapshot across their
    /// own suspension points.
    pub fn partitions_in_range(
        &self,
        range: &PartitionRange,
    ) -> Vec<(DecoratedKey, PartitionData)> {
        let partitions = self.partitions.read();
        match range {
            PartitionRange::Singular(key) => partitions
                .get(key)
                .map(|p| vec![(key.clone(), p.clone())])
                .unwrap_or_default(),
            PartitionRange::Tokens(_) => partitions
                .iter()
                .filter(|(key, _)| range.contains(key))
                .map(|(key, data)| (key.clone(), data.clone()))
                .collect(),
        }
    }

    pub fn all_partitions(&self) -> Vec<(DecoratedKey, PartitionData)> {
        self.partitions
            .read()
            .iter()
            .map(|(key, data)| (key.clone(), data.clone()))
            .collect()
    }

    /// Record the sstable this memtable was flushed into. Set after a
    /// successful write, before the cache transfer begins.
    pub fn mark_flushed(&self, sstable: Arc<Sstable>) {
        *self.flushed_to.lock() = Some(sstable);
    }

    pub fn flushed_to(&self) -> Option<Arc<Sstable>> {
        self.flushed_to.lock().clone()
    }
}

/// The seal action a memtable list runs when its active memtable must go to
/// disk. Injected by the owning table so the same list type serves regular,
/// streaming and memory-only modes.
pub type SealFn = Arc<dyn Fn(FlushBehavior) -> BoxFuture<'static, StoreResult<()>> + Send + Sync>;

/// Supplies the current schema for freshly created memtables.
pub type SchemaSource = Arc<dyn Fn() -> Arc<Schema> + Send + Sync>;

pub(crate) type FlushOutcome = Option<Result<(), String>>;

/// Ordered set of memtables: the back element is the active writable one,
/// everything before it is sealing or waiting for its cache transfer.
pub struct MemtableList {
    memtables: Mutex<Vec<Arc<Memtable>>>,
    seal_fn: SealFn,
    schema_source: SchemaSource,
    dirty: Arc<DirtyMemoryManager>,
    coalescing: Mutex<Option<watch::Receiver<FlushOutcome>>>,
}

impl MemtableList {
    pub fn new(
        seal_fn: SealFn,
        schema_source: SchemaSource,
        dirty: Arc<DirtyMemoryManager>,
    ) -> Arc<Self> {
        let list = Arc::new(Self {
            memtables: Mutex::new(Vec::new()),
            seal_fn,
            schema_source,
            dirty,
            coalescing: Mutex::new(None),
        });
        list.add_memtable();
        list
    }

    fn new_memtable(&self) -> Arc<Memtable> {
        let schema = (self.schema_source)();
        Memtable::new(schema, MemoryRegion::new(self.dirty.group().clone()))
    }

    /// The active writable memtable.
    pub fn active(&self) -> Arc<Memtable> {
        self.memtables
            .lock()
            .last()
            .cloned()
            .expect("memtable list is never empty")
    }

    pub fn active_is_empty(&self) -> bool {
        self.active().is_empty()
    }

    pub fn active_occupancy(&self) -> u64 {
        self.active().occupancy()
    }

    /// Append a fresh empty memtable, making it the active one.
    pub fn add_memtable(&self) {
        let memtable = self.new_memtable();
        self.memtables.lock().push(memtable);
    }

    pub fn erase(&self, memtable: &Arc<Memtable>) {
        self.memtables
            .lock()
            .retain(|m| !Arc::ptr_eq(m, memtable));
    }

    /// All memtables, oldest first. Reader construction snapshots this.
    pub fn all(&self) -> Vec<Arc<Memtable>> {
        self.memtables.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.memtables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memtables.lock().is_empty()
    }

    /// Drop everything and start over with one fresh memtable.
    pub fn clear_and_reset(&self) {
        let fresh = self.new_memtable();
        let mut memtables = self.memtables.lock();
        memtables.clear();
        memtables.push(fresh);
    }

    pub fn set_schema(&self, schema: Arc<Schema>) {
        for memtable in self.memtables.lock().iter() {
            memtable.set_schema(schema.clone());
        }
    }

    /// Run the injected seal action.
    pub async fn seal(&self, behavior: FlushBehavior) -> StoreResult<()> {
        (self.seal_fn)(behavior).await
    }

    /// Request that the active memtable be flushed, coalescing concurrent
    /// callers: only one seal is in flight at a time and every caller that
    /// arrived before the flush boundary shares its completion. A caller
    /// arriving while a seal is in flight opens a fresh coalescing slot for
    /// the mutations that came after the boundary.
    pub fn request_flush(self: &Arc<Self>) -> BoxFuture<'static, StoreResult<()>> {
        let mut slot = self.coalescing.lock();
        if let Some(rx) = slot.as_ref() {
            return wait_for_outcome(rx.clone()).boxed();
        }
        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let list = self.clone();
        tokio::spawn(async move {
            let outcome = match list.dirty.get_flush_permit().await {
                Ok(permit) => {
                    // The boundary: mutations applied from here on belong to
                    // the next coalescing slot.
                    *list.coalescing.lock() = None;
                    list.dirty.flush_one(list.clone(), permit).await
                }
                Err(err) => {
                    *list.coalescing.lock() = None;
                    Err(err)
                }
            };
            if let Err(err) = &outcome {
                debug!(error = %err, "coalesced flush failed");
            }
            let _ = tx.send(Some(outcome.map_err(|e| e.to_string())));
        });
        wait_for_outcome(rx).boxed()
    }
}

pub(crate) async fn wait_for_outcome(mut rx: watch::Receiver<FlushOutcome>) -> StoreResult<()> {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return outcome.map_err(StoreError::FlushFailed);
        }
        if rx.changed().await.is_err() {
            return Err(StoreError::FlushFailed("flush task dropped".to_string()));
        }
    }
}
