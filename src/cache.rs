use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::StoreResult;
use crate::memtable::Memtable;
use crate::metrics::TableMetrics;
use crate::mutation::{
    DecoratedKey, Mutation, PartitionData, PartitionRange, QuerySlice,
};
use crate::reader::{MutationReader, SingleKeyReader};
use crate::schema::Schema;
use crate::sstable::SstableSet;

/// Answer of a partition presence probe against the sstables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceResult {
    MaybeExists,
    DefinitelyDoesntExist,
}

/// Probes whether any sstable might hold a partition key. Built by the
/// owning table, usually excluding the sstable a memtable was just
/// flushed into.
pub type PartitionPresenceChecker = Box<dyn Fn(&DecoratedKey) -> PresenceResult + Send + Sync>;

#[derive(Clone)]
enum CacheEntry {
    /// Complete partition: equals the merge of all sstables for this key.
    Data(PartitionData),
    /// Negative entry: no sstable holds this key, skip the probe.
    DefinitelyDoesntExist,
}

/// Point-in-time cache counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Partition-granularity read-through cache over the sstable set.
///
/// An entry is always *complete*: it equals the reconciled union of every
/// sstable's data for that key, so singular reads can merge memtables with
/// the cache instead of the sstables. The critical transfer point is
/// [`RowCache::update`]: when a memtable has been flushed, its partitions
/// move into the cache before the memtable is retired, keeping the union of
/// (memtables + cache) equal to the union of (memtables + sstables) at
/// every deferring point.
pub struct RowCache {
    schema: RwLock<Arc<Schema>>,
    entries: Mutex<BTreeMap<DecoratedKey, CacheEntry>>,
    max_partition_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RowCache {
    pub fn new(schema: Arc<Schema>, max_partition_size: u64) -> Self {
        Self {
            schema: RwLock::new(schema),
            entries: Mutex::new(BTreeMap::new()),
            max_partition_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> RowCacheStats {
        RowCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    pub fn set_schema(&self, schema: Arc<Schema>) {
        *self.schema.write() = schema;
    }

    /// Reader for one partition key, read-through against `sstables`.
    pub fn make_single_key_reader(
        self: &Arc<Self>,
        key: DecoratedKey,
        sstables: Arc<SstableSet>,
        metrics: Arc<TableMetrics>,
    ) -> CachedSingleKeyReader {
        CachedSingleKeyReader {
            cache: self.clone(),
            key,
            sstables,
            metrics,
            done: false,
        }
    }

    /// Atomically incorporate a just-flushed memtable.
    ///
    /// Partitions already cached are reconciled in place. Partitions absent
    /// from the cache are inserted as complete entries only when `checker`
    /// proves no other sstable holds the key; otherwise the key is left
    /// uncached so the next read populates it by merging all sstables.
    pub fn update(
        &self,
        memtable: &Memtable,
        checker: PartitionPresenceChecker,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let partitions = memtable.all_partitions();
        let mut entries = self.entries.lock();
        for (key, data) in partitions {
            match entries.get_mut(&key) {
                Some(entry) => match entry {
                    CacheEntry::Data(existing) => existing.apply(data),
                    CacheEntry::DefinitelyDoesntExist => *entry = CacheEntry::Data(data),
                },
                None => match checker(&key) {
                    PresenceResult::DefinitelyDoesntExist => {
                        if data.memory_size() <= self.max_partition_size {
                            entries.insert(key, CacheEntry::Data(data));
                        }
                    }
                    PresenceResult::MaybeExists => {}
                },
            }
        }
        drop(entries);
        async { Ok(()) }.boxed()
    }

    /// Drop every entry overlapping `range`.
    pub fn invalidate(&self, range: &PartitionRange) {
        let mut entries = self.entries.lock();
        entries.retain(|key, _| !range.contains(key));
    }

    pub fn clear(&self) -> BoxFuture<'static, StoreResult<()>> {
        self.entries.lock().clear();
        async { Ok(()) }.boxed()
    }

    fn lookup(&self, key: &DecoratedKey) -> Option<CacheEntry> {
        let entry = self.entries.lock().get(key).cloned();
        match &entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        entry
    }

    fn populate(&self, key: DecoratedKey, data: Option<PartitionData>) {
        let mut entries = self.entries.lock();
        match data {
            Some(data) if data.memory_size() <= self.max_partition_size => {
                entries.insert(key, CacheEntry::Data(data));
            }
            Some(_) => {
                // Oversized partitions are served but not retained.
            }
            None => {
                entries.insert(key, CacheEntry::DefinitelyDoesntExist);
            }
        }
    }
}

/// Read-through single-key reader: serves from cache on a hit, populates
/// from the sstable set on a miss.
pub struct CachedSingleKeyReader {
    cache: Arc<RowCache>,
    key: DecoratedKey,
    sstables: Arc<SstableSet>,
    metrics: Arc<TableMetrics>,
    done: bool,
}

impl MutationReader for CachedSingleKeyReader {
    fn next_mutation(&mut self) -> BoxFuture<'_, StoreResult<Option<Mutation>>> {
        async move {
            if self.done {
                return Ok(None);
            }
            self.done = true;
            let schema = self.cache.schema.read().clone();
            match self.cache.lookup(&self.key) {
                Some(CacheEntry::Data(partition)) => {
                    trace!(token = ?self.key.token, "row cache hit");
                    return Ok(Some(Mutation {
                        schema,
                        key: self.key.clone(),
                        partition,
                    }));
                }
                Some(CacheEntry::DefinitelyDoesntExist) => return Ok(None),
                None => {}
            }
            // Miss: merge the sstables for this key. The cache must hold a
            // complete partition, so read with a full slice regardless of
            // what the query asked for.
            let mut underlying = SingleKeyReader::new(
                schema,
                self.sstables.clone(),
                self.key.clone(),
                QuerySlice::full(),
                self.metrics.clone(),
            );
            let read = underlying.next_mutation().await?;
            self.cache
                .populate(self.key.clone(), read.as_ref().map(|m| m.partition.clone()));
            Ok(read)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DirtyMemoryManager, MemoryRegion};
    use crate::mutation::Cell;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::for_tests("ks", "cf"))
    }

    fn memtable_with(schema: &Arc<Schema>, keys: &[&[u8]]) -> Arc<Memtable> {
        let dirty = DirtyMemoryManager::new("cache-test", 1 << 20, None);
        let memtable = Memtable::new(schema.clone(), MemoryRegion::new(dirty.group().clone()));
        for key in keys {
            let mut m = Mutation::new(schema.clone(), key.to_vec());
            m.set_cell(vec![b"ck".to_vec()], "v", Cell::live(10, b"1".to_vec()));
            memtable.apply(&m, crate::position::ReplayPosition::ZERO);
        }
        memtable
    }

    #[tokio::test]
    async fn update_inserts_when_no_other_sstable_has_the_key() {
        let schema = schema();
        let cache = Arc::new(RowCache::new(schema.clone(), 1 << 20));
        let memtable = memtable_with(&schema, &[b"pk"]);

        cache
            .update(
                &memtable,
                Box::new(|_| PresenceResult::DefinitelyDoesntExist),
            )
            .await
            .expect("update");

        let mut reader = cache.make_single_key_reader(
            DecoratedKey::from_key(b"pk".to_vec()),
            Arc::new(SstableSet::new()),
            Arc::new(TableMetrics::default()),
        );
        let m = reader.next_mutation().await.expect("read").expect("cached");
        assert_eq!(m.partition.live_row_count(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn update_skips_keys_other_sstables_may_hold() {
        let schema = schema();
        let cache = Arc::new(RowCache::new(schema.clone(), 1 << 20));
        let memtable = memtable_with(&schema, &[b"pk"]);

        cache
            .update(&memtable, Box::new(|_| PresenceResult::MaybeExists))
            .await
            .expect("update");
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn miss_against_empty_sstables_caches_absence() {
        let schema = schema();
        let cache = Arc::new(RowCache::new(schema, 1 << 20));
        let key = DecoratedKey::from_key(b"absent".to_vec());
        let metrics = Arc::new(TableMetrics::default());

        let mut reader = cache.make_single_key_reader(
            key.clone(),
            Arc::new(SstableSet::new()),
            metrics.clone(),
        );
        assert!(reader.next_mutation().await.expect("read").is_none());

        // Second read hits the negative entry.
        let mut reader = cache.make_single_key_reader(
            key,
            Arc::new(SstableSet::new()),
            metrics,
        );
        assert!(reader.next_mutation().await.expect("read").is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn invalidate_drops_entries_in_range() {
        let schema = schema();
        let cache = Arc::new(RowCache::new(schema.clone(), 1 << 20));
        let memtable = memtable_with(&schema, &[b"a", b"b"]);
        cache
            .update(
                &memtable,
                Box::new(|_| PresenceResult::DefinitelyDoesntExist),
            )
            .await
            .expect("update");
        assert_eq!(cache.stats().entries, 2);

        cache.invalidate(&PartitionRange::singular(DecoratedKey::from_key(
            b"a".to_vec(),
        )));
        assert_eq!(cache.stats().entries, 1);

        cache.invalidate(&PartitionRange::full());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn oversized_partitions_are_not_retained() {
        let schema = schema();
        let cache = Arc::new(RowCache::new(schema.clone(), 16));
        let memtable = memtable_with(&schema, &[b"pk"]);
        cache
            .update(
                &memtable,
                Box::new(|_| PresenceResult::DefinitelyDoesntExist),
            )
            .await
            .expect("update");
        assert_eq!(cache.stats().entries, 0);
    }
}
