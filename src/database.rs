//! The per-shard database: keyspace and table registries, write routing
//! through the commitlog and the dirty-memory managers, the read
//! concurrency classes, and whole-node maintenance (truncate, snapshots,
//! shutdown).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{StoreConfig, TableId};
use crate::error::{StoreError, StoreResult};
use crate::fs::{self, SnapshotCoordinator};
use crate::memory::DirtyMemoryManager;
use crate::metrics::DbMetrics;
use crate::mutation::{
    frozen_mutation_data_size, FrozenMutation, Mutation, PartitionRange, Token, TokenRange,
};
use crate::position::ReplayPosition;
use crate::reader::{QueryResult, ReadCommand, ReadConcurrencyConfig, ReconcilableResult};
use crate::schema::{Keyspace, KeyspaceMetadata, Schema, TokenMetadata};
use crate::streaming::StreamPlanId;
use crate::table::{ColumnFamily, CompactionScheduler, NoopCompaction, TableConfig};
use crate::wal::CommitLog;

/// Name of the system keyspace; its tables write through the system region
/// group and read through the system concurrency class.
pub const SYSTEM_KEYSPACE: &str = "system";

/// Persistence seam for truncation records, keyed by table and replay
/// position so replay can skip writes the truncate made obsolete.
pub trait TruncationStore: Send + Sync {
    fn save(&self, table: TableId, truncated_at: i64, rp: ReplayPosition);
    fn load(&self, table: TableId) -> Option<(i64, ReplayPosition)>;
}

/// In-memory truncation records.
#[derive(Default)]
pub struct MemoryTruncationStore {
    records: Mutex<HashMap<TableId, (i64, ReplayPosition)>>,
}

impl MemoryTruncationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl TruncationStore for MemoryTruncationStore {
    fn save(&self, table: TableId, truncated_at: i64, rp: ReplayPosition) {
        self.records.lock().insert(table, (truncated_at, rp));
    }

    fn load(&self, table: TableId) -> Option<(i64, ReplayPosition)> {
        self.records.lock().get(&table).copied()
    }
}

/// All column families of one shard, keyed by keyspace, name and id.
///
/// Owns the three hierarchical dirty-memory managers
/// (`system ⊇ regular ⊇ streaming`), the read-concurrency classes, and the
/// collaborator handles every table shares.
pub struct Database {
    config: StoreConfig,
    keyspaces: RwLock<HashMap<String, Arc<Keyspace>>>,
    tables: RwLock<HashMap<TableId, Arc<ColumnFamily>>>,
    ks_cf_to_id: RwLock<HashMap<(String, String), TableId>>,
    system_dirty: Arc<DirtyMemoryManager>,
    regular_dirty: Arc<DirtyMemoryManager>,
    streaming_dirty: Arc<DirtyMemoryManager>,
    read_concurrency: ReadConcurrencyConfig,
    system_read_concurrency: ReadConcurrencyConfig,
    streaming_read_concurrency: ReadConcurrencyConfig,
    commitlog: Option<Arc<dyn CommitLog>>,
    compaction: Arc<dyn CompactionScheduler>,
    snapshots: Arc<SnapshotCoordinator>,
    truncation: Arc<dyn TruncationStore>,
    token_metadata: Arc<TokenMetadata>,
    metrics: Arc<DbMetrics>,
    shutdown: CancellationToken,
}

impl Database {
    /// Build a database with the default collaborators (no-op compaction,
    /// in-memory truncation records). Must run inside a runtime: the
    /// dirty-memory reclaim loops are spawned here.
    pub fn new(config: StoreConfig, commitlog: Option<Arc<dyn CommitLog>>) -> Arc<Self> {
        Self::with_collaborators(config, commitlog, NoopCompaction::new(), MemoryTruncationStore::new())
    }

    pub fn with_collaborators(
        config: StoreConfig,
        commitlog: Option<Arc<dyn CommitLog>>,
        compaction: Arc<dyn CompactionScheduler>,
        truncation: Arc<dyn TruncationStore>,
    ) -> Arc<Self> {
        let config = config.normalized();
        let system_dirty =
            DirtyMemoryManager::new("system", config.system_dirty_limit(), None);
        let regular_dirty = DirtyMemoryManager::new(
            "regular",
            config.regular_dirty_limit(),
            Some(&system_dirty),
        );
        let streaming_dirty = DirtyMemoryManager::new(
            "streaming",
            config.streaming_dirty_limit(),
            Some(&regular_dirty),
        );
        system_dirty.start();
        regular_dirty.start();
        streaming_dirty.start();

        let read_concurrency = ReadConcurrencyConfig::new(
            config.max_concurrent_reads,
            config.max_read_queue_length,
            Some(config.read_request_timeout),
        );
        let system_read_concurrency = ReadConcurrencyConfig::new(
            config.max_system_concurrent_reads,
            config.max_read_queue_length,
            Some(config.read_request_timeout),
        );
        // Streaming reads are paced by the transfer protocol, not by a
        // client deadline.
        let streaming_read_concurrency = ReadConcurrencyConfig::new(
            config.max_concurrent_reads,
            config.max_read_queue_length,
            None,
        );

        let snapshots = Arc::new(SnapshotCoordinator::new(config.shard_count));
        let db = Arc::new(Self {
            keyspaces: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            ks_cf_to_id: RwLock::new(HashMap::new()),
            system_dirty,
            regular_dirty,
            streaming_dirty,
            read_concurrency,
            system_read_concurrency,
            streaming_read_concurrency,
            commitlog: commitlog.clone(),
            compaction,
            snapshots,
            truncation,
            token_metadata: Arc::new(TokenMetadata::new()),
            metrics: Arc::new(DbMetrics::default()),
            shutdown: CancellationToken::new(),
            config,
        });

        if let Some(commitlog) = commitlog {
            // The log calls back when it wants memory: flush the table up
            // to the given position so its segments can be recycled.
            let weak = Arc::downgrade(&db);
            commitlog.add_flush_handler(Arc::new(move |table, rp| {
                let Some(db) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    match db.find_column_family_by_id(table) {
                        Ok(cf) => {
                            if let Err(err) = cf.flush_up_to(rp).await {
                                warn!(table = %table, error = %err,
                                      "commitlog-driven flush failed");
                            }
                        }
                        Err(_) => {
                            // The table was dropped; its segments are free.
                            if let Some(commitlog) = &db.commitlog {
                                commitlog.discard_completed_segments(table, rp);
                            }
                        }
                    }
                });
            }));
        }
        db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<DbMetrics> {
        &self.metrics
    }

    pub fn token_metadata(&self) -> &Arc<TokenMetadata> {
        &self.token_metadata
    }

    pub fn dirty_memory_manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.regular_dirty
    }

    pub fn streaming_dirty_memory_manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.streaming_dirty
    }

    /// Comma/space-separated initial token assignment.
    pub fn initial_tokens(&self) -> Vec<String> {
        self.config.initial_tokens()
    }

    pub fn shard_of(&self, token: Token) -> u32 {
        token.shard_of(self.config.shard_count)
    }

    // ---- keyspace / table registry ----

    pub async fn create_keyspace(&self, metadata: Arc<KeyspaceMetadata>) -> StoreResult<()> {
        if self.keyspaces.read().contains_key(&metadata.name) {
            return Ok(());
        }
        metadata.validate()?;
        let datadir = fs::keyspace_dir(&self.config.data_dir, &metadata.name);
        tokio::fs::create_dir_all(&datadir).await?;
        let keyspace = Arc::new(Keyspace::new(metadata.clone(), datadir));
        keyspace.create_replication_strategy()?;
        info!(keyspace = %metadata.name, "created keyspace");
        self.keyspaces
            .write()
            .insert(metadata.name.clone(), keyspace);
        Ok(())
    }

    pub fn find_keyspace(&self, name: &str) -> StoreResult<Arc<Keyspace>> {
        self.keyspaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchKeyspace(name.to_string()))
    }

    pub fn has_keyspace(&self, name: &str) -> bool {
        self.keyspaces.read().contains_key(name)
    }

    pub fn drop_keyspace(&self, name: &str) {
        self.keyspaces.write().remove(name);
    }

    pub fn non_system_keyspaces(&self) -> Vec<String> {
        self.keyspaces
            .read()
            .keys()
            .filter(|name| name.as_str() != SYSTEM_KEYSPACE)
            .cloned()
            .collect()
    }

    fn make_table_config(&self, keyspace: &Keyspace, schema: &Schema) -> TableConfig {
        let metadata = keyspace.metadata();
        let system = metadata.name == SYSTEM_KEYSPACE;
        TableConfig {
            datadir: keyspace.column_family_directory(&schema.cf_name, schema.id),
            enable_disk_writes: self.config.enable_disk_writes,
            enable_cache: self.config.enable_cache,
            enable_commitlog: metadata.durable_writes && self.config.enable_commitlog,
            enable_incremental_backups: self.config.incremental_backups,
            max_cached_partition_size: self.config.max_cached_partition_size,
            shard_id: self.config.shard_id,
            shard_count: self.config.shard_count,
            dirty_memory_manager: if system {
                self.system_dirty.clone()
            } else {
                self.regular_dirty.clone()
            },
            streaming_dirty_memory_manager: self.streaming_dirty.clone(),
            read_concurrency: if system {
                self.system_read_concurrency.clone()
            } else {
                self.read_concurrency.clone()
            },
            streaming_read_concurrency: self.streaming_read_concurrency.clone(),
            flush_retry_delay: self.config.flush_retry_delay,
            delayed_streaming_flush_interval: self.config.delayed_streaming_flush_interval,
            snapshots: self.snapshots.clone(),
            db_metrics: Some(self.metrics.clone()),
        }
    }

    /// Register a table under its keyspace, create its directories, and
    /// start it.
    pub async fn add_column_family(&self, schema: Arc<Schema>) -> StoreResult<Arc<ColumnFamily>> {
        let keyspace = self.find_keyspace(&schema.ks_name)?;
        {
            let tables = self.tables.read();
            if tables.contains_key(&schema.id) {
                return Err(StoreError::invalid_state(format!(
                    "table id {} already mapped",
                    schema.id
                )));
            }
        }
        let key = (schema.ks_name.clone(), schema.cf_name.clone());
        if self.ks_cf_to_id.read().contains_key(&key) {
            return Err(StoreError::invalid_state(format!(
                "column family {}.{} exists",
                schema.ks_name, schema.cf_name
            )));
        }
        schema.mark_synced();
        let table_config = self.make_table_config(&keyspace, &schema);
        fs::ensure_table_dirs(&table_config.datadir).await?;
        let cf = ColumnFamily::new(
            schema.clone(),
            table_config,
            self.commitlog.clone(),
            self.compaction.clone(),
        );
        keyspace.metadata().add_or_update_table(schema.clone());
        cf.start();
        self.tables.write().insert(schema.id, cf.clone());
        self.ks_cf_to_id.write().insert(key, schema.id);
        Ok(cf)
    }

    pub fn find_uuid(&self, ks_name: &str, cf_name: &str) -> StoreResult<TableId> {
        self.ks_cf_to_id
            .read()
            .get(&(ks_name.to_string(), cf_name.to_string()))
            .copied()
            .ok_or_else(|| {
                StoreError::NoSuchColumnFamily(format!("{ks_name}.{cf_name}"))
            })
    }

    pub fn find_column_family(
        &self,
        ks_name: &str,
        cf_name: &str,
    ) -> StoreResult<Arc<ColumnFamily>> {
        self.find_column_family_by_id(self.find_uuid(ks_name, cf_name)?)
    }

    pub fn find_column_family_by_id(&self, id: TableId) -> StoreResult<Arc<ColumnFamily>> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchColumnFamily(id.to_string()))
    }

    pub fn column_family_exists(&self, id: TableId) -> bool {
        self.tables.read().contains_key(&id)
    }

    pub fn find_schema(&self, ks_name: &str, cf_name: &str) -> StoreResult<Arc<Schema>> {
        Ok(self.find_column_family(ks_name, cf_name)?.schema())
    }

    pub fn find_schema_by_id(&self, id: TableId) -> StoreResult<Arc<Schema>> {
        Ok(self.find_column_family_by_id(id)?.schema())
    }

    pub fn has_schema(&self, ks_name: &str, cf_name: &str) -> bool {
        self.ks_cf_to_id
            .read()
            .contains_key(&(ks_name.to_string(), cf_name.to_string()))
    }

    pub fn column_families(&self) -> Vec<Arc<ColumnFamily>> {
        self.tables.read().values().cloned().collect()
    }

    pub fn non_system_column_families(&self) -> Vec<Arc<ColumnFamily>> {
        self.tables
            .read()
            .values()
            .filter(|cf| cf.schema().ks_name != SYSTEM_KEYSPACE)
            .cloned()
            .collect()
    }

    /// Drop a table: unregister, truncate (snapshotting if configured),
    /// then stop it.
    pub async fn drop_column_family(
        &self,
        ks_name: &str,
        cf_name: &str,
        truncated_at: impl Fn() -> i64,
    ) -> StoreResult<()> {
        let id = self.find_uuid(ks_name, cf_name)?;
        let keyspace = self.find_keyspace(ks_name)?;
        let cf = self.find_column_family_by_id(id)?;
        self.tables.write().remove(&id);
        self.ks_cf_to_id
            .write()
            .remove(&(ks_name.to_string(), cf_name.to_string()));
        keyspace.metadata().remove_table(cf_name);
        self.truncate_table(&keyspace, &cf, truncated_at).await?;
        cf.stop().await
    }

    // ---- write path ----

    fn dirty_for(&self, ks_name: &str) -> &Arc<DirtyMemoryManager> {
        if ks_name == SYSTEM_KEYSPACE {
            &self.system_dirty
        } else {
            &self.regular_dirty
        }
    }

    /// Durable write of one mutation: commitlog append, then memory-gated
    /// memtable apply. A replay-position reordering race retries the whole
    /// apply; it is rare enough that the extra log entry does not matter.
    pub fn apply(
        self: &Arc<Self>,
        schema: Arc<Schema>,
        mutation: FrozenMutation,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let db = self.clone();
        async move {
            let result = db.do_apply(&schema, &mutation).await;
            match result {
                Err(StoreError::ReplayPositionReordered) => {
                    debug!("replay position reordering detected; retrying");
                    db.apply(schema, mutation).await
                }
                Ok(()) => {
                    db.metrics.incr_total_writes();
                    Ok(())
                }
                Err(other) => Err(other),
            }
        }
        .boxed()
    }

    /// Convenience wrapper for un-frozen mutations.
    pub async fn apply_mutation(self: &Arc<Self>, mutation: &Mutation) -> StoreResult<()> {
        self.apply(mutation.schema.clone(), mutation.freeze()).await
    }

    async fn do_apply(&self, schema: &Arc<Schema>, mutation: &FrozenMutation) -> StoreResult<()> {
        let cf = self.find_column_family_by_id(mutation.table_id)?;
        if !schema.is_synced() {
            return Err(StoreError::SchemaNotSynced {
                ks: schema.ks_name.clone(),
                cf: schema.cf_name.clone(),
                version: schema.version,
            });
        }
        match cf.commitlog() {
            Some(commitlog) => {
                let rp = commitlog.append(mutation.table_id, mutation).await?;
                self.apply_in_memory(schema, mutation, rp).await
            }
            None => self.apply_in_memory(schema, mutation, ReplayPosition::ZERO).await,
        }
    }

    async fn apply_in_memory(
        &self,
        schema: &Arc<Schema>,
        mutation: &FrozenMutation,
        rp: ReplayPosition,
    ) -> StoreResult<()> {
        let dirty = self.dirty_for(&schema.ks_name).clone();
        let blocked_before = dirty.group().blocked_requests_counter();
        let result = dirty
            .run_when_memory_available(|| match self.find_column_family_by_id(mutation.table_id) {
                Ok(cf) => cf.apply_frozen(mutation, rp),
                Err(_) => {
                    error!(table = %mutation.table_id,
                           "attempting to mutate non-existent table");
                    Ok(())
                }
            })
            .await?;
        if dirty.group().blocked_requests_counter() > blocked_before {
            self.metrics.incr_requests_blocked_memory();
        }
        result
    }

    /// Apply a batch, warning once when its total data size crosses the
    /// configured threshold. The warning names the tables involved and the
    /// batch always proceeds.
    pub async fn apply_batch(
        self: &Arc<Self>,
        mutations: Vec<FrozenMutation>,
    ) -> StoreResult<()> {
        self.verify_batch_size(&mutations);
        for mutation in mutations {
            let schema = self.find_schema_by_id(mutation.table_id)?;
            self.apply(schema, mutation).await?;
        }
        Ok(())
    }

    fn verify_batch_size(&self, mutations: &[FrozenMutation]) {
        let size: u64 = mutations.iter().map(frozen_mutation_data_size).sum();
        if size <= self.config.batch_size_warn_threshold {
            return;
        }
        let tables: BTreeSet<String> = mutations
            .iter()
            .filter_map(|m| self.find_schema_by_id(m.table_id).ok())
            .map(|s| format!("{}.{}", s.ks_name, s.cf_name))
            .collect();
        let tables: Vec<String> = tables.into_iter().collect();
        warn!(
            size,
            threshold = self.config.batch_size_warn_threshold,
            tables = %tables.join(", "),
            "batch is of size {size} bytes, exceeding the warn threshold"
        );
        self.metrics.incr_oversized_batch_warnings();
    }

    /// Non-durable bulk write from a peer, gated by the streaming region
    /// group.
    pub async fn apply_streaming(
        self: &Arc<Self>,
        schema: Arc<Schema>,
        plan_id: StreamPlanId,
        mutation: FrozenMutation,
        fragmented: bool,
    ) -> StoreResult<()> {
        if !schema.is_synced() {
            return Err(StoreError::SchemaNotSynced {
                ks: schema.ks_name.clone(),
                cf: schema.cf_name.clone(),
                version: schema.version,
            });
        }
        self.streaming_dirty
            .run_when_memory_available(|| {
                match self.find_column_family_by_id(mutation.table_id) {
                    Ok(cf) => cf.apply_streaming_mutation(plan_id, &mutation, fragmented),
                    Err(_) => error!(table = %mutation.table_id,
                                     "streaming mutation for non-existent table"),
                }
            })
            .await
    }

    /// Commit a completed stream plan: flush its memtables and invalidate
    /// the cache over the transferred ranges.
    pub async fn flush_streaming(
        &self,
        table: TableId,
        plan_id: StreamPlanId,
        ranges: Vec<TokenRange>,
    ) -> StoreResult<()> {
        let cf = self.find_column_family_by_id(table)?;
        let ranges = ranges.into_iter().map(PartitionRange::Tokens).collect();
        cf.flush_streaming_mutations(plan_id, ranges).await
    }

    /// Abort a stream plan on this table.
    pub async fn fail_streaming(&self, table: TableId, plan_id: StreamPlanId) -> StoreResult<()> {
        self.find_column_family_by_id(table)?
            .fail_streaming_mutations(plan_id)
            .await
    }

    // ---- read path ----

    /// Cell-oriented query across partition ranges.
    pub async fn query(
        &self,
        cmd: ReadCommand,
        ranges: Vec<PartitionRange>,
    ) -> StoreResult<QueryResult> {
        let cf = self.find_column_family_by_id(cmd.table_id)?;
        let result = cf.query(&cmd, &ranges).await?;
        self.metrics.incr_total_reads();
        Ok(result)
    }

    /// Mutation-oriented query for digest reconciliation.
    pub async fn query_mutations(
        &self,
        cmd: ReadCommand,
        range: PartitionRange,
    ) -> StoreResult<ReconcilableResult> {
        let cf = self.find_column_family_by_id(cmd.table_id)?;
        let result = cf.query_mutations(&cmd, range).await?;
        self.metrics.incr_total_reads();
        Ok(result)
    }

    // ---- maintenance ----

    pub async fn flush_all_memtables(&self) -> StoreResult<()> {
        for cf in self.column_families() {
            cf.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&self, table: TableId) -> StoreResult<()> {
        self.find_column_family_by_id(table)?.flush().await
    }

    /// Probe every table's directory, then start shared-sstable rewrites.
    pub async fn populate_all(&self) -> StoreResult<()> {
        for cf in self.column_families() {
            let schema = cf.schema();
            info!(ks = %schema.ks_name, cf = %schema.cf_name, "reading column family");
            cf.populate().await.map_err(|err| {
                error!(ks = %schema.ks_name, cf = %schema.cf_name, error = %err,
                       "exception while populating keyspace");
                err
            })?;
        }
        // Rewrites must wait until every table knows which tombstones it
        // can drop and which generations are taken.
        for cf in self.column_families() {
            cf.start_rewrite();
        }
        Ok(())
    }

    /// Truncate one table: flush (durable) or clear, snapshot when
    /// configured, drop old sstables, persist the truncation record.
    pub async fn truncate(
        &self,
        ks_name: &str,
        cf_name: &str,
        truncated_at: impl Fn() -> i64,
    ) -> StoreResult<()> {
        let keyspace = self.find_keyspace(ks_name)?;
        let cf = self.find_column_family(ks_name, cf_name)?;
        self.truncate_table(&keyspace, &cf, truncated_at).await
    }

    async fn truncate_table(
        &self,
        keyspace: &Keyspace,
        cf: &Arc<ColumnFamily>,
        truncated_at: impl Fn() -> i64,
    ) -> StoreResult<()> {
        let durable = keyspace.metadata().durable_writes;
        let auto_snapshot = self.config.auto_snapshot;
        cf.run_with_compaction_disabled(async {
            if durable || auto_snapshot {
                cf.flush().await?;
            } else {
                cf.clear().await?;
            }
            debug!("discarding sstable data for truncated table");
            let truncated_at = truncated_at();
            if auto_snapshot {
                let tag = format!("{}-{}", truncated_at, cf.schema().cf_name);
                cf.snapshot(&tag).await?;
            }
            let rp = cf.discard_sstables(truncated_at).await?;
            self.truncation.save(cf.id(), truncated_at, rp);
            Ok(())
        })
        .await
    }

    /// Truncation record for a table, if one was persisted.
    pub fn truncation_record(&self, table: TableId) -> Option<(i64, ReplayPosition)> {
        self.truncation.load(table)
    }

    /// Snapshot one table under `tag`.
    pub async fn snapshot(&self, ks_name: &str, cf_name: &str, tag: &str) -> StoreResult<()> {
        self.find_column_family(ks_name, cf_name)?.snapshot(tag).await
    }

    /// Remove snapshots named `tag` (all snapshots when empty) across the
    /// given keyspaces, or every keyspace when none are named.
    pub async fn clear_snapshot(&self, tag: &str, keyspace_names: &[String]) -> StoreResult<()> {
        let keyspaces: Vec<String> = if keyspace_names.is_empty() {
            self.keyspaces.read().keys().cloned().collect()
        } else {
            for name in keyspace_names {
                if !self.has_keyspace(name) {
                    return Err(StoreError::NoSuchKeyspace(name.clone()));
                }
            }
            keyspace_names.to_vec()
        };
        for ks_name in keyspaces {
            for cf in self.column_families() {
                if cf.schema().ks_name == ks_name {
                    cf.clear_snapshot(tag).await?;
                }
            }
        }
        debug!("cleared out snapshot directories");
        Ok(())
    }

    /// Ordered shutdown: compaction, commitlog, tables, dirty managers.
    pub async fn stop(&self) -> StoreResult<()> {
        self.compaction.stop().await;
        if let Some(commitlog) = &self.commitlog {
            commitlog.shutdown().await?;
        }
        for cf in self.column_families() {
            if let Err(err) = cf.stop().await {
                warn!(error = %err, "table stop reported an error");
            }
        }
        self.system_dirty.shutdown().await;
        self.regular_dirty.shutdown().await;
        self.streaming_dirty.shutdown().await;
        self.shutdown.cancel();
        Ok(())
    }
}
