//! Per-shard column-family storage engine for a wide-column database.
//!
//! Each shard owns a disjoint slice of the token space and runs one
//! [`Database`]: a registry of keyspaces and column families, each with an
//! in-memory write buffer (memtable), immutable on-disk sorted tables
//! (sstables), and an optional row cache. The engine keeps four concerns
//! mutually consistent under continuous load:
//!
//! - **Replay ordering**: every durable write carries a monotone
//!   [`ReplayPosition`]; flushes discard commitlog segments strictly in
//!   position order.
//! - **Dirty-memory accounting**: hierarchical region groups
//!   (`system ⊇ regular ⊇ streaming`) with soft-limit flush triggers and
//!   hard-limit back-pressure on submitters.
//! - **Read merging**: reads combine a dynamic set of sources (memtables,
//!   the row cache or the sstables) and tolerate sources appearing and
//!   disappearing mid-scan.
//! - **Filter pushdown**: bloom filters, per-component clustering bounds
//!   and tombstone salvage prune sstables without ever dropping rows a
//!   correct merge would have returned.
//!
//! ## Key components
//!
//! - [`Database`]: routes writes through the commitlog and the dirty-memory
//!   managers, owns the read-concurrency classes
//! - [`ColumnFamily`]: one table's flush state machine, streaming ingest,
//!   directory probe, snapshot and truncate
//! - [`Memtable`] / [`MemtableList`]: the write buffer and its seal
//!   coalescing
//! - [`FlushQueue`]: replay-position-ordered commitlog discards
//! - [`RowCache`]: read-through partition cache with atomic memtable
//!   transfer on flush
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use shardstore::{
//!     Cell, Database, KeyspaceMetadata, Mutation, PartitionRange, ReadCommand, Schema,
//!     StoreConfig,
//! };
//!
//! # async fn example() -> shardstore::StoreResult<()> {
//! let db = Database::new(StoreConfig::default(), None);
//! let mut options = BTreeMap::new();
//! options.insert("replication_factor".to_string(), "1".to_string());
//! db.create_keyspace(KeyspaceMetadata::new("ks", "SimpleStrategy", options, true))
//!     .await?;
//! let schema = Arc::new(Schema::for_tests("ks", "events"));
//! db.add_column_family(schema.clone()).await?;
//!
//! let mut m = Mutation::new(schema.clone(), b"pk".to_vec());
//! m.set_cell(vec![b"ck".to_vec()], "v", Cell::live(1, b"value".to_vec()));
//! db.apply_mutation(&m).await?;
//!
//! let result = db
//!     .query(
//!         ReadCommand::new(schema.id),
//!         vec![PartitionRange::singular(m.key.clone())],
//!     )
//!     .await?;
//! assert_eq!(result.partitions.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! A shard is single-writer: mutations are pre-routed, so the hot path
//! needs no cross-shard coordination. Suspension points are explicit:
//! commitlog appends, sstable I/O, memory admission, semaphores. All
//! shared state is either copy-on-write (the sstable set) or snapshotted at
//! reader construction (the memtable list).

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod flush;
pub mod fs;
pub mod memory;
pub mod memtable;
pub mod metrics;
pub mod mutation;
pub mod position;
pub mod reader;
pub mod schema;
pub mod sstable;
pub mod streaming;
pub mod table;
pub mod test_support;
pub mod wal;

pub use cache::{PartitionPresenceChecker, PresenceResult, RowCache};
pub use config::{Generation, Priority, StoreConfig, TableId};
pub use database::{Database, MemoryTruncationStore, TruncationStore, SYSTEM_KEYSPACE};
pub use error::{StoreError, StoreResult};
pub use flush::FlushQueue;
pub use memory::{DirtyMemoryManager, MemoryRegion, RegionGroup};
pub use memtable::{FlushBehavior, Memtable, MemtableList};
pub use metrics::{DbMetrics, DbMetricsSnapshot, TableMetrics, TableMetricsSnapshot};
pub use mutation::{
    Cell, CellValue, ClusteringKey, ClusteringRange, DecoratedKey, FrozenMutation, Mutation,
    PartitionData, PartitionRange, QuerySlice, RangeTombstone, Row, Token, TokenRange, Tombstone,
};
pub use position::ReplayPosition;
pub use reader::{
    MutationReader, QueryResult, ReadCommand, ReadConcurrencyConfig, ReconcilableResult,
    ResultPartition,
};
pub use schema::{
    Endpoint, Keyspace, KeyspaceMetadata, ReplicationStrategy, Schema, SimpleStrategy,
    StrategyHolder, TokenMetadata,
};
pub use sstable::{BloomFilter, EntryDescriptor, Sstable, SstableMetadata, SstableSet};
pub use streaming::{Messaging, StreamPlanId, StreamTransferTask};
pub use table::{ColumnFamily, CompactionScheduler, NoopCompaction, SnapshotDetails, TableConfig};
pub use wal::{CommitLog, FlushHandler};
