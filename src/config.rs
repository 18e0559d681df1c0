use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default cap on real dirty memory when the config leaves it at zero,
/// expressed as a fraction of [`StoreConfig::process_memory`].
const DEFAULT_MEMTABLE_SPACE_DIVISOR: u64 = 2;

/// Extra headroom granted to the system region group so system writes keep
/// flowing while user writes are throttled.
const SYSTEM_MEMORY_SLACK: u64 = 10 << 20; // 10 MiB

/// Default warning threshold for oversized batches.
const DEFAULT_BATCH_SIZE_WARN_THRESHOLD: u64 = 64 * 1024; // 64 KiB

/// Default timeout applied by the restricted reader to user reads.
const DEFAULT_READ_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default number of concurrently admitted sstable reads.
const DEFAULT_MAX_CONCURRENT_READS: usize = 64;

/// Default number of concurrently admitted system-table reads.
const DEFAULT_MAX_SYSTEM_CONCURRENT_READS: usize = 32;

/// Default cap on readers queued behind the concurrency semaphore.
const DEFAULT_MAX_READ_QUEUE_LENGTH: usize = 512;

/// How long a delayed streaming seal may wait before firing on its own.
const DEFAULT_DELAYED_STREAMING_FLUSH_MS: u64 = 2_000;

/// Pause between attempts when an sstable write fails during flush.
const DEFAULT_FLUSH_RETRY_DELAY_MS: u64 = 10_000;

/// Assumed process memory when none is configured (tests, tools).
const DEFAULT_PROCESS_MEMORY: u64 = 1 << 30; // 1 GiB

/// Identifier of a column family, stable across schema changes.
///
/// Mirrors the schema id: a table keeps its id for its whole life, across
/// renames and alters, and the id keys the on-disk directory name as well as
/// commitlog entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub Uuid);

impl TableId {
    #[inline]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    #[inline]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Hex form with dashes stripped, used in directory names.
    pub fn dirname_fragment(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Generation number of an sstable, monotone per shard.
///
/// Fresh generations are allocated when a memtable flush, a streaming seal,
/// or a compaction produces a new sstable. Generation numbers order sstables
/// chronologically within one table directory and appear in every component
/// filename.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Scheduling class a read runs under.
///
/// Selects which read-concurrency configuration gates the reader: user reads
/// carry a timeout and an overload cap, system reads use their own semaphore
/// so user pressure cannot starve them, and streaming reads run untimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    User,
    System,
    Streaming,
}

/// Primary configuration surface for one shard of the storage engine.
///
/// A shard owns a disjoint slice of the token space; mutations arriving here
/// are pre-routed. The configuration fixes the memory budget split across the
/// three dirty-memory region groups, the read admission limits, and the
/// on-disk layout root.
///
/// # Example
///
/// ```rust
/// use shardstore::StoreConfig;
/// use std::path::PathBuf;
///
/// let config = StoreConfig {
///     data_dir: PathBuf::from("/var/lib/shardstore/data"),
///     memtable_total_space: 256 << 20,
///     enable_cache: true,
///     ..StoreConfig::default()
/// }
/// .normalized();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root data directory; keyspace directories are created beneath it.
    pub data_dir: PathBuf,

    /// Index of this shard within the node.
    pub shard_id: u32,

    /// Number of shards the node runs. Used to decide sstable ownership and
    /// to filter shared sstables on the read path.
    pub shard_count: u32,

    /// Cap on real dirty memory across all regular memtables (bytes).
    /// Zero selects half of `process_memory`.
    pub memtable_total_space: u64,

    /// Process memory figure used to derive defaults. Tests override this to
    /// keep budgets small.
    pub process_memory: u64,

    /// Batches larger than this many bytes log one warning naming the
    /// tables involved. Advisory only, never fails the write.
    pub batch_size_warn_threshold: u64,

    /// When false, memtables never flush and the engine is memory-only.
    pub enable_disk_writes: bool,

    /// When false, reads bypass the row cache and go straight to sstables.
    pub enable_cache: bool,

    /// When false, writes skip the commitlog and are non-durable.
    pub enable_commitlog: bool,

    /// Snapshot a table before truncating or dropping it.
    pub auto_snapshot: bool,

    /// Hard-link freshly flushed sstables into a `backups/` sibling.
    pub incremental_backups: bool,

    /// Comma-separated initial token assignment for this node.
    pub initial_token: String,

    /// Timeout applied by the restricted reader to user reads.
    pub read_request_timeout: Duration,

    /// Concurrently admitted user reads.
    pub max_concurrent_reads: usize,

    /// Concurrently admitted system-table reads.
    pub max_system_concurrent_reads: usize,

    /// Readers queued beyond this bound fail with `Overloaded`.
    pub max_read_queue_length: usize,

    /// Partitions larger than this are not retained by the row cache.
    pub max_cached_partition_size: u64,

    /// Delay before an armed streaming seal fires on its own.
    pub delayed_streaming_flush_interval: Duration,

    /// Pause between attempts when an sstable write fails during flush.
    pub flush_retry_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            shard_id: 0,
            shard_count: 1,
            memtable_total_space: 0,
            process_memory: DEFAULT_PROCESS_MEMORY,
            batch_size_warn_threshold: DEFAULT_BATCH_SIZE_WARN_THRESHOLD,
            enable_disk_writes: true,
            enable_cache: true,
            enable_commitlog: true,
            auto_snapshot: true,
            incremental_backups: false,
            initial_token: String::new(),
            read_request_timeout: Duration::from_millis(DEFAULT_READ_REQUEST_TIMEOUT_MS),
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            max_system_concurrent_reads: DEFAULT_MAX_SYSTEM_CONCURRENT_READS,
            max_read_queue_length: DEFAULT_MAX_READ_QUEUE_LENGTH,
            max_cached_partition_size: 10 << 20,
            delayed_streaming_flush_interval: Duration::from_millis(
                DEFAULT_DELAYED_STREAMING_FLUSH_MS,
            ),
            flush_retry_delay: Duration::from_millis(DEFAULT_FLUSH_RETRY_DELAY_MS),
        }
    }
}

impl StoreConfig {
    /// Returns a copy with derived values resolved and invalid values
    /// replaced by safe ones.
    pub fn normalized(mut self) -> Self {
        if self.shard_count == 0 {
            self.shard_count = 1;
        }
        if self.shard_id >= self.shard_count {
            self.shard_id = 0;
        }
        if self.process_memory == 0 {
            self.process_memory = DEFAULT_PROCESS_MEMORY;
        }
        if self.memtable_total_space == 0 {
            self.memtable_total_space = self.process_memory / DEFAULT_MEMTABLE_SPACE_DIVISOR;
        }
        if self.max_concurrent_reads == 0 {
            self.max_concurrent_reads = 1;
        }
        if self.max_system_concurrent_reads == 0 {
            self.max_system_concurrent_reads = 1;
        }
        self
    }

    /// Cap applied to the regular dirty region group. Half of the memtable
    /// budget: flushes can take a while, and capping the group at half lets
    /// virtual-dirty pre-release keep writes flowing while a flush drains.
    pub fn regular_dirty_limit(&self) -> u64 {
        self.memtable_total_space / 2
    }

    /// Cap applied to the streaming dirty region group.
    pub fn streaming_dirty_limit(&self) -> u64 {
        (self.memtable_total_space / 4) / 2
    }

    /// Cap applied to the system dirty region group, with slack so system
    /// writes keep being serviced even while user writes throttle.
    pub fn system_dirty_limit(&self) -> u64 {
        self.memtable_total_space / 2 + SYSTEM_MEMORY_SLACK
    }

    /// Parses the `initial_token` list: comma or space separated, empty
    /// entries dropped.
    pub fn initial_tokens(&self) -> Vec<String> {
        self.initial_token
            .split([',', ' '])
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    }

    /// Small-budget configuration for unit and integration tests.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            process_memory: 64 << 20,
            memtable_total_space: 8 << 20,
            read_request_timeout: Duration::from_millis(500),
            delayed_streaming_flush_interval: Duration::from_millis(50),
            flush_retry_delay: Duration::from_millis(20),
            ..Self::default()
        }
        .normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = StoreConfig::default().normalized();
        assert!(cfg.memtable_total_space > 0);
        assert_eq!(cfg.memtable_total_space, cfg.process_memory / 2);
        assert!(cfg.regular_dirty_limit() <= cfg.memtable_total_space);
        assert!(cfg.streaming_dirty_limit() < cfg.regular_dirty_limit());
        assert!(cfg.system_dirty_limit() > cfg.regular_dirty_limit());
        assert_eq!(cfg.shard_count, 1);
    }

    #[test]
    fn normalized_fixes_shard_bounds() {
        let cfg = StoreConfig {
            shard_id: 9,
            shard_count: 0,
            ..StoreConfig::default()
        }
        .normalized();
        assert_eq!(cfg.shard_count, 1);
        assert_eq!(cfg.shard_id, 0);
    }

    #[test]
    fn initial_tokens_split_and_drop_empties() {
        let cfg = StoreConfig {
            initial_token: "100, 200,,300 ".to_string(),
            ..StoreConfig::default()
        };
        assert_eq!(cfg.initial_tokens(), vec!["100", "200", "300"]);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = StoreConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: StoreConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn table_id_dirname_fragment_has_no_dashes() {
        let id = TableId::new_random();
        assert!(!id.dirname_fragment().contains('-'));
    }
}
