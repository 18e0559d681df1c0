//! Immutable on-disk sorted tables: reference views, component naming,
//! selection sets and the single-key filter pipeline.
//!
//! The engine treats sstable payload I/O as a collaborator concern; the
//! [`codec`] module is the seam. Everything else here (metadata, bloom
//! filters, component lifecycle, selection) is engine-owned.

pub mod bloom;
pub mod codec;
pub mod filter;
pub mod set;

pub use bloom::BloomFilter;
pub use filter::filter_for_single_key;
pub use set::SstableSet;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::config::Generation;
use crate::error::{StoreError, StoreResult};
use crate::mutation::{DecoratedKey, PartitionData, PartitionRange};
use crate::position::ReplayPosition;

/// On-disk format version carried in every component filename.
pub const SSTABLE_VERSION: &str = "rs1";

/// Component files making up one sstable generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentType {
    Data,
    Filter,
    Statistics,
    Toc,
    TemporaryToc,
    TemporaryStatistics,
}

impl ComponentType {
    /// All components of a complete sstable, TOC last.
    pub const LIVE: [ComponentType; 4] = [
        ComponentType::Data,
        ComponentType::Filter,
        ComponentType::Statistics,
        ComponentType::Toc,
    ];

    pub fn file_suffix(self) -> &'static str {
        match self {
            ComponentType::Data => "Data.db",
            ComponentType::Filter => "Filter.db",
            ComponentType::Statistics => "Statistics.db",
            ComponentType::Toc => "TOC.txt",
            ComponentType::TemporaryToc => "TOC.txt.tmp",
            ComponentType::TemporaryStatistics => "Statistics.db.tmp",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "Data.db" => Some(ComponentType::Data),
            "Filter.db" => Some(ComponentType::Filter),
            "Statistics.db" => Some(ComponentType::Statistics),
            "TOC.txt" => Some(ComponentType::Toc),
            "TOC.txt.tmp" => Some(ComponentType::TemporaryToc),
            "Statistics.db.tmp" => Some(ComponentType::TemporaryStatistics),
            _ => None,
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_suffix())
    }
}

/// Parsed component filename: `<ks>-<cf>-<version>-<generation>-<Component>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub ks: String,
    pub cf: String,
    pub version: String,
    pub generation: Generation,
    pub component: ComponentType,
}

impl EntryDescriptor {
    pub fn make_descriptor(filename: &str) -> StoreResult<EntryDescriptor> {
        let parts: Vec<&str> = filename.splitn(5, '-').collect();
        if parts.len() != 5 {
            return Err(StoreError::malformed_sstable(
                filename,
                "expected <ks>-<cf>-<version>-<generation>-<Component>",
            ));
        }
        let generation = parts[3].parse::<u64>().map_err(|_| {
            StoreError::malformed_sstable(filename, "generation is not numeric")
        })?;
        let component = ComponentType::from_suffix(parts[4]).ok_or_else(|| {
            StoreError::malformed_sstable(filename, format!("unknown component {}", parts[4]))
        })?;
        Ok(EntryDescriptor {
            ks: parts[0].to_string(),
            cf: parts[1].to_string(),
            version: parts[2].to_string(),
            generation: Generation::new(generation),
            component,
        })
    }

    pub fn filename(&self) -> String {
        component_filename(&self.ks, &self.cf, &self.version, self.generation, self.component)
    }
}

pub fn component_filename(
    ks: &str,
    cf: &str,
    version: &str,
    generation: Generation,
    component: ComponentType,
) -> String {
    format!("{ks}-{cf}-{version}-{generation}-{component}")
}

/// Persisted per-component clustering bounds: the smallest and largest value
/// this sstable stores for one clustering component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringComponentRange {
    pub min: Vec<u8>,
    pub max: Vec<u8>,
}

/// Statistics persisted alongside the data, loaded at probe time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SstableMetadata {
    pub ks: String,
    pub cf: String,
    pub version: String,
    pub generation: Generation,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    /// Deletion markers contained, any kind. Non-zero means a dropped
    /// candidate may still be masking rows elsewhere.
    pub tombstone_count: u64,
    pub clustering_components: Vec<ClusteringComponentRange>,
    pub first_key: DecoratedKey,
    pub last_key: DecoratedKey,
    pub partition_count: u64,
    pub data_size: u64,
    pub data_checksum: u64,
    /// Wall-clock milliseconds when the newest data in this table was
    /// written; truncation drops tables whose age is at or below the cut.
    pub max_data_age: i64,
    /// Highest replay position flushed into this table.
    pub replay_position: ReplayPosition,
}

/// Reference view of one immutable on-disk table.
///
/// Shared across the copy-on-write [`SstableSet`]; readers and compactions
/// hold `Arc` references that keep the object alive after it leaves the set.
pub struct Sstable {
    pub meta: SstableMetadata,
    bloom: BloomFilter,
    dir: PathBuf,
    level: AtomicU32,
    shared: AtomicBool,
    marked_for_deletion: AtomicBool,
    data: OnceCell<Arc<Vec<(DecoratedKey, PartitionData)>>>,
}

impl Sstable {
    pub(crate) fn from_parts(meta: SstableMetadata, bloom: BloomFilter, dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            meta,
            bloom,
            dir,
            level: AtomicU32::new(0),
            shared: AtomicBool::new(true),
            marked_for_deletion: AtomicBool::new(false),
            data: OnceCell::new(),
        })
    }

    pub fn generation(&self) -> Generation {
        self.meta.generation
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn level(&self) -> u32 {
        self.level.load(Ordering::Acquire)
    }

    pub fn set_level(&self, level: u32) {
        self.level.store(level, Ordering::Release);
    }

    /// Owned by more than one shard. Shared tables are read through the
    /// shard-ownership filter and queued for split-rewrite at load.
    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    pub fn set_unshared(&self) {
        self.shared.store(false, Ordering::Release);
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.meta.data_size
    }

    /// Bloom check for one partition key.
    pub fn filter_has_key(&self, key: &DecoratedKey) -> bool {
        self.bloom.may_contain(&key.key)
    }

    pub fn filename(&self, component: ComponentType) -> PathBuf {
        self.dir.join(component_filename(
            &self.meta.ks,
            &self.meta.cf,
            &self.meta.version,
            self.meta.generation,
            component,
        ))
    }

    pub fn toc_filename(&self) -> PathBuf {
        self.filename(ComponentType::Toc)
    }

    /// Shards whose token sub-ranges intersect `[first_key, last_key]`.
    pub fn owner_shards(&self, shard_count: u32) -> Vec<u32> {
        let shard_count = shard_count.max(1);
        let first = self.meta.first_key.token.0;
        let last = self.meta.last_key.token.0.max(first);
        if last - first + 1 >= shard_count as u64 {
            return (0..shard_count).collect();
        }
        let mut shards = Vec::new();
        let mut token = first;
        loop {
            let shard = (token % shard_count as u64) as u32;
            if !shards.contains(&shard) {
                shards.push(shard);
            }
            if token == last {
                break;
            }
            token += 1;
        }
        shards.sort_unstable();
        shards
    }

    /// Seed the in-memory partition cache. A freshly written sstable primes
    /// itself so the flush pipeline never re-reads what it just wrote.
    pub(crate) fn prime_data(&self, data: Vec<(DecoratedKey, PartitionData)>) -> bool {
        self.data.set(Arc::new(data)).is_ok()
    }

    async fn data(&self) -> StoreResult<&Arc<Vec<(DecoratedKey, PartitionData)>>> {
        self.data
            .get_or_try_init(|| async { codec::load_data(self).await.map(Arc::new) })
            .await
    }

    /// Read one partition if present.
    pub async fn read_partition(&self, key: &DecoratedKey) -> StoreResult<Option<PartitionData>> {
        let data = self.data().await?;
        Ok(data
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| data[idx].1.clone()))
    }

    /// Partitions overlapping `range`, in key order.
    pub async fn scan_range(
        &self,
        range: &PartitionRange,
    ) -> StoreResult<Vec<(DecoratedKey, PartitionData)>> {
        let data = self.data().await?;
        Ok(data
            .iter()
            .filter(|(key, _)| range.contains(key))
            .map(|(key, partition)| (key.clone(), partition.clone()))
            .collect())
    }

    /// Hard-link every live component into `target_dir`, keeping names.
    pub async fn create_links(&self, target_dir: &Path) -> StoreResult<()> {
        for component in ComponentType::LIVE {
            let source = self.filename(component);
            let target = target_dir.join(
                source
                    .file_name()
                    .expect("component path always has a file name"),
            );
            match tokio::fs::hard_link(&source, &target).await {
                Ok(()) => {}
                // Shared tables get linked once per owning shard; one wins.
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Sstable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sstable")
            .field("ks", &self.meta.ks)
            .field("cf", &self.meta.cf)
            .field("generation", &self.meta.generation)
            .field("partitions", &self.meta.partition_count)
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trip() {
        let descriptor =
            EntryDescriptor::make_descriptor("ks1-events-rs1-42-Data.db").expect("parse");
        assert_eq!(descriptor.ks, "ks1");
        assert_eq!(descriptor.cf, "events");
        assert_eq!(descriptor.version, "rs1");
        assert_eq!(descriptor.generation, Generation::new(42));
        assert_eq!(descriptor.component, ComponentType::Data);
        assert_eq!(descriptor.filename(), "ks1-events-rs1-42-Data.db");
    }

    #[test]
    fn descriptor_recognizes_temporaries() {
        let toc = EntryDescriptor::make_descriptor("ks-cf-rs1-7-TOC.txt.tmp").expect("parse");
        assert_eq!(toc.component, ComponentType::TemporaryToc);
        let stats =
            EntryDescriptor::make_descriptor("ks-cf-rs1-7-Statistics.db.tmp").expect("parse");
        assert_eq!(stats.component, ComponentType::TemporaryStatistics);
    }

    #[test]
    fn descriptor_rejects_garbage() {
        assert!(EntryDescriptor::make_descriptor("manifest.json").is_err());
        assert!(EntryDescriptor::make_descriptor("ks-cf-rs1-x-Data.db").is_err());
        assert!(EntryDescriptor::make_descriptor("ks-cf-rs1-5-Unknown.db").is_err());
    }
}
