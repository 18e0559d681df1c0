//! Reference sstable codec.
//!
//! The engine core is format-agnostic: everything it needs from an sstable
//! flows through this module (write a memtable snapshot out, open the
//! statistics back up, load partitions, delete a generation atomically).
//! The layout here is deliberately plain (bincode payloads with a crc64
//! checksum) and is not a compatibility surface.
//!
//! Component lifecycle during a write: a `TOC.txt.tmp` marker goes down
//! first, payload components follow, and the real `TOC.txt` is written last.
//! A generation is complete exactly when its TOC exists; the directory probe
//! treats a lone temporary TOC as a crashed write.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crc64fast_nvme::Digest;
use tracing::debug;

use crate::config::Generation;
use crate::error::{StoreError, StoreResult};
use crate::fs::sync_dir;
use crate::mutation::{DecoratedKey, PartitionData};
use crate::position::ReplayPosition;
use crate::schema::Schema;
use crate::sstable::{
    component_filename, BloomFilter, ClusteringComponentRange, ComponentType, Sstable,
    SstableMetadata, SSTABLE_VERSION,
};
use crate::test_support::{sstable_delete_override, sstable_write_override, SstableWriteContext};

const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(bytes);
    digest.sum64()
}

fn component_path(
    dir: &Path,
    ks: &str,
    cf: &str,
    version: &str,
    generation: Generation,
    component: ComponentType,
) -> PathBuf {
    dir.join(component_filename(ks, cf, version, generation, component))
}

/// Write a sorted partition snapshot as a fresh sstable generation.
pub async fn write_components(
    schema: &Schema,
    dir: &Path,
    generation: Generation,
    partitions: Vec<(DecoratedKey, PartitionData)>,
    replay_position: ReplayPosition,
) -> StoreResult<Arc<Sstable>> {
    if partitions.is_empty() {
        return Err(StoreError::invalid_state(
            "refusing to write an empty sstable",
        ));
    }
    let ctx = SstableWriteContext {
        ks: schema.ks_name.clone(),
        cf: schema.cf_name.clone(),
        generation,
    };
    if let Some(result) = sstable_write_override(&ctx) {
        result?;
    }

    let ks = &schema.ks_name;
    let cf = &schema.cf_name;
    let path_of = |component| component_path(dir, ks, cf, SSTABLE_VERSION, generation, component);

    let data_bytes =
        bincode::serialize(&partitions).map_err(StoreError::serialization)?;

    let mut bloom = BloomFilter::with_capacity(partitions.len(), BLOOM_FALSE_POSITIVE_RATE);
    for (key, _) in &partitions {
        bloom.insert(&key.key);
    }

    let meta = SstableMetadata {
        ks: ks.clone(),
        cf: cf.clone(),
        version: SSTABLE_VERSION.to_string(),
        generation,
        min_timestamp: partitions
            .iter()
            .filter_map(|(_, p)| p.min_timestamp())
            .min()
            .unwrap_or(0),
        max_timestamp: partitions
            .iter()
            .filter_map(|(_, p)| p.max_timestamp())
            .max()
            .unwrap_or(0),
        tombstone_count: partitions.iter().map(|(_, p)| p.tombstone_count()).sum(),
        clustering_components: clustering_bounds(schema, &partitions),
        first_key: partitions
            .first()
            .map(|(k, _)| k.clone())
            .expect("non-empty checked above"),
        last_key: partitions
            .last()
            .map(|(k, _)| k.clone())
            .expect("non-empty checked above"),
        partition_count: partitions.len() as u64,
        data_size: data_bytes.len() as u64,
        data_checksum: checksum(&data_bytes),
        max_data_age: now_millis(),
        replay_position,
    };
    let stats_bytes = bincode::serialize(&meta).map_err(StoreError::serialization)?;

    tokio::fs::create_dir_all(dir).await?;

    // Incomplete-write marker; replaced by the real TOC once every payload
    // component is durable.
    let toc_listing = ComponentType::LIVE
        .iter()
        .map(|c| component_filename(ks, cf, SSTABLE_VERSION, generation, *c))
        .collect::<Vec<_>>()
        .join("\n");
    tokio::fs::write(path_of(ComponentType::TemporaryToc), &toc_listing).await?;
    tokio::fs::write(path_of(ComponentType::Data), &data_bytes).await?;
    tokio::fs::write(path_of(ComponentType::Filter), bloom.to_bytes()).await?;
    tokio::fs::write(path_of(ComponentType::Statistics), &stats_bytes).await?;
    tokio::fs::write(path_of(ComponentType::Toc), &toc_listing).await?;
    tokio::fs::remove_file(path_of(ComponentType::TemporaryToc)).await?;
    sync_dir(dir).await?;

    debug!(ks = %ks, cf = %cf, generation = generation.as_u64(),
           partitions = meta.partition_count, bytes = meta.data_size,
           "wrote sstable components");

    let sstable = Sstable::from_parts(meta, bloom, dir.to_path_buf());
    let data: Vec<(DecoratedKey, PartitionData)> = partitions;
    // Seed the partition cache; flushes read what they just wrote.
    let _ = sstable.prime_data(data);
    Ok(sstable)
}

fn clustering_bounds(
    schema: &Schema,
    partitions: &[(DecoratedKey, PartitionData)],
) -> Vec<ClusteringComponentRange> {
    let mut bounds: Vec<Option<ClusteringComponentRange>> =
        vec![None; schema.clustering_key_size];
    for (_, partition) in partitions {
        for ck in partition.rows.keys() {
            for (i, component) in ck.iter().enumerate().take(bounds.len()) {
                if let Some(range) = bounds[i].as_mut() {
                    if *component < range.min {
                        range.min = component.clone();
                    }
                    if *component > range.max {
                        range.max = component.clone();
                    }
                } else {
                    bounds[i] = Some(ClusteringComponentRange {
                        min: component.clone(),
                        max: component.clone(),
                    });
                }
            }
        }
    }
    bounds.into_iter().flatten().collect()
}

/// Open an sstable generation from its on-disk components.
pub async fn open(
    dir: &Path,
    ks: &str,
    cf: &str,
    version: &str,
    generation: Generation,
) -> StoreResult<Arc<Sstable>> {
    let toc = component_path(dir, ks, cf, version, generation, ComponentType::Toc);
    if !toc.exists() {
        return Err(StoreError::malformed_sstable(
            toc.display(),
            "missing TOC",
        ));
    }
    let stats_path = component_path(dir, ks, cf, version, generation, ComponentType::Statistics);
    let stats_bytes = tokio::fs::read(&stats_path).await.map_err(|err| {
        StoreError::malformed_sstable(stats_path.display(), format!("unreadable statistics: {err}"))
    })?;
    let meta: SstableMetadata = bincode::deserialize(&stats_bytes).map_err(|err| {
        StoreError::malformed_sstable(stats_path.display(), format!("bad statistics: {err}"))
    })?;

    let filter_path = component_path(dir, ks, cf, version, generation, ComponentType::Filter);
    let filter_bytes = tokio::fs::read(&filter_path).await.map_err(|err| {
        StoreError::malformed_sstable(filter_path.display(), format!("unreadable filter: {err}"))
    })?;
    let bloom = BloomFilter::from_bytes(&filter_bytes).map_err(|_| {
        StoreError::malformed_sstable(filter_path.display(), "bad filter component")
    })?;

    let data_path = component_path(dir, ks, cf, version, generation, ComponentType::Data);
    if !data_path.exists() {
        return Err(StoreError::malformed_sstable(
            data_path.display(),
            "missing data component",
        ));
    }
    Ok(Sstable::from_parts(meta, bloom, dir.to_path_buf()))
}

/// Load and checksum-verify the partition payload of `sstable`.
pub(crate) async fn load_data(
    sstable: &Sstable,
) -> StoreResult<Vec<(DecoratedKey, PartitionData)>> {
    let path = sstable.filename(ComponentType::Data);
    let bytes = tokio::fs::read(&path).await?;
    if checksum(&bytes) != sstable.meta.data_checksum {
        return Err(StoreError::malformed_sstable(
            path.display(),
            "data checksum mismatch",
        ));
    }
    bincode::deserialize(&bytes).map_err(|err| {
        StoreError::malformed_sstable(path.display(), format!("bad data component: {err}"))
    })
}

/// Delete a set of sstables so that either all of them disappear or the
/// failure leaves every survivor probe-recoverable. The TOC goes first:
/// once it is gone the generation reads as a crashed write and the probe
/// cleans up the leftovers.
pub async fn delete_atomically(sstables: &[Arc<Sstable>]) -> StoreResult<()> {
    if let Some(result) = sstable_delete_override(sstables) {
        return result;
    }
    for sstable in sstables {
        sstable.mark_for_deletion();
        remove_file_if_exists(&sstable.toc_filename()).await?;
    }
    for sstable in sstables {
        for component in [
            ComponentType::Data,
            ComponentType::Filter,
            ComponentType::Statistics,
        ] {
            remove_file_if_exists(&sstable.filename(component)).await?;
        }
        debug!(generation = sstable.generation().as_u64(), "deleted sstable");
    }
    Ok(())
}

/// Remove every component a generation may have left behind, temporaries
/// included. Used by the probe to clean up crashed writes.
pub async fn remove_components(
    dir: &Path,
    ks: &str,
    cf: &str,
    version: &str,
    generation: Generation,
) -> StoreResult<()> {
    for component in [
        ComponentType::Toc,
        ComponentType::TemporaryToc,
        ComponentType::Data,
        ComponentType::Filter,
        ComponentType::Statistics,
        ComponentType::TemporaryStatistics,
    ] {
        remove_file_if_exists(&component_path(dir, ks, cf, version, generation, component))
            .await?;
    }
    Ok(())
}

async fn remove_file_if_exists(path: &Path) -> StoreResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Cell, Mutation};
    use tempfile::TempDir;

    fn sample_partitions(schema: &Arc<Schema>) -> Vec<(DecoratedKey, PartitionData)> {
        let mut mutations = Vec::new();
        for (pk, ck, ts) in [(b"pk1", "a", 10i64), (b"pk2", "b", 20i64)] {
            let mut m = Mutation::new(schema.clone(), pk.to_vec());
            m.set_cell(
                vec![ck.as_bytes().to_vec()],
                "v",
                Cell::live(ts, b"value".to_vec()),
            );
            mutations.push((m.key.clone(), m.partition.clone()));
        }
        mutations.sort_by(|a, b| a.0.cmp(&b.0));
        mutations
    }

    #[tokio::test]
    async fn write_open_read_round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        let schema = Arc::new(Schema::for_tests("ks", "cf"));
        let partitions = sample_partitions(&schema);
        let first = partitions[0].0.clone();

        let written = write_components(
            &schema,
            tmp.path(),
            Generation::new(1),
            partitions.clone(),
            ReplayPosition::new(3, 9),
        )
        .await
        .expect("write");
        assert_eq!(written.meta.partition_count, 2);
        assert_eq!(written.meta.replay_position, ReplayPosition::new(3, 9));
        assert_eq!(written.meta.min_timestamp, 10);
        assert_eq!(written.meta.max_timestamp, 20);
        assert!(!written.filename(ComponentType::TemporaryToc).exists());

        let opened = open(tmp.path(), "ks", "cf", SSTABLE_VERSION, Generation::new(1))
            .await
            .expect("open");
        assert!(opened.filter_has_key(&first));
        let partition = opened.read_partition(&first).await.expect("read");
        assert_eq!(partition, Some(partitions[0].1.clone()));
        assert_eq!(
            opened.read_partition(&DecoratedKey::from_key(b"nope".to_vec())).await.expect("read"),
            None
        );
    }

    #[tokio::test]
    async fn corrupt_data_fails_checksum() {
        let tmp = TempDir::new().expect("tempdir");
        let schema = Arc::new(Schema::for_tests("ks", "cf"));
        let partitions = sample_partitions(&schema);
        let first = partitions[0].0.clone();
        write_components(
            &schema,
            tmp.path(),
            Generation::new(1),
            partitions,
            ReplayPosition::ZERO,
        )
        .await
        .expect("write");

        let opened = open(tmp.path(), "ks", "cf", SSTABLE_VERSION, Generation::new(1))
            .await
            .expect("open");
        let data_path = opened.filename(ComponentType::Data);
        let mut bytes = std::fs::read(&data_path).expect("read data");
        bytes[0] ^= 0xff;
        std::fs::write(&data_path, bytes).expect("rewrite data");

        let err = opened.read_partition(&first).await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedSstable { .. }));
    }

    #[tokio::test]
    async fn delete_removes_toc_first_then_everything() {
        let tmp = TempDir::new().expect("tempdir");
        let schema = Arc::new(Schema::for_tests("ks", "cf"));
        let written = write_components(
            &schema,
            tmp.path(),
            Generation::new(1),
            sample_partitions(&schema),
            ReplayPosition::ZERO,
        )
        .await
        .expect("write");

        delete_atomically(&[written.clone()]).await.expect("delete");
        for component in ComponentType::LIVE {
            assert!(!written.filename(component).exists());
        }
        assert!(written.is_marked_for_deletion());
    }
}
