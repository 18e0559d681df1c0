//! Filter pushdown correctness: clustering-range pruning with tombstone
//! salvage, and shard-ownership filtering of shared sstables.

use std::collections::BTreeMap;
use std::sync::Arc;

use shardstore::sstable::codec;
use shardstore::test_support::MemoryCommitLog;
use shardstore::{
    Cell, Database, DecoratedKey, Generation, KeyspaceMetadata, Mutation, PartitionRange,
    QuerySlice, ReadCommand, ReplayPosition, Schema, StoreConfig, Token, Tombstone,
};
use tempfile::TempDir;

fn ck(s: &str) -> Vec<Vec<u8>> {
    vec![s.as_bytes().to_vec()]
}

async fn setup_no_cache(tmp: &TempDir) -> (Arc<Database>, Arc<Schema>) {
    let mut config = StoreConfig::for_tests(tmp.path().to_path_buf());
    // Reads go straight to the sstables so the filter pipeline is on the
    // query path.
    config.enable_cache = false;
    let commitlog = MemoryCommitLog::new();
    let db = Database::new(config, Some(commitlog));
    let mut options = BTreeMap::new();
    options.insert("replication_factor".to_string(), "1".to_string());
    db.create_keyspace(KeyspaceMetadata::new("ks", "SimpleStrategy", options, true))
        .await
        .expect("create keyspace");
    let schema = Arc::new(Schema::for_tests("ks", "events"));
    db.add_column_family(schema.clone()).await.expect("add table");
    (db, schema)
}

#[tokio::test]
async fn tombstone_salvage_keeps_the_deletion_visible() {
    let tmp = TempDir::new().expect("tempdir");
    let (db, schema) = setup_no_cache(&tmp).await;
    let cf = db.find_column_family("ks", "events").expect("table");

    // Sstable A: the row at ck "a", written at ts 5.
    let mut row = Mutation::new(schema.clone(), b"foo".to_vec());
    row.set_cell(ck("a"), "v", Cell::live(5, b"1".to_vec()));
    db.apply_mutation(&row).await.expect("apply row");
    cf.flush().await.expect("flush A");

    // Sstable B: a row at ck "m" plus a range tombstone over [a, z], both
    // at ts 10. B's clustering bounds are [m, m], so a ck=a filter drops
    // it; only the salvage step brings the deletion back.
    let mut deletion = Mutation::new(schema.clone(), b"foo".to_vec());
    deletion.set_cell(ck("m"), "v", Cell::live(10, b"2".to_vec()));
    deletion.range_delete(ck("a"), ck("z"), Tombstone::new(10, 1_000));
    db.apply_mutation(&deletion).await.expect("apply deletion");
    cf.flush().await.expect("flush B");
    assert_eq!(cf.sstables_count(), 2);

    let mut cmd = ReadCommand::new(schema.id);
    cmd.slice = QuerySlice::for_key(ck("a"));
    let result = db
        .query(
            cmd,
            vec![PartitionRange::singular(DecoratedKey::from_key(
                b"foo".to_vec(),
            ))],
        )
        .await
        .expect("query");
    assert!(
        result.partitions.is_empty(),
        "the range tombstone in the pruned sstable must mask the row"
    );

    // The pipeline actually ran (no fast path).
    let metrics = cf.metrics().snapshot();
    assert!(metrics.clustering_filter_count >= 1);
    assert_eq!(metrics.clustering_filter_fast_path_count, 0);
}

#[tokio::test]
async fn clustering_filter_prunes_but_never_changes_results() {
    let tmp = TempDir::new().expect("tempdir");
    let (db, schema) = setup_no_cache(&tmp).await;
    let cf = db.find_column_family("ks", "events").expect("table");

    // Two sstables with disjoint clustering bounds.
    let mut low = Mutation::new(schema.clone(), b"foo".to_vec());
    low.set_cell(ck("b"), "v", Cell::live(1, b"low".to_vec()));
    db.apply_mutation(&low).await.expect("apply");
    cf.flush().await.expect("flush");

    let mut high = Mutation::new(schema.clone(), b"foo".to_vec());
    high.set_cell(ck("y"), "v", Cell::live(1, b"high".to_vec()));
    db.apply_mutation(&high).await.expect("apply");
    cf.flush().await.expect("flush");

    let mut cmd = ReadCommand::new(schema.id);
    cmd.slice = QuerySlice::for_key(ck("y"));
    let result = db
        .query(
            cmd,
            vec![PartitionRange::singular(DecoratedKey::from_key(
                b"foo".to_vec(),
            ))],
        )
        .await
        .expect("query");
    assert_eq!(result.partitions.len(), 1);
    assert_eq!(result.partitions[0].rows.len(), 1);
    assert_eq!(
        result.partitions[0].rows[0].1[0].1.value_bytes(),
        Some(&b"high"[..])
    );
}

async fn setup_shard(
    tmp: &TempDir,
    shard_id: u32,
    table_id: shardstore::TableId,
) -> (Arc<Database>, Arc<Schema>) {
    let mut config = StoreConfig::for_tests(tmp.path().to_path_buf());
    config.shard_id = shard_id;
    config.shard_count = 2;
    let db = Database::new(config, Some(MemoryCommitLog::new()));
    let mut options = BTreeMap::new();
    options.insert("replication_factor".to_string(), "1".to_string());
    db.create_keyspace(KeyspaceMetadata::new("ks", "SimpleStrategy", options, true))
        .await
        .expect("create keyspace");
    let schema = Arc::new(Schema::new(table_id, "ks", "events", 1));
    schema.mark_synced();
    db.add_column_family(schema.clone()).await.expect("add table");
    (db, schema)
}

#[tokio::test]
async fn shared_sstable_reads_filter_by_shard_ownership() {
    let tmp = TempDir::new().expect("tempdir");
    let table_id = shardstore::TableId::new_random();
    let (db0, schema) = setup_shard(&tmp, 0, table_id).await;
    let (db1, _schema1) = setup_shard(&tmp, 1, table_id).await;

    // One partition per shard.
    let mut keys_by_shard: [Option<Vec<u8>>; 2] = [None, None];
    for i in 0..64u8 {
        let key = vec![b'k', i];
        let shard = (Token::of(&key).0 % 2) as usize;
        if keys_by_shard[shard].is_none() {
            keys_by_shard[shard] = Some(key);
        }
    }
    let key0 = keys_by_shard[0].clone().expect("shard 0 key");
    let key1 = keys_by_shard[1].clone().expect("shard 1 key");

    // Write one sstable spanning both shards directly into the shared
    // table directory, as a node restart after a topology change would
    // find it.
    let mut partitions = Vec::new();
    for key in [&key0, &key1] {
        let mut m = Mutation::new(schema.clone(), key.clone());
        m.set_cell(ck("a"), "v", Cell::live(1, b"v".to_vec()));
        partitions.push((m.key.clone(), m.partition.clone()));
    }
    partitions.sort_by(|a, b| a.0.cmp(&b.0));
    let cf0 = db0.find_column_family("ks", "events").expect("table");
    codec::write_components(
        &schema,
        cf0.datadir(),
        Generation::new(1),
        partitions,
        ReplayPosition::ZERO,
    )
    .await
    .expect("write shared sstable");

    cf0.populate().await.expect("populate shard 0");
    let cf1 = db1.find_column_family("ks", "events").expect("table");
    cf1.populate().await.expect("populate shard 1");

    // Range reads see only the partitions this shard owns.
    let r0 = db0
        .query(ReadCommand::new(schema.id), vec![PartitionRange::full()])
        .await
        .expect("query shard 0");
    assert_eq!(r0.partitions.len(), 1);
    assert_eq!(r0.partitions[0].key, key0);

    let r1 = db1
        .query(ReadCommand::new(schema.id), vec![PartitionRange::full()])
        .await
        .expect("query shard 1");
    assert_eq!(r1.partitions.len(), 1);
    assert_eq!(r1.partitions[0].key, key1);

    // A singular read for a token owned by the other shard is empty.
    let foreign = db0
        .query(
            ReadCommand::new(schema.id),
            vec![PartitionRange::singular(DecoratedKey::from_key(key1))],
        )
        .await
        .expect("foreign query");
    assert!(foreign.partitions.is_empty());

    // A singular read on the owning shard sees the data.
    let local = db0
        .query(
            ReadCommand::new(schema.id),
            vec![PartitionRange::singular(DecoratedKey::from_key(key0))],
        )
        .await
        .expect("local query");
    assert_eq!(local.partitions.len(), 1);
}
