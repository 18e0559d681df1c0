//! Snapshot, truncate and upload-dir flows.

use std::collections::BTreeMap;
use std::sync::Arc;

use shardstore::sstable::codec;
use shardstore::test_support::MemoryCommitLog;
use shardstore::{
    Cell, Database, DecoratedKey, Generation, KeyspaceMetadata, Mutation, PartitionRange,
    ReadCommand, ReplayPosition, Schema, StoreConfig,
};
use tempfile::TempDir;

fn ck(s: &str) -> Vec<Vec<u8>> {
    vec![s.as_bytes().to_vec()]
}

async fn setup(tmp: &TempDir) -> (Arc<Database>, Arc<Schema>) {
    let commitlog = MemoryCommitLog::new();
    let db = Database::new(
        StoreConfig::for_tests(tmp.path().to_path_buf()),
        Some(commitlog),
    );
    let mut options = BTreeMap::new();
    options.insert("replication_factor".to_string(), "1".to_string());
    db.create_keyspace(KeyspaceMetadata::new("ks", "SimpleStrategy", options, true))
        .await
        .expect("create keyspace");
    let schema = Arc::new(Schema::for_tests("ks", "events"));
    db.add_column_family(schema.clone()).await.expect("add table");
    (db, schema)
}

async fn write_row(db: &Arc<Database>, schema: &Arc<Schema>, pk: &[u8], ts: i64) {
    let mut m = Mutation::new(schema.clone(), pk.to_vec());
    m.set_cell(ck("a"), "v", Cell::live(ts, b"value".to_vec()));
    db.apply_mutation(&m).await.expect("apply");
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

#[tokio::test]
async fn snapshot_links_components_and_writes_manifest() {
    let tmp = TempDir::new().expect("tempdir");
    let (db, schema) = setup(&tmp).await;
    let cf = db.find_column_family("ks", "events").expect("table");

    write_row(&db, &schema, b"pk", 1).await;
    db.snapshot("ks", "events", "tag1").await.expect("snapshot");
    assert!(cf.snapshot_exists("tag1").await);

    let snapdir = cf.datadir().join("snapshots").join("tag1");
    let manifest = std::fs::read_to_string(snapdir.join("manifest.json")).expect("manifest");
    let parsed: serde_json::Value = serde_json::from_str(&manifest).expect("json");
    let files = parsed["files"].as_array().expect("files array");
    // One sstable, four components, all hard-linked next to the manifest.
    assert_eq!(files.len(), 4);
    for file in files {
        assert!(snapdir.join(file.as_str().unwrap()).exists());
    }
}

#[tokio::test]
async fn snapshot_includes_exactly_the_flushed_state() {
    let tmp = TempDir::new().expect("tempdir");
    let (db, schema) = setup(&tmp).await;
    let cf = db.find_column_family("ks", "events").expect("table");

    // Unflushed at snapshot time: the snapshot's own flush captures it.
    write_row(&db, &schema, b"pk", 1).await;
    db.snapshot("ks", "events", "tag").await.expect("snapshot");
    assert!(cf.sstables_count() >= 1);

    let details = cf.snapshot_details().await.expect("details");
    let tag = details.get("tag").expect("tag entry");
    assert!(tag.total > 0);
    // Live files still exist in the data directory, so nothing is held
    // exclusively by the snapshot yet.
    assert_eq!(tag.live, 0);
}

#[tokio::test]
async fn truncate_drops_sstables_and_persists_a_record() {
    let tmp = TempDir::new().expect("tempdir");
    let (db, schema) = setup(&tmp).await;
    let cf = db.find_column_family("ks", "events").expect("table");

    write_row(&db, &schema, b"pk", 1).await;
    cf.flush().await.expect("flush");
    assert_eq!(cf.sstables_count(), 1);

    db.truncate("ks", "events", || now_millis() + 1_000)
        .await
        .expect("truncate");

    assert_eq!(cf.sstables_count(), 0);
    let result = db
        .query(ReadCommand::new(schema.id), vec![PartitionRange::full()])
        .await
        .expect("query");
    assert!(result.partitions.is_empty());

    let (truncated_at, rp) = db.truncation_record(schema.id).expect("record");
    assert!(truncated_at > 0);
    assert!(!rp.is_zero());

    // auto_snapshot took a pre-truncate snapshot named <epoch>-<cfname>.
    let details = cf.snapshot_details().await.expect("details");
    assert!(details.keys().any(|tag| tag.ends_with("-events")));
    let snapshot = details.values().next().expect("snapshot sizes");
    // The data files are gone from the live directory: the snapshot now
    // holds the only copy.
    assert!(snapshot.live > 0);
}

#[tokio::test]
async fn snapshot_then_clear_then_restore_reproduces_state() {
    let tmp = TempDir::new().expect("tempdir");
    let table_id;
    {
        let (db, schema) = setup(&tmp).await;
        table_id = schema.id;
        let cf = db.find_column_family("ks", "events").expect("table");
        write_row(&db, &schema, b"keepme", 1).await;
        db.snapshot("ks", "events", "backup").await.expect("snapshot");
        db.truncate("ks", "events", || now_millis() + 1_000)
            .await
            .expect("truncate");
        let gone = db
            .query(ReadCommand::new(schema.id), vec![PartitionRange::full()])
            .await
            .expect("query");
        assert!(gone.partitions.is_empty());

        // Restore: copy the snapshot's components back into the live
        // directory.
        let snapdir = cf.datadir().join("snapshots").join("backup");
        for entry in std::fs::read_dir(&snapdir).expect("read snapshot dir") {
            let entry = entry.expect("entry");
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "manifest.json" {
                continue;
            }
            std::fs::copy(entry.path(), cf.datadir().join(&name)).expect("copy back");
        }
        db.stop().await.expect("stop");
    }

    let db = Database::new(
        StoreConfig::for_tests(tmp.path().to_path_buf()),
        Some(MemoryCommitLog::new()),
    );
    let mut options = BTreeMap::new();
    options.insert("replication_factor".to_string(), "1".to_string());
    db.create_keyspace(KeyspaceMetadata::new("ks", "SimpleStrategy", options, true))
        .await
        .expect("create keyspace");
    let schema = Arc::new(Schema::new(table_id, "ks", "events", 1));
    schema.mark_synced();
    db.add_column_family(schema.clone()).await.expect("add table");
    db.populate_all().await.expect("populate");

    let restored = db
        .query(ReadCommand::new(schema.id), vec![PartitionRange::full()])
        .await
        .expect("query");
    assert_eq!(restored.partitions.len(), 1);
    assert_eq!(restored.partitions[0].key, b"keepme".to_vec());
}

#[tokio::test]
async fn clear_snapshot_removes_directories() {
    let tmp = TempDir::new().expect("tempdir");
    let (db, schema) = setup(&tmp).await;
    let cf = db.find_column_family("ks", "events").expect("table");

    write_row(&db, &schema, b"pk", 1).await;
    db.snapshot("ks", "events", "t1").await.expect("snapshot t1");
    db.snapshot("ks", "events", "t2").await.expect("snapshot t2");

    db.clear_snapshot("t1", &["ks".to_string()])
        .await
        .expect("clear t1");
    assert!(!cf.snapshot_exists("t1").await);
    assert!(cf.snapshot_exists("t2").await);

    // Empty tag clears everything.
    db.clear_snapshot("", &[]).await.expect("clear all");
    assert!(!cf.snapshot_exists("t2").await);
}

#[tokio::test]
async fn flush_upload_dir_adopts_foreign_sstables() {
    let tmp = TempDir::new().expect("tempdir");
    let (db, schema) = setup(&tmp).await;
    let cf = db.find_column_family("ks", "events").expect("table");

    // Someone drops an sstable into upload/ (e.g. a restore tool).
    let mut m = Mutation::new(schema.clone(), b"uploaded".to_vec());
    m.set_cell(ck("a"), "v", Cell::live(7, b"payload".to_vec()));
    let upload = cf.datadir().join("upload");
    codec::write_components(
        &schema,
        &upload,
        Generation::new(99),
        vec![(m.key.clone(), m.partition.clone())],
        ReplayPosition::ZERO,
    )
    .await
    .expect("write upload sstable");

    let flushed = cf.flush_upload_dir().await.expect("flush upload dir");
    assert_eq!(flushed.len(), 1);
    assert_ne!(flushed[0].generation, Generation::new(99));
    // Originals are gone from upload/.
    assert!(std::fs::read_dir(&upload).expect("dir").next().is_none());

    cf.load_new_sstables(flushed).await.expect("load");
    let partition = cf
        .find_partition(&DecoratedKey::from_key(b"uploaded".to_vec()))
        .await
        .expect("read");
    assert!(partition.is_some());
}
