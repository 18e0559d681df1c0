//! On-disk layout helpers.
//!
//! Per keyspace: `<datadir>/<keyspace>/<cfname>-<uuid_hex>/` holding sstable
//! component files, an `upload/` subdirectory for externally placed
//! sstables, `snapshots/<tag>/` with hard-linked component copies plus a
//! `manifest.json`, and optionally a `backups/` sibling for incremental
//! backups.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

pub const MANIFEST_FILE: &str = "manifest.json";

pub fn keyspace_dir(data_dir: &Path, ks_name: &str) -> PathBuf {
    data_dir.join(ks_name)
}

pub fn snapshots_dir(table_dir: &Path) -> PathBuf {
    table_dir.join("snapshots")
}

pub fn snapshot_dir(table_dir: &Path, tag: &str) -> PathBuf {
    snapshots_dir(table_dir).join(tag)
}

pub fn upload_dir(table_dir: &Path) -> PathBuf {
    table_dir.join("upload")
}

pub fn backups_dir(table_dir: &Path) -> PathBuf {
    table_dir.join("backups")
}

pub fn is_manifest(file_name: &str) -> bool {
    file_name == MANIFEST_FILE
}

/// Create a table directory along with its `upload/` subdirectory.
pub async fn ensure_table_dirs(table_dir: &Path) -> StoreResult<()> {
    tokio::fs::create_dir_all(table_dir).await?;
    tokio::fs::create_dir_all(upload_dir(table_dir)).await?;
    Ok(())
}

/// Names of regular files directly inside `dir`; empty if `dir` is missing.
pub async fn list_files(dir: &Path) -> StoreResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let ftype = entry.file_type().await?;
        if !ftype.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Names of directories directly inside `dir`; empty if `dir` is missing.
pub async fn list_dirs(dir: &Path) -> StoreResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

pub async fn sync_dir(dir: &Path) -> StoreResult<()> {
    match tokio::fs::File::open(dir).await {
        Ok(file) => {
            if let Err(err) = file.sync_all().await {
                warn!(dir = %dir.display(), error = %err, "directory sync failed");
            }
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    files: Vec<&'a str>,
}

/// Write `manifest.json` naming every file belonging to a snapshot.
pub async fn write_snapshot_manifest(dir: &Path, files: &HashSet<String>) -> StoreResult<()> {
    let mut sorted: Vec<&str> = files.iter().map(|f| f.as_str()).collect();
    sorted.sort_unstable();
    let manifest = Manifest { files: sorted };
    let json =
        serde_json::to_string_pretty(&manifest).map_err(StoreError::serialization)?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(MANIFEST_FILE);
    debug!(manifest = %path.display(), "storing snapshot manifest");
    tokio::fs::write(&path, json).await?;
    sync_dir(dir).await
}

struct PendingSnapshot {
    files: HashSet<String>,
    contributions: u32,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Rendezvous for multi-shard snapshots.
///
/// Hard-linking the files is per-shard work, but the snapshot directory gets
/// exactly one `manifest.json` accounting for every shard's sstables, and
/// the snapshot is complete only once that manifest exists. Each shard
/// contributes its file names; the contribution that completes the count
/// writes the manifest and releases every waiter.
pub struct SnapshotCoordinator {
    shard_count: u32,
    pending: Mutex<HashMap<PathBuf, PendingSnapshot>>,
}

impl SnapshotCoordinator {
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn rendezvous(&self, jsondir: PathBuf, files: Vec<String>) -> StoreResult<()> {
        enum Role {
            Writer(HashSet<String>, watch::Sender<bool>),
            Waiter(watch::Receiver<bool>),
        }
        let role = {
            let mut pending = self.pending.lock();
            let entry = pending.entry(jsondir.clone()).or_insert_with(|| {
                let (done_tx, done_rx) = watch::channel(false);
                PendingSnapshot {
                    files: HashSet::new(),
                    contributions: 0,
                    done_tx,
                    done_rx,
                }
            });
            entry.files.extend(files);
            entry.contributions += 1;
            if entry.contributions >= self.shard_count {
                let entry = pending.remove(&jsondir).expect("entry inserted above");
                Role::Writer(entry.files, entry.done_tx)
            } else {
                Role::Waiter(entry.done_rx.clone())
            }
        };
        match role {
            Role::Writer(files, done_tx) => {
                write_snapshot_manifest(&jsondir, &files).await?;
                let _ = done_tx.send(true);
                Ok(())
            }
            Role::Waiter(mut done_rx) => {
                while !*done_rx.borrow() {
                    if done_rx.changed().await.is_err() {
                        return Err(StoreError::invalid_state(
                            "snapshot manifest writer went away",
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn table_dirs_include_upload() {
        let tmp = TempDir::new().expect("tempdir");
        let table_dir = tmp.path().join("ks").join("cf-abc");
        ensure_table_dirs(&table_dir).await.expect("create");
        assert!(table_dir.is_dir());
        assert!(upload_dir(&table_dir).is_dir());
    }

    #[tokio::test]
    async fn list_files_skips_directories_and_hidden() {
        let tmp = TempDir::new().expect("tempdir");
        tokio::fs::write(tmp.path().join("a.db"), b"x").await.unwrap();
        tokio::fs::write(tmp.path().join(".hidden"), b"x").await.unwrap();
        tokio::fs::create_dir(tmp.path().join("subdir")).await.unwrap();
        let files = list_files(tmp.path()).await.expect("list");
        assert_eq!(files, vec!["a.db".to_string()]);
        let dirs = list_dirs(tmp.path()).await.expect("list dirs");
        assert_eq!(dirs, vec!["subdir".to_string()]);
    }

    #[tokio::test]
    async fn manifest_lists_files_sorted() {
        let tmp = TempDir::new().expect("tempdir");
        let mut files = HashSet::new();
        files.insert("b-Data.db".to_string());
        files.insert("a-Data.db".to_string());
        write_snapshot_manifest(tmp.path(), &files).await.expect("write");

        let raw = std::fs::read_to_string(tmp.path().join(MANIFEST_FILE)).expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let names: Vec<&str> = parsed["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a-Data.db", "b-Data.db"]);
    }

    #[tokio::test]
    async fn single_shard_rendezvous_writes_immediately() {
        let tmp = TempDir::new().expect("tempdir");
        let coordinator = SnapshotCoordinator::new(1);
        coordinator
            .rendezvous(tmp.path().join("snap"), vec!["f-Data.db".to_string()])
            .await
            .expect("rendezvous");
        assert!(tmp.path().join("snap").join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn multi_shard_rendezvous_waits_for_all_contributions() {
        let tmp = TempDir::new().expect("tempdir");
        let coordinator = std::sync::Arc::new(SnapshotCoordinator::new(2));
        let dir = tmp.path().join("snap");

        let c1 = coordinator.clone();
        let d1 = dir.clone();
        let first =
            tokio::spawn(async move { c1.rendezvous(d1, vec!["one.db".to_string()]).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!dir.join(MANIFEST_FILE).exists());

        coordinator
            .rendezvous(dir.clone(), vec!["two.db".to_string()])
            .await
            .expect("second");
        first.await.expect("join").expect("first");

        let raw = std::fs::read_to_string(dir.join(MANIFEST_FILE)).expect("read");
        assert!(raw.contains("one.db"));
        assert!(raw.contains("two.db"));
    }
}
