//! SnapshotStore - Durable per-server result cache
//!
//! ## Responsibilities
//!
//! - One JSON file per (server, data kind) under `<root>/<kind>/<server>.json`
//! - Atomic replace: a reader never observes a half-written record
//! - Cheap metadata-only timestamp reads for freshness decisions
//! - Backward compatibility with timestamp-less legacy cache files
//!
//! The store holds no freshness policy: it stores and retrieves, the
//! orchestrator decides staleness.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::DataKind;

/// Where a record's payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    /// Freshly fetched from the server's management API
    LiveFetch,
    /// Served from a previously written cache file
    CachedCopy,
}

/// One cached result for a (server, kind) pair
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    /// When the fetch that produced this record completed. `None` for
    /// legacy files written before timestamps existed ("age unknown").
    pub generated_at: Option<DateTime<Utc>>,
    /// Opaque result records, one field mapping per API item
    pub records: Vec<Map<String, Value>>,
}

/// On-disk representation. The tagged form matches the original cache
/// format (`{"timestamp": ..., "data": [...]}`); the bare-array form is the
/// legacy variant still accepted on read.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum CacheFile {
    Tagged {
        timestamp: Option<DateTime<Utc>>,
        data: Vec<Map<String, Value>>,
    },
    Legacy(Vec<Map<String, Value>>),
}

/// Metadata-only view of a cache file; serde skips materializing `data`
#[derive(Debug, Deserialize)]
struct CacheMeta {
    timestamp: Option<DateTime<Utc>>,
}

/// Durable key-value store from (server name, kind) to SnapshotRecord
pub struct SnapshotStore {
    root: PathBuf,
    /// Per-key write locks; two overlapping refreshes for the same
    /// (server, kind) must serialize to keep the replace atomic.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    /// Create the store rooted at `root`, creating the directory tree
    pub async fn new(root: PathBuf) -> Result<Self> {
        for kind in DataKind::ALL {
            fs::create_dir_all(root.join(kind.as_str())).await?;
        }

        Ok(Self {
            root,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Cache file path for a (server, kind) key
    pub fn path(&self, server: &str, kind: DataKind) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(format!("{}.json", sanitize(server)))
    }

    /// Read the cached record for a key.
    ///
    /// Never fails the caller: a missing file yields `None`, and a corrupt
    /// file is logged and treated as absent so the orchestrator can fall
    /// back to a live fetch.
    pub async fn read(&self, server: &str, kind: DataKind) -> Option<SnapshotRecord> {
        let path = self.path(server, kind);
        let content = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    server = %server,
                    kind = %kind,
                    error = %e,
                    "Cache file unreadable, treating as miss"
                );
                return None;
            }
        };

        match serde_json::from_slice::<CacheFile>(&content) {
            Ok(CacheFile::Tagged { timestamp, data }) => Some(SnapshotRecord {
                generated_at: timestamp,
                records: data,
            }),
            Ok(CacheFile::Legacy(data)) => Some(SnapshotRecord {
                generated_at: None,
                records: data,
            }),
            Err(e) => {
                tracing::warn!(
                    server = %server,
                    kind = %kind,
                    path = %path.display(),
                    error = %e,
                    "Corrupt cache file, treating as miss"
                );
                None
            }
        }
    }

    /// Write records for a key, replacing any previous entry.
    ///
    /// The record is fully materialized in a temp file and moved into place
    /// with a rename, so a concurrent reader sees either the old record or
    /// the new one, never a partial write.
    pub async fn write(
        &self,
        server: &str,
        kind: DataKind,
        records: &[Map<String, Value>],
    ) -> Result<DateTime<Utc>> {
        let lock = self.key_lock(server, kind).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let file = CacheFile::Tagged {
            timestamp: Some(now),
            data: records.to_vec(),
        };
        let content = serde_json::to_vec_pretty(&file)?;

        let path = self.path(server, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Temp file in the same directory so the rename stays on one
        // filesystem and is atomic.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!(
            server = %server,
            kind = %kind,
            records = records.len(),
            path = %path.display(),
            "Snapshot written"
        );

        Ok(now)
    }

    /// Read only the generation timestamp for a key, without materializing
    /// the payload. `None` means no usable timestamp: file absent, corrupt,
    /// or a legacy file with no timestamp field.
    pub async fn timestamp(&self, server: &str, kind: DataKind) -> Option<DateTime<Utc>> {
        let path = self.path(server, kind);
        let content = fs::read(&path).await.ok()?;
        let meta: CacheMeta = serde_json::from_slice(&content).ok()?;
        meta.timestamp
    }

    /// Remove the entry for a key. Missing entries are not an error.
    pub async fn clear(&self, server: &str, kind: DataKind) -> Result<()> {
        let path = self.path(server, kind);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(server = %server, kind = %kind, "Snapshot cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn key_lock(&self, server: &str, kind: DataKind) -> Arc<Mutex<()>> {
        let key = format!("{}/{}", kind.as_str(), sanitize(server));
        let mut locks = self.write_locks.lock().await;
        locks.entry(key).or_default().clone()
    }
}

/// Replace anything outside [a-zA-Z0-9] so server names (typically URLs)
/// become safe file names
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: &[(&str, &str)]) -> Map<String, Value> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    async fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_round_trip_preserves_payload() {
        let (_dir, store) = store().await;
        let records = vec![
            record(&[("Replica Set Name", "rs0"), ("Backup Status", "STARTED")]),
            record(&[("Replica Set Name", "rs1"), ("Backup Status", "STOPPED")]),
        ];

        let before = Utc::now();
        store
            .write("https://om.example.com", DataKind::Backup, &records)
            .await
            .unwrap();
        let after = Utc::now();

        let loaded = store
            .read("https://om.example.com", DataKind::Backup)
            .await
            .unwrap();
        assert_eq!(loaded.records, records);

        let ts = loaded.generated_at.unwrap();
        assert!(ts >= before && ts <= after);
    }

    #[tokio::test]
    async fn test_missing_entry_reads_as_none() {
        let (_dir, store) = store().await;
        assert!(store.read("om", DataKind::Monitoring).await.is_none());
        assert!(store.timestamp("om", DataKind::Monitoring).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_treated_as_miss() {
        let (_dir, store) = store().await;
        let path = store.path("om", DataKind::Backup);
        fs::write(&path, b"{not json").await.unwrap();

        assert!(store.read("om", DataKind::Backup).await.is_none());
        assert!(store.timestamp("om", DataKind::Backup).await.is_none());
    }

    #[tokio::test]
    async fn test_legacy_bare_array_accepted_with_unknown_age() {
        let (_dir, store) = store().await;
        let path = store.path("om", DataKind::Backup);
        fs::write(&path, br#"[{"Replica Set Name": "rs0"}]"#)
            .await
            .unwrap();

        let loaded = store.read("om", DataKind::Backup).await.unwrap();
        assert!(loaded.generated_at.is_none());
        assert_eq!(loaded.records.len(), 1);

        // Age unknown must not look fresh to the freshness check
        assert!(store.timestamp("om", DataKind::Backup).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_entry() {
        let (_dir, store) = store().await;
        store
            .write("om", DataKind::OplogStore, &[record(&[("id", "cfg-1")])])
            .await
            .unwrap();
        assert!(store.read("om", DataKind::OplogStore).await.is_some());

        store.clear("om", DataKind::OplogStore).await.unwrap();
        assert!(store.read("om", DataKind::OplogStore).await.is_none());

        // Clearing twice is fine
        store.clear("om", DataKind::OplogStore).await.unwrap();
    }

    #[tokio::test]
    async fn test_kinds_do_not_share_cache_slots() {
        let (_dir, store) = store().await;
        store
            .write("om", DataKind::SnapshotS3, &[record(&[("id", "s3-1")])])
            .await
            .unwrap();

        assert!(store.read("om", DataKind::OplogS3).await.is_none());
        assert!(store.read("om", DataKind::SnapshotS3).await.is_some());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_previous_record() {
        let (_dir, store) = store().await;
        store
            .write("om", DataKind::Backup, &[record(&[("v", "1")])])
            .await
            .unwrap();
        store
            .write("om", DataKind::Backup, &[record(&[("v", "2")]), record(&[("v", "3")])])
            .await
            .unwrap();

        let loaded = store.read("om", DataKind::Backup).await.unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[0]["v"], json!("2"));
    }

    #[tokio::test]
    async fn test_concurrent_same_key_writes_stay_consistent() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let recs = vec![record(&[("writer", &i.to_string())])];
                store.write("om", DataKind::Backup, &recs).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Whichever write landed last, the file parses as one full record
        let loaded = store.read("om", DataKind::Backup).await.unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert!(loaded.generated_at.is_some());
    }
}
