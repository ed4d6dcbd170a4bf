//! Durable per-sandbox delegate records.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::debug;
use trellis_common::{Error, Result, SandboxId};

use crate::delegate::DelegateConf;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Store of per-sandbox delegate records under one directory.
///
/// One file per sandbox, named by the sandbox ID, holding the JSON array
/// of delegate configurations that were applied.
pub struct DelegateStore {
    dir: PathBuf,
}

impl DelegateStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: &SandboxId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Persist the delegate list for a sandbox.
    ///
    /// With `merge_existing`, entries already on disk survive the write
    /// when their network name is absent, not a string, or not among the
    /// new list's names; that is how dynamically added attachments
    /// accumulate in the record. An unreadable or undecodable existing
    /// record merges as empty. Nothing is written when the final list is
    /// empty. Returns the pre-merge on-disk list.
    pub async fn save(
        &self,
        id: &SandboxId,
        merge_existing: bool,
        mut delegates: Vec<DelegateConf>,
    ) -> Result<Option<Vec<DelegateConf>>> {
        let mut previous = None;
        if merge_existing {
            previous = self.read_record(id).await;
            if let Some(existing) = &previous {
                for entry in existing {
                    let keep = match entry.network_name() {
                        None => true,
                        Some(name) => !delegates.iter().any(|d| d.network_name() == Some(name)),
                    };
                    if keep {
                        delegates.push(entry.clone());
                    }
                }
            }
        }
        if delegates.is_empty() {
            return Ok(previous);
        }

        let bytes = serde_json::to_vec(&delegates)
            .map_err(|e| Error::Persistence(format!("cannot encode delegate record: {}", e)))?;
        self.write_record(id, &bytes).await?;
        debug!(sandbox = %id, delegates = delegates.len(), "saved delegate record");
        Ok(previous)
    }

    /// Read a sandbox's record and remove it from disk.
    ///
    /// The file is removed even when reading it fails: a destroy that
    /// touches a sandbox always clears its record.
    pub async fn consume(&self, id: &SandboxId) -> Result<Vec<u8>> {
        let path = self.record_path(id);
        let read = tokio::fs::read(&path).await;
        let _ = tokio::fs::remove_file(&path).await;
        read.map_err(|e| {
            Error::Persistence(format!("cannot read delegate record {}: {}", path.display(), e))
        })
    }

    async fn read_record(&self, id: &SandboxId) -> Option<Vec<DelegateConf>> {
        let bytes = tokio::fs::read(self.record_path(id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_record(&self, id: &SandboxId, bytes: &[u8]) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        builder.mode(DIR_MODE);
        builder.create(&self.dir).await.map_err(|e| {
            Error::Persistence(format!(
                "cannot create record directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let path = self.record_path(id);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&path)
            .await
            .map_err(|e| {
                Error::Persistence(format!(
                    "cannot open delegate record {}: {}",
                    path.display(),
                    e
                ))
            })?;
        file.write_all(bytes).await.map_err(|e| {
            Error::Persistence(format!(
                "cannot write delegate record {}: {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    fn delegate(value: serde_json::Value) -> DelegateConf {
        DelegateConf::from_value(value).unwrap()
    }

    fn named(plugin: &str, network: &str) -> DelegateConf {
        delegate(json!({"type": plugin, "networkName": network}))
    }

    async fn read_back(store: &DelegateStore, id: &SandboxId) -> Vec<DelegateConf> {
        let bytes = tokio::fs::read(store.record_path(id)).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_consume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().join("delegates"));
        let id = SandboxId::from("ctr-1");

        let previous = store
            .save(&id, true, vec![named("bridge", "data-net")])
            .await
            .unwrap();
        assert!(previous.is_none());

        let bytes = store.consume(&id).await.unwrap();
        let decoded: Vec<DelegateConf> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].network_name(), Some("data-net"));

        // The record is gone after consumption.
        assert!(store.consume(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_list_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().join("delegates"));
        let id = SandboxId::from("ctr-1");

        store.save(&id, false, Vec::new()).await.unwrap();
        assert!(!store.record_path(&id).exists());
    }

    #[tokio::test]
    async fn test_merge_appends_unnamed_and_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().join("delegates"));
        let id = SandboxId::from("ctr-1");

        store
            .save(
                &id,
                false,
                vec![delegate(json!({"type": "bridge"})), named("macvlan", "data-net")],
            )
            .await
            .unwrap();
        store
            .save(&id, true, vec![named("sriov", "storage")])
            .await
            .unwrap();

        let merged = read_back(&store, &id).await;
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].network_name(), Some("storage"));
        assert_eq!(merged[1].network_name(), None);
        assert_eq!(merged[2].network_name(), Some("data-net"));
    }

    #[tokio::test]
    async fn test_merge_replaces_same_named_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().join("delegates"));
        let id = SandboxId::from("ctr-1");

        store
            .save(
                &id,
                false,
                vec![delegate(json!({"type": "bridge", "networkName": "data-net", "mtu": 1400}))],
            )
            .await
            .unwrap();
        let previous = store
            .save(
                &id,
                true,
                vec![delegate(json!({"type": "bridge", "networkName": "data-net", "mtu": 9000}))],
            )
            .await
            .unwrap();

        assert_eq!(previous.unwrap().len(), 1);
        let merged = read_back(&store, &id).await;
        assert_eq!(merged.len(), 1);
        let out = serde_json::to_string(&merged[0]).unwrap();
        assert!(out.contains("9000"));
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().join("delegates"));
        let id = SandboxId::from("ctr-1");
        let list = vec![named("bridge", "data-net"), named("sriov", "storage")];

        store.save(&id, true, list.clone()).await.unwrap();
        store.save(&id, true, list).await.unwrap();

        assert_eq!(read_back(&store, &id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_plain_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().join("delegates"));
        let id = SandboxId::from("ctr-1");

        store
            .save(&id, false, vec![named("bridge", "data-net"), named("sriov", "storage")])
            .await
            .unwrap();
        store.save(&id, false, vec![named("sriov", "storage")]).await.unwrap();

        let records = read_back(&store, &id).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].network_name(), Some("storage"));
    }

    #[tokio::test]
    async fn test_corrupt_existing_record_merges_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().to_path_buf());
        let id = SandboxId::from("ctr-1");
        tokio::fs::write(store.record_path(&id), b"not json").await.unwrap();

        let previous = store
            .save(&id, true, vec![named("bridge", "data-net")])
            .await
            .unwrap();
        assert!(previous.is_none());
        assert_eq!(read_back(&store, &id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_record_modes_are_private() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("delegates");
        let store = DelegateStore::new(&root);
        let id = SandboxId::from("ctr-1");

        store.save(&id, false, vec![named("bridge", "data-net")]).await.unwrap();

        let dir_mode = std::fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(store.record_path(&id))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_save_returns_pre_merge_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(dir.path().join("delegates"));
        let id = SandboxId::from("ctr-1");

        store.save(&id, true, vec![named("bridge", "data-net")]).await.unwrap();
        let previous = store
            .save(&id, true, vec![named("sriov", "storage")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous.len(), 1);
        assert_eq!(previous[0].network_name(), Some("data-net"));
    }
}
