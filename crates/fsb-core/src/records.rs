//! Record store port and the single-process JSON implementation.
//!
//! The core treats persistence as an external collaborator: user records,
//! the download log, settings (such as the re-index cursor), and the index /
//! artifact snapshots all go through this port.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Reference, UserId},
    expiry::DeliveryArtifact,
    index::IndexSnapshot,
    Result,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub banned: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub reference: Reference,
    pub user: UserId,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the user if new; existing records keep their ban flag.
    async fn upsert_user(&self, user: UserId) -> Result<()>;
    async fn set_banned(&self, user: UserId, banned: bool) -> Result<()>;
    /// Known and not banned.
    async fn is_present(&self, user: UserId) -> Result<bool>;
    async fn is_banned(&self, user: UserId) -> Result<bool>;
    async fn all_user_ids(&self) -> Result<Vec<UserId>>;
    async fn remove_user(&self, user: UserId) -> Result<()>;

    async fn log_download(&self, reference: Reference, user: UserId) -> Result<()>;
    async fn total_downloads(&self) -> Result<u64>;
    async fn user_download_count(&self, user: UserId) -> Result<u64>;

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn save_index_snapshot(&self, snapshot: IndexSnapshot) -> Result<()>;
    async fn load_index_snapshot(&self) -> Result<IndexSnapshot>;

    async fn save_artifacts(&self, artifacts: Vec<DeliveryArtifact>) -> Result<()>;
    async fn load_artifacts(&self) -> Result<Vec<DeliveryArtifact>>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RecordsDocument {
    users: BTreeMap<i64, UserRecord>,
    downloads: Vec<DownloadRecord>,
    settings: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    index: IndexSnapshot,
    #[serde(default)]
    artifacts: Vec<DeliveryArtifact>,
}

/// Whole-document JSON store on disk.
///
/// Loaded once at startup; every mutation rewrites the file via a temp file +
/// rename so a crash never leaves a torn document behind.
pub struct JsonRecordStore {
    path: PathBuf,
    doc: Mutex<RecordsDocument>,
}

impl JsonRecordStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let txt = std::fs::read_to_string(&path)?;
            if txt.trim().is_empty() {
                RecordsDocument::default()
            } else {
                serde_json::from_str(&txt)?
            }
        } else {
            RecordsDocument::default()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut RecordsDocument) -> T) -> Result<T> {
        let mut doc = self.doc.lock().expect("record store poisoned");
        let out = f(&mut doc);
        persist(&self.path, &doc)?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&RecordsDocument) -> T) -> T {
        let doc = self.doc.lock().expect("record store poisoned");
        f(&doc)
    }
}

fn persist(path: &Path, doc: &RecordsDocument) -> Result<()> {
    let txt = serde_json::to_string(doc)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, txt)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn upsert_user(&self, user: UserId) -> Result<()> {
        self.mutate(|doc| {
            doc.users.entry(user.0).or_insert_with(|| UserRecord {
                banned: false,
                joined_at: Utc::now(),
            });
        })
    }

    async fn set_banned(&self, user: UserId, banned: bool) -> Result<()> {
        self.mutate(|doc| {
            doc.users
                .entry(user.0)
                .or_insert_with(|| UserRecord {
                    banned,
                    joined_at: Utc::now(),
                })
                .banned = banned;
        })
    }

    async fn is_present(&self, user: UserId) -> Result<bool> {
        Ok(self.read(|doc| doc.users.get(&user.0).map(|u| !u.banned).unwrap_or(false)))
    }

    async fn is_banned(&self, user: UserId) -> Result<bool> {
        Ok(self.read(|doc| doc.users.get(&user.0).map(|u| u.banned).unwrap_or(false)))
    }

    async fn all_user_ids(&self) -> Result<Vec<UserId>> {
        Ok(self.read(|doc| {
            doc.users
                .iter()
                .filter(|(_, u)| !u.banned)
                .map(|(id, _)| UserId(*id))
                .collect()
        }))
    }

    async fn remove_user(&self, user: UserId) -> Result<()> {
        self.mutate(|doc| {
            doc.users.remove(&user.0);
        })
    }

    async fn log_download(&self, reference: Reference, user: UserId) -> Result<()> {
        self.mutate(|doc| {
            doc.downloads.push(DownloadRecord {
                reference,
                user,
                at: Utc::now(),
            });
        })
    }

    async fn total_downloads(&self) -> Result<u64> {
        Ok(self.read(|doc| doc.downloads.len() as u64))
    }

    async fn user_download_count(&self, user: UserId) -> Result<u64> {
        Ok(self.read(|doc| doc.downloads.iter().filter(|d| d.user == user).count() as u64))
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.read(|doc| doc.settings.get(key).cloned()))
    }

    async fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.mutate(|doc| {
            doc.settings.insert(key.to_string(), value);
        })
    }

    async fn save_index_snapshot(&self, snapshot: IndexSnapshot) -> Result<()> {
        self.mutate(|doc| {
            doc.index = snapshot;
        })
    }

    async fn load_index_snapshot(&self) -> Result<IndexSnapshot> {
        Ok(self.read(|doc| doc.index.clone()))
    }

    async fn save_artifacts(&self, artifacts: Vec<DeliveryArtifact>) -> Result<()> {
        self.mutate(|doc| {
            doc.artifacts = artifacts;
        })
    }

    async fn load_artifacts(&self) -> Result<Vec<DeliveryArtifact>> {
        Ok(self.read(|doc| doc.artifacts.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (JsonRecordStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRecordStore::open(dir.path().join("records.json")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn users_roundtrip_with_ban_state() {
        let (store, dir) = store();

        store.upsert_user(UserId(1)).await.unwrap();
        store.upsert_user(UserId(2)).await.unwrap();
        store.set_banned(UserId(2), true).await.unwrap();

        assert!(store.is_present(UserId(1)).await.unwrap());
        assert!(!store.is_present(UserId(2)).await.unwrap());
        assert!(!store.is_present(UserId(3)).await.unwrap());
        assert!(store.is_banned(UserId(2)).await.unwrap());
        assert!(!store.is_banned(UserId(3)).await.unwrap());
        assert_eq!(store.all_user_ids().await.unwrap(), vec![UserId(1)]);

        // Upserting a banned user does not lift the ban.
        store.upsert_user(UserId(2)).await.unwrap();
        assert!(!store.is_present(UserId(2)).await.unwrap());

        // Reopen from disk.
        let reopened = JsonRecordStore::open(dir.path().join("records.json")).unwrap();
        assert!(reopened.is_present(UserId(1)).await.unwrap());
        assert!(!reopened.is_present(UserId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn download_log_counts() {
        let (store, _dir) = store();

        store.log_download(Reference(5), UserId(1)).await.unwrap();
        store.log_download(Reference(5), UserId(1)).await.unwrap();
        store.log_download(Reference(6), UserId(2)).await.unwrap();

        assert_eq!(store.total_downloads().await.unwrap(), 3);
        assert_eq!(store.user_download_count(UserId(1)).await.unwrap(), 2);
        assert_eq!(store.user_download_count(UserId(9)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn settings_hold_arbitrary_json() {
        let (store, dir) = store();

        assert!(store.get_setting("reindex_cursor").await.unwrap().is_none());
        store
            .set_setting("reindex_cursor", serde_json::json!(41))
            .await
            .unwrap();

        let reopened = JsonRecordStore::open(dir.path().join("records.json")).unwrap();
        assert_eq!(
            reopened.get_setting("reindex_cursor").await.unwrap(),
            Some(serde_json::json!(41))
        );
    }

    #[tokio::test]
    async fn empty_or_missing_file_loads_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let fresh = JsonRecordStore::open(&path).unwrap();
        assert_eq!(fresh.total_downloads().await.unwrap(), 0);

        std::fs::write(&path, "").unwrap();
        let empty = JsonRecordStore::open(&path).unwrap();
        assert_eq!(empty.all_user_ids().await.unwrap(), Vec::<UserId>::new());
    }
}
