//! Fjall-backed persistence of transfer state.
//!
//! Partition layout:
//! - `transfers`: transfer:{id} -> PersistedTransfer (JSON)
//!
//! This is the durability boundary of a download: whatever is written here
//! (most importantly the description) survives the process.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transfer::handle::{TransferId, TransferState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// What survives a process restart for one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTransfer {
    pub id: TransferId,
    pub url: String,
    pub partial_path: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    pub state: TransferState,
    #[serde(default)]
    pub bytes_expected: Option<u64>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

/// Encode a transfer key: transfer:{id}
pub fn encode_transfer_key(id: &TransferId) -> Vec<u8> {
    format!("transfer:{}", id).into_bytes()
}

#[derive(Clone)]
pub struct TransferStore {
    keyspace: Keyspace,
    transfers: PartitionHandle,
}

impl TransferStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening transfer store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let transfers = keyspace.open_partition("transfers", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            transfers,
        })
    }

    pub fn upsert(&self, transfer: &PersistedTransfer) -> Result<()> {
        let key = encode_transfer_key(&transfer.id);
        let value = serde_json::to_vec(transfer)?;
        self.transfers.insert(key, value)?;
        debug!(transfer_id = %transfer.id, state = %transfer.state, "Persisted transfer");
        Ok(())
    }

    pub fn get(&self, id: &TransferId) -> Result<Option<PersistedTransfer>> {
        match self.transfers.get(encode_transfer_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: &TransferId) -> Result<()> {
        self.transfers.remove(encode_transfer_key(id))?;
        debug!(transfer_id = %id, "Removed persisted transfer");
        Ok(())
    }

    /// All readable entries, oldest first. Unreadable entries are skipped.
    pub fn load_all(&self) -> Result<Vec<PersistedTransfer>> {
        let mut entries = Vec::new();

        for item in self.transfers.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<PersistedTransfer>(&value) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "Skipping unreadable persisted transfer"
                ),
            }
        }

        entries.sort_by_key(|entry| (entry.created_at, entry.id));
        Ok(entries)
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(url: &str, state: TransferState) -> PersistedTransfer {
        let id = TransferId::new();
        PersistedTransfer {
            id,
            url: url.to_string(),
            partial_path: PathBuf::from(format!("/tmp/{}.part", id)),
            description: Some(r#"{"url":"u","fileName":"f"}"#.to_string()),
            state,
            bytes_expected: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_transfer_key_encoding() {
        let id = TransferId::new();
        assert_eq!(
            encode_transfer_key(&id),
            format!("transfer:{}", id).into_bytes()
        );
    }

    #[test]
    fn test_upsert_get_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = TransferStore::open(temp_dir.path().join("session")).unwrap();

        let mut transfer = entry("https://x/a.zip", TransferState::Idle);
        store.upsert(&transfer).unwrap();

        transfer.state = TransferState::Running;
        store.upsert(&transfer).unwrap();
        let loaded = store.get(&transfer.id).unwrap().unwrap();
        assert_eq!(loaded.state, TransferState::Running);

        store.remove(&transfer.id).unwrap();
        assert!(store.get(&transfer.id).unwrap().is_none());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session");

        let first = entry("https://x/a.zip", TransferState::Running);
        let second = entry("https://x/b.zip", TransferState::Suspended);
        {
            let store = TransferStore::open(&path).unwrap();
            store.upsert(&first).unwrap();
            store.upsert(&second).unwrap();
            store.persist().unwrap();
        }

        let store = TransferStore::open(&path).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|t| t.url == "https://x/a.zip"));
        assert!(loaded.iter().any(|t| t.state == TransferState::Suspended));
    }
}
