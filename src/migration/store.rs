/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/migration/store.rs
*
* Persistence for migration state records. The file store keeps one JSON
* document per volume and replaces it atomically (write to a temporary file,
* then rename), so a crash mid-write never leaves a truncated record behind.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::state::MigrationState;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::debug;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, volume_id: &str) -> Result<Option<MigrationState>>;

    async fn save(&self, state: &MigrationState) -> Result<()>;

    /// Every stored record, ordered by volume ID.
    async fn list(&self) -> Result<Vec<MigrationState>>;
}

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, volume_id: &str) -> Result<PathBuf> {
        let valid = !volume_id.is_empty()
            && volume_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Malformed(format!(
                "'{}' cannot be used as a state record name",
                volume_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", volume_id)))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self, volume_id: &str) -> Result<Option<MigrationState>> {
        let path = self.path_for(volume_id)?;
        match fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &MigrationState) -> Result<()> {
        let path = self.path_for(&state.volume_id)?;
        fs::create_dir_all(&self.dir).await?;

        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, &path).await?;

        debug!(volume_id = %state.volume_id, step = ?state.last_completed, "Saved migration state");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MigrationState>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path).await?;
            states.push(serde_json::from_slice::<MigrationState>(&raw)?);
        }
        states.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(states)
    }
}

/// A store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<BTreeMap<String, MigrationState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MigrationState>>> {
        self.states
            .lock()
            .map_err(|_| Error::Malformed("migration state lock poisoned".into()))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, volume_id: &str) -> Result<Option<MigrationState>> {
        Ok(self.lock()?.get(volume_id).cloned())
    }

    async fn save(&self, state: &MigrationState) -> Result<()> {
        self.lock()?.insert(state.volume_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MigrationState>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::state::{MigrationStatus, MigrationStep};
    use crate::model::{MigrationPlan, VolumeRecord};

    fn state(volume_id: &str) -> MigrationState {
        MigrationState::new(&MigrationPlan {
            volume: VolumeRecord {
                volume_id: volume_id.into(),
                encrypted: false,
                availability_zone: "us-east-1a".into(),
                pv_name: format!("pv-{}", volume_id),
                claim: None,
            },
            volume_index: 0,
            mounts: Vec::new(),
            owner: None,
            original_replicas: None,
        })
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));
        assert!(store.load("vol-abc").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        let mut s = state("vol-abc");
        s.advance(MigrationStep::PauseOwner, |s| s.original_replicas = Some(2)).unwrap();
        s.advance(MigrationStep::SnapshotSource, |s| s.snapshot_id = Some("snap-1".into()))
            .unwrap();
        store.save(&s).await.unwrap();
        store.save(&state("vol-000")).await.unwrap();

        let reopened = JsonFileStore::new(dir.path().join("state"));
        let loaded = reopened.load("vol-abc").await.unwrap().unwrap();
        assert_eq!(loaded, s);
        assert_eq!(loaded.status, MigrationStatus::InProgress);

        let ids: Vec<String> = reopened.list().await.unwrap().into_iter().map(|s| s.volume_id).collect();
        assert_eq!(ids, vec!["vol-000", "vol-abc"]);
        assert!(reopened.dir().join("vol-abc.json").exists());
        assert!(!reopened.dir().join("vol-abc.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.save(&state("vol/abc")).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(&state("vol-b")).await.unwrap();
        store.save(&state("vol-a")).await.unwrap();
        assert!(store.load("vol-a").await.unwrap().is_some());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
