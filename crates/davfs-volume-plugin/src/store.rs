// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! JSON persistence of the volume map

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs as async_fs;
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::StoreError;
use crate::volume::VolumeRecord;

pub type VolumeMap = BTreeMap<String, VolumeRecord>;

/// Reads and writes the whole volume map as a single JSON document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the volume map. A missing file is a first run and yields an empty map.
    pub async fn load(&self) -> Result<VolumeMap, StoreError> {
        let content = match async_fs::read(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(operation = "state_load", state_path = %self.path.display(), "No state found, starting empty");
                return Ok(VolumeMap::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let volumes: VolumeMap =
            serde_json::from_slice(&content).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;

        info!(operation = "state_load", state_path = %self.path.display(), volumes = volumes.len(), "Loaded volume state");
        Ok(volumes)
    }

    /// Write the volume map through a temp file and rename it into place.
    ///
    /// The document holds WebDAV passwords, so it is only readable by the owner.
    pub async fn save(&self, volumes: &VolumeMap) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(volumes).map_err(StoreError::Serialize)?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let temp_file = self.path.with_extension("json.tmp");
        async_fs::write(&temp_file, &content).await.map_err(write_err)?;

        #[cfg(unix)]
        {
            let mut permissions = async_fs::metadata(&temp_file)
                .await
                .map_err(write_err)?
                .permissions();
            permissions.set_mode(0o600);
            async_fs::set_permissions(&temp_file, permissions)
                .await
                .map_err(write_err)?;
        }

        async_fs::rename(&temp_file, &self.path).await.map_err(write_err)?;

        debug!(operation = "state_save", state_path = %self.path.display(), volumes = volumes.len(), bytes = content.len(), "Volume state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn record(url: &str) -> VolumeRecord {
        let options = HashMap::from([
            ("url".to_string(), url.to_string()),
            ("uid".to_string(), "33".to_string()),
            ("password".to_string(), "pw".to_string()),
            ("ro".to_string(), String::new()),
        ]);
        VolumeRecord::from_options(Path::new("/mnt/volumes"), &options).unwrap()
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state").join("davfs-state.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn round_trip_resets_ref_counts() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state").join("davfs-state.json"));

        let mut volumes = VolumeMap::new();
        let mut busy = record("https://h/a");
        busy.ref_count = 2;
        volumes.insert("a".to_string(), busy);
        volumes.insert("b".to_string(), record("https://user:pw@h/b"));

        store.save(&volumes).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.len(), 2);
        for (name, original) in &volumes {
            let restored = &loaded[name];
            assert!(restored.same_definition(original), "{name}");
            assert_eq!(restored.ref_count, 0);
        }
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_owner_only() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("davfs-state.json"));
        store.save(&VolumeMap::new()).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("davfs-state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = StateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn unreadable_path_is_an_error() {
        let dir = tempdir().unwrap();
        // A directory where the file should be
        let err = StateStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }
}
