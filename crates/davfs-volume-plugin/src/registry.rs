// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume registry: named WebDAV volumes, their reference counts and the
//! mount/unmount lifecycle.
//!
//! All state lives behind a single `RwLock`. Lookups take the read lock;
//! every operation that can change a reference count or the map takes the
//! write lock and holds it across the executor call and the state save, so
//! the mount tools never run concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs as async_fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, VolumeError};
use crate::executor::{MountExecutor, MountSpec};
use crate::store::{StateStore, VolumeMap};
use crate::volume::VolumeRecord;

/// Name and mountpoint of a volume, as reported by `Get` and `List`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: PathBuf,
}

/// Visibility of the volumes managed by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeScope {
    Local,
}

impl VolumeScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeScope::Local => "local",
        }
    }
}

pub struct VolumeRegistry {
    volumes_root: PathBuf,
    store: StateStore,
    executor: Arc<dyn MountExecutor>,
    volumes: RwLock<VolumeMap>,
}

impl std::fmt::Debug for VolumeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeRegistry")
            .field("volumes_root", &self.volumes_root)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl VolumeRegistry {
    /// Load persisted volumes and build the registry. Reference counts start at zero.
    pub async fn load(
        volumes_root: impl Into<PathBuf>,
        store: StateStore,
        executor: Arc<dyn MountExecutor>,
    ) -> Result<Self, StoreError> {
        let volumes = store.load().await?;
        Ok(Self {
            volumes_root: volumes_root.into(),
            store,
            executor,
            volumes: RwLock::new(volumes),
        })
    }

    /// Register a new volume from driver options.
    ///
    /// Re-creating a volume with an identical definition succeeds without
    /// changes; a different definition under the same name is rejected.
    pub async fn create(
        &self,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<(), VolumeError> {
        if name.is_empty() {
            return Err(VolumeError::MissingName);
        }
        let record = VolumeRecord::from_options(&self.volumes_root, options)?;

        let mut volumes = self.volumes.write().await;
        if let Some(existing) = volumes.get(name) {
            if existing.same_definition(&record) {
                debug!(operation = "create", volume = %name, "Volume already exists with identical options");
                return Ok(());
            }
            return Err(VolumeError::AlreadyExists(name.to_string()));
        }

        info!(operation = "create", volume = %name, mountpoint = %record.mountpoint.display(), "Volume created");
        volumes.insert(name.to_string(), record);
        self.persist(&volumes).await;
        Ok(())
    }

    /// Forget a volume and delete its mountpoint directory.
    pub async fn remove(&self, name: &str) -> Result<(), VolumeError> {
        let mut volumes = self.volumes.write().await;
        let record = volumes
            .get(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        if record.is_mounted() {
            return Err(VolumeError::VolumeBusy(name.to_string()));
        }

        let mountpoint = record.mountpoint.clone();
        if mount_holder(&volumes, name, &mountpoint).is_some() {
            debug!(operation = "remove", volume = %name, mountpoint = %mountpoint.display(), "Mountpoint still used by another volume, keeping directory");
        } else {
            if self.executor.is_mounted(&mountpoint).await {
                return Err(VolumeError::StillMounted(mountpoint));
            }
            match async_fs::remove_dir_all(&mountpoint).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(VolumeError::io(mountpoint, err)),
            }
        }

        volumes.remove(name);
        info!(operation = "remove", volume = %name, "Volume removed");
        self.persist(&volumes).await;
        Ok(())
    }

    pub async fn path(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let volumes = self.volumes.read().await;
        volumes
            .get(name)
            .map(|record| record.mountpoint.clone())
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    pub async fn get(&self, name: &str) -> Result<VolumeInfo, VolumeError> {
        let volumes = self.volumes.read().await;
        volumes
            .get(name)
            .map(|record| VolumeInfo {
                name: name.to_string(),
                mountpoint: record.mountpoint.clone(),
            })
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    /// All volumes, ordered by name.
    pub async fn list(&self) -> Vec<VolumeInfo> {
        let volumes = self.volumes.read().await;
        volumes
            .iter()
            .map(|(name, record)| VolumeInfo {
                name: name.clone(),
                mountpoint: record.mountpoint.clone(),
            })
            .collect()
    }

    /// Mount a volume for one more container and return its mountpoint.
    ///
    /// Only the first user triggers `mount.davfs`; later users share the
    /// existing mount. Another volume on the same URL may share it only when
    /// it would mount with the same options and credentials. A failed mount
    /// leaves the reference count unchanged.
    pub async fn mount(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let mut volumes = self.volumes.write().await;
        let record = volumes
            .get(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;

        if !record.is_mounted() {
            let spec = MountSpec::from_record(record)?;
            match mount_holder(&volumes, name, &record.mountpoint) {
                Some((holder_name, holder)) => {
                    if MountSpec::from_record(holder)? != spec {
                        return Err(VolumeError::MountpointInUse {
                            volume: name.to_string(),
                            holder: holder_name.clone(),
                        });
                    }
                    debug!(operation = "mount", volume = %name, holder = %holder_name, mountpoint = %spec.mountpoint.display(), "Reusing mount held by another volume");
                }
                None => {
                    ensure_mountpoint(&spec.mountpoint).await?;
                    if self.executor.is_mounted(&spec.mountpoint).await {
                        warn!(operation = "mount", volume = %name, mountpoint = %spec.mountpoint.display(), "Releasing mount left behind before mounting");
                        self.executor
                            .unmount(&spec.mountpoint)
                            .await
                            .map_err(VolumeError::UnmountExecutionFailed)?;
                    }
                    debug!(operation = "mount", volume = %name, target = %spec.target, mountpoint = %spec.mountpoint.display(), "Mounting WebDAV share");
                    self.executor
                        .mount(&spec)
                        .await
                        .map_err(VolumeError::MountExecutionFailed)?;
                    info!(operation = "mount", volume = %name, mountpoint = %spec.mountpoint.display(), "Volume mounted");
                }
            }
        }

        let record = volumes
            .get_mut(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        record.ref_count += 1;
        debug!(operation = "mount", volume = %name, ref_count = record.ref_count, "Reference added");
        Ok(record.mountpoint.clone())
    }

    /// Release one container's use of a volume.
    ///
    /// The share is unmounted when the last user goes away. The count drops
    /// to zero even when the unmount tool fails; unmounting an unused volume
    /// retries the tool only if its mountpoint is still mounted.
    pub async fn unmount(&self, name: &str) -> Result<(), VolumeError> {
        let mut volumes = self.volumes.write().await;
        let record = volumes
            .get_mut(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        let mountpoint = record.mountpoint.clone();

        let was_used = match record.ref_count {
            0 => false,
            1 => {
                record.ref_count = 0;
                true
            }
            n => {
                record.ref_count = n - 1;
                debug!(operation = "unmount", volume = %name, ref_count = record.ref_count, "Reference released");
                return Ok(());
            }
        };

        if mount_holder(&volumes, name, &mountpoint).is_some() {
            debug!(operation = "unmount", volume = %name, mountpoint = %mountpoint.display(), "Mount still held by another volume");
            return Ok(());
        }
        if !was_used {
            if !self.executor.is_mounted(&mountpoint).await {
                debug!(operation = "unmount", volume = %name, "Volume not mounted, nothing to do");
                return Ok(());
            }
            warn!(operation = "unmount", volume = %name, mountpoint = %mountpoint.display(), "Unmounting mount left behind");
        }

        if let Err(err) = self.executor.unmount(&mountpoint).await {
            warn!(operation = "unmount", volume = %name, mountpoint = %mountpoint.display(), error = %err, "Unmount failed");
            return Err(VolumeError::UnmountExecutionFailed(err));
        }
        info!(operation = "unmount", volume = %name, mountpoint = %mountpoint.display(), "Volume unmounted");
        Ok(())
    }

    pub fn capabilities(&self) -> VolumeScope {
        VolumeScope::Local
    }

    pub async fn ref_count(&self, name: &str) -> Result<u32, VolumeError> {
        let volumes = self.volumes.read().await;
        volumes
            .get(name)
            .map(|record| record.ref_count)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    async fn persist(&self, volumes: &VolumeMap) {
        if let Err(err) = self.store.save(volumes).await {
            error!(operation = "state_save", state_path = %self.store.path().display(), error = %err, "PersistenceFailed: in-memory state kept");
        }
    }
}

/// Another mounted volume with the same mountpoint, if any.
fn mount_holder<'a>(
    volumes: &'a VolumeMap,
    name: &str,
    mountpoint: &Path,
) -> Option<(&'a String, &'a VolumeRecord)> {
    volumes.iter().find(|(other, record)| {
        other.as_str() != name && record.is_mounted() && record.mountpoint == mountpoint
    })
}

async fn ensure_mountpoint(path: &Path) -> Result<(), VolumeError> {
    match async_fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(VolumeError::PathConflict(path.to_path_buf())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let mut builder = async_fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o755);
            builder
                .create(path)
                .await
                .map_err(|err| VolumeError::io(path, err))
        }
        Err(err) => Err(VolumeError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use crate::volume::mountpoint_for;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct RecordingExecutor {
        mounts: StdMutex<Vec<MountSpec>>,
        unmounts: StdMutex<Vec<PathBuf>>,
        live: StdMutex<HashSet<PathBuf>>,
        fail_mount: AtomicBool,
        fail_unmount: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Option<Duration>,
    }

    impl RecordingExecutor {
        fn slow() -> Self {
            Self {
                delay: Some(Duration::from_millis(2)),
                ..Self::default()
            }
        }

        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn mount_calls(&self) -> usize {
            self.mounts.lock().unwrap().len()
        }

        fn unmount_calls(&self) -> usize {
            self.unmounts.lock().unwrap().len()
        }

        fn is_live(&self, mountpoint: &Path) -> bool {
            self.live.lock().unwrap().contains(mountpoint)
        }

        fn failure(program: &str) -> ExecutorError {
            ExecutorError::Failed {
                program: program.to_string(),
                status: "exit status: 1".to_string(),
                output: "simulated failure".to_string(),
            }
        }
    }

    #[async_trait]
    impl MountExecutor for RecordingExecutor {
        async fn mount(&self, spec: &MountSpec) -> Result<(), ExecutorError> {
            self.enter().await;
            if self.fail_mount.load(Ordering::SeqCst) {
                return Err(Self::failure("mount.davfs"));
            }
            self.mounts.lock().unwrap().push(spec.clone());
            self.live.lock().unwrap().insert(spec.mountpoint.clone());
            Ok(())
        }

        async fn unmount(&self, mountpoint: &Path) -> Result<(), ExecutorError> {
            self.enter().await;
            self.unmounts.lock().unwrap().push(mountpoint.to_path_buf());
            if self.fail_unmount.load(Ordering::SeqCst) {
                return Err(Self::failure("umount"));
            }
            self.live.lock().unwrap().remove(mountpoint);
            Ok(())
        }

        async fn is_mounted(&self, mountpoint: &Path) -> bool {
            self.is_live(mountpoint)
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        executor: Arc<RecordingExecutor>,
        registry: Arc<VolumeRegistry>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_executor(RecordingExecutor::default()).await
        }

        async fn with_executor(executor: RecordingExecutor) -> Self {
            let dir = tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let executor = Arc::new(executor);
            let registry = Arc::new(open(&root, executor.clone()).await);
            Self {
                _dir: dir,
                root,
                executor,
                registry,
            }
        }

        fn volumes_root(&self) -> PathBuf {
            self.root.join("volumes")
        }
    }

    async fn open(root: &Path, executor: Arc<RecordingExecutor>) -> VolumeRegistry {
        VolumeRegistry::load(
            root.join("volumes"),
            StateStore::new(root.join("state").join("davfs-state.json")),
            executor,
        )
        .await
        .unwrap()
    }

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn share(url: &str) -> HashMap<String, String> {
        opts(&[("url", url)])
    }

    #[tokio::test]
    async fn created_volume_is_visible_through_lookups() {
        let fx = Fixture::new().await;
        fx.registry
            .create("docs", &share("https://dav.example.com/docs"))
            .await
            .unwrap();

        let expected = mountpoint_for(&fx.volumes_root(), "https://dav.example.com/docs");
        assert_eq!(fx.registry.path("docs").await.unwrap(), expected);
        assert_eq!(
            fx.registry.get("docs").await.unwrap(),
            VolumeInfo {
                name: "docs".to_string(),
                mountpoint: expected.clone()
            }
        );
        assert_eq!(fx.registry.list().await.len(), 1);
        assert_eq!(fx.registry.ref_count("docs").await.unwrap(), 0);
        // Creation does not touch the filesystem
        assert!(!expected.exists());
    }

    #[tokio::test]
    async fn create_rejects_bad_options() {
        let fx = Fixture::new().await;

        let err = fx.registry.create("v", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, VolumeError::MissingRequiredOption("url")));

        let err = fx
            .registry
            .create("v", &opts(&[("url", "https://h/x"), ("colour", "red")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::InvalidOption(ref key) if key == "colour"));

        let err = fx
            .registry
            .create("v", &opts(&[("url", "https://h/x"), ("uid", "not a user")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::MalformedOption { .. }));

        assert!(fx.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_is_idempotent_only_for_identical_options() {
        let fx = Fixture::new().await;
        let options = opts(&[("url", "https://h/x"), ("uid", "33")]);
        fx.registry.create("v", &options).await.unwrap();
        fx.registry.create("v", &options).await.unwrap();

        let err = fx
            .registry
            .create("v", &opts(&[("url", "https://h/x"), ("uid", "34")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::AlreadyExists(ref name) if name == "v"));
        assert_eq!(fx.registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let fx = Fixture::new().await;
        let err = fx.registry.create("", &share("https://h/x")).await.unwrap_err();
        assert!(matches!(err, VolumeError::MissingName));
        assert!(fx.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn lookups_of_unknown_volume_fail() {
        let fx = Fixture::new().await;
        assert!(matches!(fx.registry.path("nope").await, Err(VolumeError::NotFound(_))));
        assert!(matches!(fx.registry.get("nope").await, Err(VolumeError::NotFound(_))));
        assert!(matches!(fx.registry.mount("nope").await, Err(VolumeError::NotFound(_))));
        assert!(matches!(fx.registry.unmount("nope").await, Err(VolumeError::NotFound(_))));
        assert!(matches!(fx.registry.remove("nope").await, Err(VolumeError::NotFound(_))));
        assert_eq!(fx.executor.mount_calls(), 0);
    }

    #[tokio::test]
    async fn first_mount_runs_tool_and_later_mounts_share_it() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();

        let first = fx.registry.mount("v").await.unwrap();
        let second = fx.registry.mount("v").await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert_eq!(fx.executor.mount_calls(), 1);
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 2);

        fx.registry.unmount("v").await.unwrap();
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 1);
        assert_eq!(fx.executor.unmount_calls(), 0);

        fx.registry.unmount("v").await.unwrap();
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 0);
        assert_eq!(fx.executor.unmount_calls(), 1);

        // Extra unmounts are harmless
        fx.registry.unmount("v").await.unwrap();
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 0);
        assert_eq!(fx.executor.unmount_calls(), 1);
    }

    #[tokio::test]
    async fn mount_passes_record_to_executor() {
        let fx = Fixture::new().await;
        fx.registry
            .create(
                "v",
                &opts(&[
                    ("url", "https://alice:secret@h/x"),
                    ("uid", "1000"),
                    ("ro", ""),
                ]),
            )
            .await
            .unwrap();
        let mountpoint = fx.registry.mount("v").await.unwrap();

        let mounts = fx.executor.mounts.lock().unwrap();
        let spec = &mounts[0];
        assert_eq!(spec.target, "https://h/x");
        assert_eq!(spec.mountpoint, mountpoint);
        assert_eq!(spec.options, vec!["uid=1000".to_string(), "ro".to_string()]);
        let credentials = spec.credentials.as_ref().unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "secret");
    }

    #[tokio::test]
    async fn failed_mount_leaves_count_unchanged() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        fx.executor.fail_mount.store(true, Ordering::SeqCst);

        let err = fx.registry.mount("v").await.unwrap_err();
        assert!(matches!(err, VolumeError::MountExecutionFailed(_)));
        assert!(err.to_string().contains("simulated failure"));
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 0);

        fx.executor.fail_mount.store(false, Ordering::SeqCst);
        fx.registry.mount("v").await.unwrap();
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_unmount_still_releases_reference() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        fx.registry.mount("v").await.unwrap();
        fx.executor.fail_unmount.store(true, Ordering::SeqCst);

        let err = fx.registry.unmount("v").await.unwrap_err();
        assert!(matches!(err, VolumeError::UnmountExecutionFailed(_)));
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unmount_retries_mount_left_by_failed_unmount() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        let mountpoint = fx.registry.mount("v").await.unwrap();
        fx.executor.fail_unmount.store(true, Ordering::SeqCst);
        fx.registry.unmount("v").await.unwrap_err();
        assert!(fx.executor.is_live(&mountpoint));

        fx.executor.fail_unmount.store(false, Ordering::SeqCst);
        fx.registry.unmount("v").await.unwrap();
        assert_eq!(fx.executor.unmount_calls(), 2);
        assert!(!fx.executor.is_live(&mountpoint));

        // Nothing left to release
        fx.registry.unmount("v").await.unwrap();
        assert_eq!(fx.executor.unmount_calls(), 2);
        fx.registry.remove("v").await.unwrap();
    }

    #[tokio::test]
    async fn remove_refuses_mountpoint_that_is_still_mounted() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        let mountpoint = fx.registry.path("v").await.unwrap();
        std::fs::create_dir_all(&mountpoint).unwrap();
        // A mount that outlived its reference, e.g. across a restart
        fx.executor.live.lock().unwrap().insert(mountpoint.clone());

        let err = fx.registry.remove("v").await.unwrap_err();
        assert!(matches!(err, VolumeError::StillMounted(ref path) if *path == mountpoint));
        assert!(fx.registry.get("v").await.is_ok());
        assert!(mountpoint.is_dir());

        fx.registry.unmount("v").await.unwrap();
        assert_eq!(fx.executor.unmount_calls(), 1);
        fx.registry.remove("v").await.unwrap();
        assert!(!mountpoint.exists());
    }

    #[tokio::test]
    async fn mount_releases_leftover_mount_first() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        let mountpoint = fx.registry.path("v").await.unwrap();
        fx.executor.live.lock().unwrap().insert(mountpoint.clone());

        fx.registry.mount("v").await.unwrap();
        assert_eq!(fx.executor.unmount_calls(), 1);
        assert_eq!(fx.executor.mount_calls(), 1);
        assert!(fx.executor.is_live(&mountpoint));
    }

    #[tokio::test]
    async fn mountpoint_occupied_by_file_is_a_conflict() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        let mountpoint = fx.registry.path("v").await.unwrap();
        std::fs::create_dir_all(mountpoint.parent().unwrap()).unwrap();
        std::fs::write(&mountpoint, b"in the way").unwrap();

        let err = fx.registry.mount("v").await.unwrap_err();
        assert!(matches!(err, VolumeError::PathConflict(ref path) if *path == mountpoint));
        assert_eq!(fx.executor.mount_calls(), 0);
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn busy_volume_cannot_be_removed() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        let mountpoint = fx.registry.mount("v").await.unwrap();

        let err = fx.registry.remove("v").await.unwrap_err();
        assert!(matches!(err, VolumeError::VolumeBusy(ref name) if name == "v"));
        assert!(fx.registry.get("v").await.is_ok());

        fx.registry.unmount("v").await.unwrap();
        fx.registry.remove("v").await.unwrap();
        assert!(!mountpoint.exists());
        assert!(matches!(fx.registry.get("v").await, Err(VolumeError::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_without_mountpoint_directory_succeeds() {
        let fx = Fixture::new().await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();
        fx.registry.remove("v").await.unwrap();
        assert!(fx.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn different_options_cannot_join_a_live_mount() {
        let fx = Fixture::new().await;
        fx.registry
            .create("rw", &opts(&[("url", "https://h/shared"), ("username", "alice")]))
            .await
            .unwrap();
        fx.registry
            .create(
                "ro",
                &opts(&[("url", "https://h/shared"), ("username", "bob"), ("ro", "")]),
            )
            .await
            .unwrap();
        fx.registry.mount("rw").await.unwrap();

        let err = fx.registry.mount("ro").await.unwrap_err();
        match err {
            VolumeError::MountpointInUse { volume, holder } => {
                assert_eq!(volume, "ro");
                assert_eq!(holder, "rw");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.registry.ref_count("ro").await.unwrap(), 0);
        assert_eq!(fx.executor.mount_calls(), 1);

        // Once the holder is gone the volume mounts with its own options
        fx.registry.unmount("rw").await.unwrap();
        fx.registry.mount("ro").await.unwrap();
        let mounts = fx.executor.mounts.lock().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].options, vec!["ro".to_string()]);
        assert_eq!(mounts[1].credentials.as_ref().unwrap().username, "bob");
    }

    #[tokio::test]
    async fn volumes_sharing_a_url_share_one_mount() {
        let fx = Fixture::new().await;
        fx.registry.create("a", &share("https://h/shared")).await.unwrap();
        fx.registry.create("b", &share("https://h/shared")).await.unwrap();

        let a = fx.registry.mount("a").await.unwrap();
        let b = fx.registry.mount("b").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(fx.executor.mount_calls(), 1);

        fx.registry.unmount("a").await.unwrap();
        assert_eq!(fx.executor.unmount_calls(), 0);

        // b still holds the mount, so the directory stays
        fx.registry.remove("a").await.unwrap();
        assert!(b.is_dir());

        fx.registry.unmount("b").await.unwrap();
        assert_eq!(fx.executor.unmount_calls(), 1);
        fx.registry.remove("b").await.unwrap();
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn volumes_survive_restart_without_references() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(RecordingExecutor::default());
        let registry = open(dir.path(), executor.clone()).await;
        registry
            .create("a", &opts(&[("url", "https://h/a"), ("password", "pw")]))
            .await
            .unwrap();
        registry.create("b", &share("https://h/b")).await.unwrap();
        registry.create("c", &share("https://h/c")).await.unwrap();
        registry.mount("a").await.unwrap();
        registry.remove("c").await.unwrap();
        let before = registry.list().await;
        drop(registry);

        let restarted = open(dir.path(), executor).await;
        assert_eq!(restarted.list().await, before);
        assert_eq!(restarted.ref_count("a").await.unwrap(), 0);
        assert!(matches!(restarted.get("c").await, Err(VolumeError::NotFound(_))));
    }

    #[tokio::test]
    async fn unwritable_state_does_not_fail_operations() {
        let dir = tempdir().unwrap();
        // The state path's parent is a regular file, so every save fails
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let registry = VolumeRegistry::load(
            dir.path().join("volumes"),
            StateStore::new(blocker.join("davfs-state.json")),
            Arc::new(RecordingExecutor::default()),
        )
        .await;
        // Loading reports the unreadable path
        assert!(registry.is_err());

        let registry = VolumeRegistry {
            volumes_root: dir.path().join("volumes"),
            store: StateStore::new(blocker.join("davfs-state.json")),
            executor: Arc::new(RecordingExecutor::default()),
            volumes: RwLock::new(VolumeMap::new()),
        };
        registry.create("v", &share("https://h/x")).await.unwrap();
        assert!(registry.get("v").await.is_ok());
        registry.remove("v").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mounts_run_the_tool_once() {
        let fx = Fixture::with_executor(RecordingExecutor::slow()).await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();

        let mounts: Vec<_> = (0..20)
            .map(|_| {
                let registry = fx.registry.clone();
                tokio::spawn(async move { registry.mount("v").await })
            })
            .collect();
        for handle in mounts {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 20);
        assert_eq!(fx.executor.mount_calls(), 1);

        let unmounts: Vec<_> = (0..20)
            .map(|_| {
                let registry = fx.registry.clone();
                tokio::spawn(async move { registry.unmount("v").await })
            })
            .collect();
        for handle in unmounts {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fx.registry.ref_count("v").await.unwrap(), 0);
        assert_eq!(fx.executor.unmount_calls(), 1);
        assert_eq!(fx.executor.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_mounts_and_unmounts_stay_consistent() {
        let fx = Fixture::with_executor(RecordingExecutor::slow()).await;
        fx.registry.create("v", &share("https://h/x")).await.unwrap();

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let registry = fx.registry.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        registry.mount("v").await.map(|_| ())
                    } else {
                        registry.unmount("v").await
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let ref_count = fx.registry.ref_count("v").await.unwrap();
        let mounted = fx.executor.mount_calls() - fx.executor.unmount_calls();
        assert!(ref_count <= 20);
        assert_eq!(mounted, usize::from(ref_count > 0));
        assert_eq!(fx.executor.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_is_local() {
        assert_eq!(VolumeScope::Local.as_str(), "local");
    }
}
