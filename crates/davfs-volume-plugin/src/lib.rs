// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Docker volume plugin for WebDAV shares
//!
//! Volumes are created with a WebDAV URL and davfs2 mount options, mounted
//! through `mount.davfs` when the first container needs them and unmounted
//! when the last one lets go. The registry state survives restarts in a
//! JSON file below the plugin root.

pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod store;
pub mod types;
pub mod volume;

pub use config::PluginConfig;
pub use error::{ExecutorError, StoreError, VolumeError};
pub use executor::{DavfsMountExecutor, MountExecutor, MountSpec};
pub use handlers::build_router;
pub use registry::{VolumeInfo, VolumeRegistry, VolumeScope};
pub use server::PluginServer;
pub use store::StateStore;

use std::sync::Arc;

/// Build the registry described by `config`, loading any persisted volumes.
pub async fn open_registry(config: &PluginConfig) -> Result<VolumeRegistry, StoreError> {
    let executor =
        DavfsMountExecutor::new(config.mount_binary.clone(), config.umount_binary.clone());
    VolumeRegistry::load(
        config.volumes_dir(),
        StateStore::new(config.state_path()),
        Arc::new(executor),
    )
    .await
}
