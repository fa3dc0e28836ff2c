// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon configuration

use std::path::PathBuf;

use crate::executor::{DEFAULT_MOUNT_BINARY, DEFAULT_UMOUNT_BINARY};

pub const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/davfs.sock";
pub const DEFAULT_ROOT: &str = "/mnt";
pub const DEFAULT_SECRETS_FILE: &str = "/etc/davfs2/secrets";

const STATE_FILE_NAME: &str = "davfs-state.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub socket_path: PathBuf,
    /// Base directory; mountpoints and the state file live below it
    pub root: PathBuf,
    pub mount_binary: String,
    pub umount_binary: String,
    /// `None` skips the ownership fix-up at startup
    pub secrets_file: Option<PathBuf>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            root: PathBuf::from(DEFAULT_ROOT),
            mount_binary: DEFAULT_MOUNT_BINARY.to_string(),
            umount_binary: DEFAULT_UMOUNT_BINARY.to_string(),
            secrets_file: Some(PathBuf::from(DEFAULT_SECRETS_FILE)),
        }
    }
}

impl PluginConfig {
    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state").join(STATE_FILE_NAME)
    }
}
