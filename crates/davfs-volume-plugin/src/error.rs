// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the volume registry, state store and mount executor

use std::path::PathBuf;

/// Errors returned by registry operations.
///
/// Every variant is reported back to Docker as the `Err` field of the
/// plugin response; none of them terminates the daemon.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("volume name required")]
    MissingName,
    #[error("'{0}' option required")]
    MissingRequiredOption(&'static str),
    #[error("unknown option {0:?}")]
    InvalidOption(String),
    #[error("'{option}' option malformed: {reason}")]
    MalformedOption { option: String, reason: String },
    #[error("volume {0} not found")]
    NotFound(String),
    #[error("volume {0} already exists with different options")]
    AlreadyExists(String),
    #[error("volume {0} is currently used by a container")]
    VolumeBusy(String),
    #[error("{} already exists and it's not a directory", .0.display())]
    PathConflict(PathBuf),
    #[error("{} is still mounted; unmount it before removing the volume", .0.display())]
    StillMounted(PathBuf),
    #[error("mountpoint of volume {volume} is mounted by {holder} with different options")]
    MountpointInUse { volume: String, holder: String },
    #[error("mount failed: {0}")]
    MountExecutionFailed(#[source] ExecutorError),
    #[error("unmount failed: {0}")]
    UnmountExecutionFailed(#[source] ExecutorError),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VolumeError {
    pub(crate) fn malformed(option: &str, reason: impl Into<String>) -> Self {
        Self::MalformedOption {
            option: option.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from running the external mount tools.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to pass credentials to {program}: {source}")]
    Stdin {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {output}")]
    Failed {
        program: String,
        status: String,
        output: String,
    },
}

/// Errors from reading or writing the state file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read state file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {} is corrupt: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write state file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
