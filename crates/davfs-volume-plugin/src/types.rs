// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire types of the Docker volume plugin protocol

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::registry::{VolumeInfo, VolumeScope};

/// Media type Docker uses for plugin requests and expects on responses.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";

/// Body of `Create`, `Remove`, `Path` and `Get`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VolumeRequest {
    #[serde(rename = "Name")]
    pub name: String,
    /// Docker sends `null` when no `-o` options were given
    #[serde(rename = "Opts", deserialize_with = "null_as_empty")]
    pub opts: HashMap<String, String>,
}

/// Body of `Mount` and `Unmount`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    /// Caller identity; logged only
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}

impl ActivateResponse {
    pub fn volume_driver() -> Self {
        Self {
            implements: vec!["VolumeDriver".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint", skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
}

impl From<VolumeInfo> for VolumeEntry {
    fn from(info: VolumeInfo) -> Self {
        Self {
            name: info.name,
            mountpoint: info.mountpoint.to_string_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilitiesEntry {
    #[serde(rename = "Scope")]
    pub scope: String,
}

/// Response of every `VolumeDriver.*` endpoint.
///
/// Unused fields are omitted; an empty `Err` means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginResponse {
    #[serde(rename = "Err", skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(rename = "Mountpoint", skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(rename = "Volume", skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeEntry>,
    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeEntry>>,
    #[serde(rename = "Capabilities", skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitiesEntry>,
}

impl PluginResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn mountpoint(path: &Path) -> Self {
        Self {
            mountpoint: Some(path.to_string_lossy().into_owned()),
            ..Self::default()
        }
    }

    pub fn volume(info: VolumeInfo) -> Self {
        Self {
            volume: Some(info.into()),
            ..Self::default()
        }
    }

    pub fn volumes(infos: Vec<VolumeInfo>) -> Self {
        Self {
            volumes: Some(infos.into_iter().map(VolumeEntry::from).collect()),
            ..Self::default()
        }
    }

    pub fn capabilities(scope: VolumeScope) -> Self {
        Self {
            capabilities: Some(CapabilitiesEntry {
                scope: scope.as_str().to_string(),
            }),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            err: message.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.err.is_empty()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}
