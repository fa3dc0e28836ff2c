// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume records and `docker volume create -o` option parsing

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::VolumeError;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "dav", "davs"];
const MAX_OWNER_NAME_LEN: usize = 32;

/// One volume definition plus its runtime reference count.
///
/// Everything except `ref_count` is persisted in the state file. The
/// reference count always starts at zero when the record is loaded.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeRecord {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub conf: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub file_mode: Option<String>,
    pub dir_mode: Option<String>,
    pub read_only: bool,
    pub read_write: bool,
    pub exec: bool,
    pub suid: bool,
    pub grpid: bool,
    pub netdev: bool,
    pub mountpoint: PathBuf,
    #[serde(skip)]
    pub ref_count: u32,
}

impl VolumeRecord {
    /// Build a record from the driver options Docker passes on create.
    ///
    /// Keys are processed in sorted order so the reported error does not
    /// depend on hash map iteration order.
    pub fn from_options(
        volumes_root: &Path,
        options: &HashMap<String, String>,
    ) -> Result<Self, VolumeError> {
        let mut record = VolumeRecord::default();
        let sorted: BTreeMap<&str, &str> =
            options.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        for (key, value) in sorted {
            match key {
                "url" => record.url = value.to_string(),
                "username" => record.username = Some(value.to_string()),
                "password" => record.password = Some(value.to_string()),
                "conf" => record.conf = Some(parse_conf(value)?),
                "uid" => record.uid = Some(parse_owner(key, value)?),
                "gid" => record.gid = Some(parse_owner(key, value)?),
                "file_mode" => record.file_mode = Some(parse_mode(key, value)?),
                "dir_mode" => record.dir_mode = Some(parse_mode(key, value)?),
                "ro" => record.read_only = parse_flag(key, value)?,
                "rw" => record.read_write = parse_flag(key, value)?,
                "exec" => record.exec = parse_flag(key, value)?,
                "suid" => record.suid = parse_flag(key, value)?,
                "grpid" => record.grpid = parse_flag(key, value)?,
                "_netdev" => record.netdev = parse_flag(key, value)?,
                other => return Err(VolumeError::InvalidOption(other.to_string())),
            }
        }

        if record.url.is_empty() {
            return Err(VolumeError::MissingRequiredOption("url"));
        }
        parse_url(&record.url)?;

        record.mountpoint = mountpoint_for(volumes_root, &record.url);
        Ok(record)
    }

    /// Parsed form of `url`. Records are validated on create, so this only
    /// fails for a state file edited by hand.
    pub fn parsed_url(&self) -> Result<Url, VolumeError> {
        parse_url(&self.url)
    }

    pub fn is_mounted(&self) -> bool {
        self.ref_count > 0
    }

    /// True when both records describe the same volume, ignoring runtime state.
    pub fn same_definition(&self, other: &VolumeRecord) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.ref_count = 0;
        b.ref_count = 0;
        a == b
    }
}

impl std::fmt::Debug for VolumeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let url = parse_url(&self.url)
            .map(|u| redact_url(&u))
            .unwrap_or_else(|_| self.url.clone());
        f.debug_struct("VolumeRecord")
            .field("url", &url)
            .field("username", &self.username)
            .field(
                "password",
                &self.password.as_ref().map(|p| davfs_logging::redact(p)),
            )
            .field("conf", &self.conf)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("file_mode", &self.file_mode)
            .field("dir_mode", &self.dir_mode)
            .field("read_only", &self.read_only)
            .field("read_write", &self.read_write)
            .field("exec", &self.exec)
            .field("suid", &self.suid)
            .field("grpid", &self.grpid)
            .field("netdev", &self.netdev)
            .field("mountpoint", &self.mountpoint)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

/// `<volumes_root>/<hex md5 of url>`; identical URLs share a mountpoint.
pub fn mountpoint_for(volumes_root: &Path, url: &str) -> PathBuf {
    let digest = Md5::digest(url.as_bytes());
    volumes_root.join(hex::encode(digest))
}

/// URL with the password replaced, safe for logs.
pub fn redact_url(url: &Url) -> String {
    if url.password().is_none() {
        return url.to_string();
    }
    let mut clean = url.clone();
    // Only fails for cannot-be-a-base URLs, which never carry a password.
    let _ = clean.set_password(Some(davfs_logging::redact("")));
    clean.to_string()
}

fn parse_url(value: &str) -> Result<Url, VolumeError> {
    let url = Url::parse(value).map_err(|e| VolumeError::malformed("url", e.to_string()))?;
    let scheme = url.scheme().to_ascii_lowercase();
    if !ALLOWED_SCHEMES.contains(&scheme.as_str()) {
        return Err(VolumeError::malformed(
            "url",
            format!("unsupported scheme {scheme:?}"),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(VolumeError::malformed("url", "missing host"));
    }
    Ok(url)
}

fn parse_conf(value: &str) -> Result<String, VolumeError> {
    if value.is_empty() || value.contains(',') {
        return Err(VolumeError::malformed(
            "conf",
            "must be a non-empty path without commas",
        ));
    }
    Ok(value.to_string())
}

// Numeric id or a user/group name.
fn parse_owner(key: &str, value: &str) -> Result<String, VolumeError> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse::<u32>()
            .map(|id| id.to_string())
            .map_err(|e| VolumeError::malformed(key, e.to_string()));
    }

    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid_start && valid_rest && value.len() <= MAX_OWNER_NAME_LEN {
        Ok(value.to_string())
    } else {
        Err(VolumeError::malformed(
            key,
            "must be a numeric id or a user/group name",
        ))
    }
}

fn parse_mode(key: &str, value: &str) -> Result<String, VolumeError> {
    let octal =
        (1..=4).contains(&value.len()) && value.bytes().all(|b| (b'0'..=b'7').contains(&b));
    if octal {
        Ok(value.to_string())
    } else {
        Err(VolumeError::malformed(key, "must be an octal mode such as 0755"))
    }
}

// `-o ro` arrives with an empty value.
fn parse_flag(key: &str, value: &str) -> Result<bool, VolumeError> {
    match value.to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(VolumeError::malformed(key, "expected a boolean")),
    }
}
