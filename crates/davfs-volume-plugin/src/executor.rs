// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Invocation of the external `mount.davfs` / `umount` tools

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::error::{ExecutorError, VolumeError};
use crate::volume::VolumeRecord;

pub const DEFAULT_MOUNT_BINARY: &str = "mount.davfs";
pub const DEFAULT_UMOUNT_BINARY: &str = "umount";

/// Mounts and unmounts WebDAV shares for the registry.
///
/// The registry never retries; a failed call is reported to the caller.
#[async_trait]
pub trait MountExecutor: Send + Sync {
    async fn mount(&self, spec: &MountSpec) -> Result<(), ExecutorError>;
    async fn unmount(&self, mountpoint: &Path) -> Result<(), ExecutorError>;

    /// Whether something is currently mounted on `mountpoint`.
    async fn is_mounted(&self, mountpoint: &Path) -> bool {
        mount_point_active(mountpoint).await
    }
}

/// Username and password handed to the mount tool on stdin.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn stdin_payload(&self) -> String {
        format!("{}\n{}", self.username, self.password)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &davfs_logging::redact(&self.password))
            .finish()
    }
}

/// Everything needed for one mount invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSpec {
    /// `scheme://host[:port]/path`, without userinfo, query or fragment
    pub target: String,
    pub mountpoint: PathBuf,
    /// Values for `-o`, in a fixed order
    pub options: Vec<String>,
    pub credentials: Option<Credentials>,
}

impl MountSpec {
    pub fn from_record(record: &VolumeRecord) -> Result<Self, VolumeError> {
        let url = record.parsed_url()?;

        let mut target = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
        if let Some(port) = url.port() {
            target.push_str(&format!(":{port}"));
        }
        target.push_str(url.path());

        Ok(Self {
            target,
            mountpoint: record.mountpoint.clone(),
            options: mount_options(record),
            credentials: credentials(record, &url),
        })
    }

    /// Arguments after the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.target.clone(),
            self.mountpoint.to_string_lossy().into_owned(),
        ];
        if !self.options.is_empty() {
            args.push("-o".to_string());
            args.push(self.options.join(","));
        }
        args
    }
}

fn mount_options(record: &VolumeRecord) -> Vec<String> {
    let mut options = Vec::new();
    let valued = [
        ("conf", &record.conf),
        ("uid", &record.uid),
        ("gid", &record.gid),
        ("file_mode", &record.file_mode),
        ("dir_mode", &record.dir_mode),
    ];
    for (key, value) in valued {
        if let Some(value) = value {
            options.push(format!("{key}={value}"));
        }
    }

    let flags = [
        ("ro", record.read_only),
        ("rw", record.read_write),
        ("exec", record.exec),
        ("suid", record.suid),
        ("grpid", record.grpid),
        ("_netdev", record.netdev),
    ];
    options.extend(
        flags
            .into_iter()
            .filter(|(_, set)| *set)
            .map(|(flag, _)| flag.to_string()),
    );
    options
}

// URL userinfo wins over the explicit username/password options.
fn credentials(record: &VolumeRecord, url: &url::Url) -> Option<Credentials> {
    if !url.username().is_empty() {
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        return Some(Credentials {
            username: decode(url.username()),
            password: url.password().map(decode).unwrap_or_default(),
        });
    }

    record
        .username
        .as_ref()
        .filter(|u| !u.is_empty())
        .map(|username| Credentials {
            username: username.clone(),
            password: record.password.clone().unwrap_or_default(),
        })
}

/// Runs the real mount tools as child processes.
#[derive(Debug, Clone)]
pub struct DavfsMountExecutor {
    mount_binary: String,
    umount_binary: String,
}

impl DavfsMountExecutor {
    pub fn new(mount_binary: impl Into<String>, umount_binary: impl Into<String>) -> Self {
        Self {
            mount_binary: mount_binary.into(),
            umount_binary: umount_binary.into(),
        }
    }
}

#[async_trait]
impl MountExecutor for DavfsMountExecutor {
    async fn mount(&self, spec: &MountSpec) -> Result<(), ExecutorError> {
        let args = spec.args();
        debug!(operation = "run_mount", program = %self.mount_binary, args = ?args, has_credentials = spec.credentials.is_some(), "Running mount command");

        let stdin = spec.credentials.as_ref().map(Credentials::stdin_payload);
        run_command(&self.mount_binary, &args, stdin).await
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<(), ExecutorError> {
        let args = vec![mountpoint.to_string_lossy().into_owned()];
        debug!(operation = "run_umount", program = %self.umount_binary, args = ?args, "Running umount command");

        run_command(&self.umount_binary, &args, None).await
    }
}

/// Cap on captured tool output per stream.
const MAX_OUTPUT_BYTES: u64 = 64 * 1024;

/// How long to keep reading output after the tool exited. `mount.davfs`
/// leaves a daemon behind that may still hold the inherited pipes.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

async fn run_command(
    program: &str,
    args: &[String],
    stdin: Option<String>,
) -> Result<(), ExecutorError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let mut output_reader =
        tokio::spawn(read_output(child.stdout.take(), child.stderr.take()));

    if let Some(payload) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            match pipe.write_all(payload.as_bytes()).await {
                Ok(()) => {}
                // The tool exited before reading; its exit status tells why.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(operation = "run_command_stdin", program = %program, "Child closed stdin early");
                }
                Err(source) => {
                    output_reader.abort();
                    return Err(ExecutorError::Stdin {
                        program: program.to_string(),
                        source,
                    });
                }
            }
            // Dropping the pipe closes it so the tool sees EOF.
            drop(pipe);
        }
    }

    let status = child.wait().await.map_err(|source| {
        output_reader.abort();
        ExecutorError::Spawn {
            program: program.to_string(),
            source,
        }
    })?;

    let (stdout, stderr) = match tokio::time::timeout(OUTPUT_GRACE, &mut output_reader).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => Default::default(),
        Err(_) => {
            debug!(operation = "run_command_output", program = %program, "Output pipes still open after exit, not waiting");
            output_reader.abort();
            Default::default()
        }
    };

    if status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&stderr);
    let stdout = String::from_utf8_lossy(&stdout);
    let combined = [stderr.trim(), stdout.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    Err(ExecutorError::Failed {
        program: program.to_string(),
        status: status.to_string(),
        output: combined,
    })
}

async fn read_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> (Vec<u8>, Vec<u8>) {
    async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(pipe) = pipe {
            // Partial output is still useful; read errors just end the capture.
            let _ = pipe.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
        }
        buf
    }
    tokio::join!(drain(stdout), drain(stderr))
}

/// A directory on a different device than its parent is a mount point.
pub(crate) async fn mount_point_active(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    match (
        tokio::fs::symlink_metadata(path).await,
        tokio::fs::symlink_metadata(parent).await,
    ) {
        (Ok(own), Ok(parent)) => own.is_dir() && own.dev() != parent.dev(),
        _ => false,
    }
}
