// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use davfs_logging::{CliLogLevel, CliLoggingArgs};
use davfs_volume_plugin::config::{DEFAULT_ROOT, DEFAULT_SECRETS_FILE, DEFAULT_SOCKET_PATH};
use davfs_volume_plugin::executor::{DEFAULT_MOUNT_BINARY, DEFAULT_UMOUNT_BINARY};
use davfs_volume_plugin::{open_registry, PluginConfig, PluginServer};
use nix::unistd::{chown, Gid, Uid};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

const COMPONENT: &str = "docker-volume-davfs";

#[derive(Parser, Debug)]
#[command(author, version, about = "Docker volume plugin for WebDAV shares", long_about = None)]
struct Args {
    /// Unix socket Docker connects to
    #[arg(long, env = "DAVFS_PLUGIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,

    /// Directory holding mountpoints and the state file
    #[arg(long, env = "DAVFS_PLUGIN_ROOT", default_value = DEFAULT_ROOT)]
    root: PathBuf,

    #[arg(long, env = "DAVFS_MOUNT_BINARY", default_value = DEFAULT_MOUNT_BINARY)]
    mount_binary: String,

    #[arg(long, env = "DAVFS_UMOUNT_BINARY", default_value = DEFAULT_UMOUNT_BINARY)]
    umount_binary: String,

    /// davfs2 secrets file; mount.davfs refuses it unless owned by root
    #[arg(long, env = "DAVFS_SECRETS_FILE", default_value = DEFAULT_SECRETS_FILE)]
    secrets_file: PathBuf,

    /// Leave the secrets file ownership alone
    #[arg(long)]
    skip_secrets_chown: bool,

    /// Log at debug level unless --log-level says otherwise
    #[arg(
        long,
        env = "DEBUG",
        action = clap::ArgAction::Set,
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    debug: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn config(&self) -> PluginConfig {
        PluginConfig {
            socket_path: self.socket_path.clone(),
            root: self.root.clone(),
            mount_binary: self.mount_binary.clone(),
            umount_binary: self.umount_binary.clone(),
            secrets_file: (!self.skip_secrets_chown).then(|| self.secrets_file.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug {
        CliLogLevel::Debug
    } else {
        CliLogLevel::Info
    };
    args.logging.init(COMPONENT, default_level)?;

    let span = tracing::info_span!("daemon", component = COMPONENT);
    let _enter = span.enter();

    let config = args.config();
    info!(operation = "start_daemon", socket_path = %config.socket_path.display(), root = %config.root.display(), "Starting WebDAV volume plugin");

    if let Some(secrets_file) = &config.secrets_file {
        chown_to_root(secrets_file)?;
    }

    let state_path = config.state_path();
    let registry = open_registry(&config)
        .await
        .with_context(|| format!("failed to load volume state from {}", state_path.display()))?;

    run_socket_mode(config, Arc::new(registry)).await
}

fn chown_to_root(path: &Path) -> Result<()> {
    chown(path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
        .with_context(|| format!("failed to chown {} to root:root", path.display()))?;
    info!(operation = "chown_secrets", secrets_file = %path.display(), "Secrets file owned by root");
    Ok(())
}

async fn run_socket_mode(
    config: PluginConfig,
    registry: Arc<davfs_volume_plugin::VolumeRegistry>,
) -> Result<()> {
    let mut server = PluginServer::bind(config.socket_path.clone(), registry)?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Server error");
                return Err(e);
            }
        }
        _ = sigint.recv() => {
            info!(operation = "shutdown", signal = "SIGINT", "Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!(operation = "shutdown", signal = "SIGTERM", "Received SIGTERM, shutting down");
        }
    }

    server.shutdown().await
}
