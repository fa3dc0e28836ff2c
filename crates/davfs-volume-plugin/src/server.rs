// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, info, warn};

use crate::handlers::build_router;
use crate::registry::VolumeRegistry;

/// Serves the plugin protocol on the Unix socket Docker discovers plugins through.
pub struct PluginServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    app: Router,
}

impl PluginServer {
    /// Bind the socket, replacing a stale one left by a previous run.
    pub fn bind(socket_path: PathBuf, registry: Arc<VolumeRegistry>) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            debug!(operation = "server_create_socket_dir", parent_path = %parent.display(), "Creating socket directory");
            std::fs::create_dir_all(parent)?;
        }

        if socket_path.exists() {
            debug!(operation = "server_remove_stale_socket", socket_path = %socket_path.display(), "Removing existing socket file");
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&socket_path)?.permissions();
            perms.set_mode(0o660);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        info!(operation = "start_server", socket_path = %socket_path.display(), "Plugin listening on socket");

        Ok(Self {
            socket_path,
            listener: Some(listener),
            app: build_router(registry),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or_else(|| anyhow!("Server not initialized"))?;

        let mut connection_count: u64 = 0;
        loop {
            let socket = match listener.accept().await {
                Ok((socket, _)) => socket,
                Err(e) => {
                    warn!(operation = "accept_connection", error = %e, "Error accepting connection");
                    continue;
                }
            };
            connection_count += 1;
            debug!(operation = "server_accept_connection", connection_count, "Accepted plugin connection");

            let tower_service = self.app.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(socket);
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, hyper_service)
                    .await
                {
                    debug!(operation = "serve_connection", error = %e, connection_count, "Connection closed with error");
                }
            });
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        info!(operation = "shutdown", "Shutting down plugin");

        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => {
                debug!(operation = "shutdown_socket_removed", socket_path = %self.socket_path.display(), "Socket file removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(operation = "shutdown_socket_not_found", socket_path = %self.socket_path.display(), "Socket file not found during shutdown");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
