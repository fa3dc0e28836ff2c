// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP routes of the Docker volume plugin protocol

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::VolumeError;
use crate::registry::VolumeRegistry;
use crate::types::{
    ActivateResponse, MountRequest, PluginResponse, VolumeRequest, PLUGIN_CONTENT_TYPE,
};

type RegistryState = State<Arc<VolumeRegistry>>;

/// Errors a handler reports back to Docker.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("invalid request body: {0}")]
    BadRequest(#[from] serde_json::Error),
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let status = match self {
            PluginError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PluginError::Volume(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(status = status.as_u16(), error = %self, "Plugin request failed");
        plugin_json(status, &PluginResponse::error(self.to_string()))
    }
}

impl IntoResponse for PluginResponse {
    fn into_response(self) -> Response {
        let status = if self.is_error() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        plugin_json(status, &self)
    }
}

impl IntoResponse for ActivateResponse {
    fn into_response(self) -> Response {
        plugin_json(StatusCode::OK, &self)
    }
}

fn plugin_json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)], bytes).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Docker sends the plugin media type, which axum's `Json` extractor refuses,
/// and may send an empty body for requests without fields.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, PluginError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    let value: Option<T> = serde_json::from_slice(body)?;
    Ok(value.unwrap_or_default())
}

/// Build the plugin router over a shared registry.
pub fn build_router(registry: Arc<VolumeRegistry>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "plugin_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    correlation_id = %davfs_logging::correlation_id(),
                )
            }),
        )
        .with_state(registry)
}

async fn activate() -> ActivateResponse {
    debug!(operation = "activate", "Plugin activated");
    ActivateResponse::volume_driver()
}

async fn create(
    State(registry): RegistryState,
    body: Bytes,
) -> Result<PluginResponse, PluginError> {
    let request: VolumeRequest = decode(&body)?;
    // Option values may carry passwords, so only the keys are logged
    let mut keys: Vec<&str> = request.opts.keys().map(String::as_str).collect();
    keys.sort_unstable();
    debug!(operation = "create", volume = %request.name, options = ?keys, "Create requested");
    registry.create(&request.name, &request.opts).await?;
    Ok(PluginResponse::success())
}

async fn remove(
    State(registry): RegistryState,
    body: Bytes,
) -> Result<PluginResponse, PluginError> {
    let request: VolumeRequest = decode(&body)?;
    debug!(operation = "remove", volume = %request.name, "Remove requested");
    registry.remove(&request.name).await?;
    Ok(PluginResponse::success())
}

async fn path(State(registry): RegistryState, body: Bytes) -> Result<PluginResponse, PluginError> {
    let request: VolumeRequest = decode(&body)?;
    let mountpoint = registry.path(&request.name).await?;
    Ok(PluginResponse::mountpoint(&mountpoint))
}

async fn get(State(registry): RegistryState, body: Bytes) -> Result<PluginResponse, PluginError> {
    let request: VolumeRequest = decode(&body)?;
    let info = registry.get(&request.name).await?;
    Ok(PluginResponse::volume(info))
}

async fn list(State(registry): RegistryState) -> PluginResponse {
    PluginResponse::volumes(registry.list().await)
}

async fn mount(
    State(registry): RegistryState,
    body: Bytes,
) -> Result<PluginResponse, PluginError> {
    let request: MountRequest = decode(&body)?;
    debug!(operation = "mount", volume = %request.name, caller = %request.id, "Mount requested");
    let mountpoint = registry.mount(&request.name).await?;
    Ok(PluginResponse::mountpoint(&mountpoint))
}

async fn unmount(
    State(registry): RegistryState,
    body: Bytes,
) -> Result<PluginResponse, PluginError> {
    let request: MountRequest = decode(&body)?;
    debug!(operation = "unmount", volume = %request.name, caller = %request.id, "Unmount requested");
    registry.unmount(&request.name).await?;
    Ok(PluginResponse::success())
}

async fn capabilities(State(registry): RegistryState) -> PluginResponse {
    PluginResponse::capabilities(registry.capabilities())
}
