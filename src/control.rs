//! Component G — Control Surface (spec.md §4.G, §6 "Control API").
//!
//! A small axum router, the same stack the teacher's `web::app` uses for
//! its own admin surface, exposing the operations the (out-of-scope) admin
//! UI calls: list/get devices, force/test rotation, rotation-config
//! updates, dedicated-port lifecycle, and an on-demand discovery pass.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SharedConfig;
use crate::device::{DeviceRecord, RotationConfig};
use crate::dispatcher::SharedDispatcher;
use crate::drivers::Method;
use crate::error::GatewayError;
use crate::proxy;
use crate::registry::SharedRegistry;
use crate::rotation::{RotationOutcome, SharedRotationEngine};

const NAME: &str = "<i><bright-black> control: </>";

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub engine: SharedRotationEngine,
    pub dispatcher: SharedDispatcher,
    pub config: SharedConfig,
    /// live dedicated-port listener tasks, keyed by port, so
    /// `create_dedicated`/`remove_dedicated` can actually bind/unbind a
    /// socket at runtime instead of only updating registry state.
    dedicated_listeners: Arc<Mutex<HashMap<u16, JoinHandle<()>>>>,
}

impl AppState {
    pub fn new(
        registry: SharedRegistry,
        engine: SharedRotationEngine,
        dispatcher: SharedDispatcher,
        config: SharedConfig,
    ) -> Self {
        AppState {
            registry,
            engine,
            dispatcher,
            config,
            dedicated_listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds and spawns a dedicated-port listener for `port`, aborting
    /// whatever was previously bound there (should only happen when
    /// restoring persisted state at startup, since `create_dedicated`
    /// rejects an in-use port before this is ever called).
    pub async fn spawn_dedicated_listener(&self, port: u16) {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                proxy::run_dedicated(bind_addr, port, dispatcher, registry, config).await
            {
                error!("{} dedicated listener on port {} exited: {}", NAME, port, e);
            }
        });
        if let Some(old) = self.dedicated_listeners.lock().await.insert(port, handle) {
            old.abort();
        }
    }

    /// Tears down the listener bound to `port`, if any.
    pub async fn stop_dedicated_listener(&self, port: u16) {
        if let Some(handle) = self.dedicated_listeners.lock().await.remove(&port) {
            handle.abort();
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/:id", get(get_device))
        .route("/devices/:id/rotate", post(rotate))
        .route("/devices/:id/test-rotation", post(test_rotation))
        .route("/devices/:id/rotation-config", put(set_rotation_config))
        .route("/dedicated/:id", post(create_dedicated))
        .route("/dedicated/:id", delete(remove_dedicated))
        .route("/discover", post(discover))
        .with_state(state)
}

/// Wraps `GatewayError` so it can be returned straight from an axum
/// handler, mapping onto the HTTP status the error taxonomy specifies
/// (spec.md §7). Control-API errors carry a JSON body rather than the bare
/// status the proxy dataplane uses.
struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceRecord>> {
    Json(state.registry.list().await)
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceRecord>, ApiError> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| GatewayError::UnknownDevice(id).into())
}

#[derive(Debug, Deserialize)]
pub struct RotateRequest {
    pub method: Option<Method>,
}

#[derive(Debug, Serialize)]
pub struct RotateResponse {
    pub outcome: String,
    pub ip_before: Option<String>,
    pub ip_after: Option<String>,
    pub method_used: Option<Method>,
    pub attempts: u32,
}

impl From<RotationOutcome> for RotateResponse {
    fn from(o: RotationOutcome) -> Self {
        RotateResponse {
            outcome: if o.ok { "ok".to_string() } else { "failed".to_string() },
            ip_before: o.ip_before,
            ip_after: o.ip_after,
            method_used: o.method_used,
            attempts: o.attempts,
        }
    }
}

/// `POST /devices/{id}/rotate` (spec.md §4.G `force_rotate`): blocks until
/// the engine returns a terminal outcome.
async fn rotate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RotateRequest>,
) -> Result<Json<RotateResponse>, ApiError> {
    info!("{} ⚙️ force_rotate requested for {}", NAME, id);
    let outcome = state.engine.force_rotate(&id, req.method).await?;
    Ok(Json(outcome.into()))
}

/// `POST /devices/{id}/test-rotation` (spec.md §4.G `test_rotation`): same
/// mechanics as `rotate`, but never touches the `auto` schedule.
async fn test_rotation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RotateRequest>,
) -> Result<Json<RotateResponse>, ApiError> {
    let outcome = state.engine.test_rotation(&id, req.method).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
pub struct RotationConfigRequest {
    pub interval_seconds: u64,
    pub auto: bool,
    pub method_preference: Vec<Method>,
}

async fn set_rotation_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RotationConfigRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .set_rotation_config(
            &id,
            RotationConfig {
                interval_seconds: req.interval_seconds,
                auto: req.auto,
                method_preference: req.method_preference,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateDedicatedRequest {
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateDedicatedResponse {
    pub listen_port: u16,
    pub username: Option<String>,
}

/// `POST /dedicated/{id}` (spec.md §4.G `create_dedicated`): fails if the
/// port is in use or the device already has a dedicated binding.
async fn create_dedicated(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateDedicatedRequest>,
) -> Result<Json<CreateDedicatedResponse>, ApiError> {
    let port_range = state.config.read().await.dedicated_port_range;
    let credentials = match (&req.username, &req.password) {
        (Some(u), Some(p)) => Some((u.clone(), p.clone())),
        _ => None,
    };
    let binding = state
        .registry
        .create_dedicated(&id, req.port, credentials, port_range)
        .await?;
    state.spawn_dedicated_listener(binding.listen_port).await;

    Ok(Json(CreateDedicatedResponse {
        listen_port: binding.listen_port,
        username: binding.username,
    }))
}

async fn remove_dedicated(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if let Some(port) = state.registry.remove_dedicated(&id).await? {
        state.stop_dedicated_listener(port).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /discover` (spec.md §4.G `discover()`): triggers one synchronous
/// discovery pass rather than waiting for the background loop's next tick.
async fn discover(State(state): State<Arc<AppState>>) -> StatusCode {
    state.registry.discover_once().await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::dispatcher::Dispatcher;
    use crate::registry::DeviceRegistry;
    use crate::rotation::RotationEngine;
    use tokio::sync::RwLock;

    fn test_state() -> Arc<AppState> {
        let config: SharedConfig = Arc::new(RwLock::new(AppConfig::default()));
        let registry = DeviceRegistry::new(config.clone());
        let engine = RotationEngine::spawn(registry.clone(), config.clone());
        let dispatcher = Dispatcher::new(registry.clone(), config.clone());
        Arc::new(AppState::new(registry, engine, dispatcher, config))
    }

    #[tokio::test]
    async fn get_unknown_device_is_an_error_response() {
        let state = test_state();
        let result = get_device(State(state), Path("ghost".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_devices_starts_empty() {
        let state = test_state();
        let Json(devices) = list_devices(State(state)).await;
        assert!(devices.is_empty());
    }
}
