//! Shared error taxonomy (kinds, not types, per the design) used across the
//! registry, rotation engine, dispatcher and dataplane.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors surfaced at the component boundaries documented in the error
/// handling design: proxy requests map these to HTTP statuses, the control
/// API returns them as error bodies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no device available in shared pool")]
    NoDeviceAvailable,

    #[error("device {0} is busy rotating")]
    DeviceBusy(String),

    #[error("device {0} is offline")]
    DeviceOffline(String),

    #[error("proxy authorization required")]
    AuthRequired,

    #[error("proxy authorization rejected")]
    AuthBad,

    #[error("failed to bind to interface {0}: {1}")]
    BindFailed(String, String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("upstream connect timed out")]
    UpstreamTimeout,

    #[error("rotation already in progress for device {0}")]
    RotationBusy(String),

    #[error("method {0} not supported by device {1}")]
    DriverUnsupported(String, String),

    #[error("driver error: {0}")]
    DriverError(String),

    #[error("driver call timed out")]
    TimedOut,

    #[error("device unreachable")]
    Unreachable,

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("no such device: {0}")]
    UnknownDevice(String),

    #[error("device {0} already has a dedicated port")]
    AlreadyDedicated(String),
}

impl GatewayError {
    /// HTTP status the proxy dataplane uses when this error escapes to the
    /// client boundary (spec.md §7).
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoDeviceAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DeviceBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DeviceOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AuthRequired | GatewayError::AuthBad => {
                StatusCode::PROXY_AUTHENTICATION_REQUIRED
            }
            GatewayError::BindFailed(_, _) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamConnectFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Classification of a single driver call outcome (spec.md §4.D
/// "Failure semantics"). Only `Unreachable` is allowed to flip a device
/// offline; the rest are counted but otherwise inert.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver call timed out")]
    TimedOut,
    #[error("driver error: {0}")]
    DriverError(String),
    #[error("device unreachable")]
    Unreachable,
    #[error("method not supported")]
    Unsupported,
}

impl From<DriverError> for GatewayError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::TimedOut => GatewayError::TimedOut,
            DriverError::DriverError(s) => GatewayError::DriverError(s),
            DriverError::Unreachable => GatewayError::Unreachable,
            DriverError::Unsupported => GatewayError::DriverError("unsupported".into()),
        }
    }
}

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
