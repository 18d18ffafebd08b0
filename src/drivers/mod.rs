//! Component B — Device Driver Set (spec.md §4.B).
//!
//! A driver models a capability set: it advertises which rotation `Method`s
//! it supports and implements `probe`, `query_external_ip` and `rotate`
//! against the real device-facing protocol (HiLink HTTP/XML, ADB shell,
//! AT commands over serial).

pub mod android;
pub mod hilink;
pub mod usb_serial;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DriverError;

/// One named rotation technique (spec.md §4.B's method table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    AirplaneToggle,
    DataToggle,
    HilinkDialup,
    HilinkReboot,
    HilinkModeswitch,
    UsbReauthorize,
    AtCfunCycle,
}

impl Method {
    /// (typical, upper_bound) duration budget, per spec.md §4.B.
    pub fn timeout_budget(&self) -> (Duration, Duration) {
        match self {
            Method::DataToggle => (Duration::from_secs(15), Duration::from_secs(30)),
            Method::AirplaneToggle => (Duration::from_secs(25), Duration::from_secs(60)),
            Method::HilinkDialup => (Duration::from_secs(15), Duration::from_secs(45)),
            Method::HilinkReboot => (Duration::from_secs(45), Duration::from_secs(120)),
            Method::HilinkModeswitch => (Duration::from_secs(50), Duration::from_secs(120)),
            Method::UsbReauthorize => (Duration::from_secs(15), Duration::from_secs(40)),
            Method::AtCfunCycle => (Duration::from_secs(20), Duration::from_secs(45)),
        }
    }

    pub fn upper_bound(&self) -> Duration {
        self.timeout_budget().1
    }

    /// Stable wire/config name, matching the `#[serde(rename_all =
    /// "snake_case")]` form used everywhere else this type is spelled out
    /// (config files, the persisted state file, control-API JSON).
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::AirplaneToggle => "airplane_toggle",
            Method::DataToggle => "data_toggle",
            Method::HilinkDialup => "hilink_dialup",
            Method::HilinkReboot => "hilink_reboot",
            Method::HilinkModeswitch => "hilink_modeswitch",
            Method::UsbReauthorize => "usb_reauthorize",
            Method::AtCfunCycle => "at_cfun_cycle",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Method> {
        Some(match s {
            "airplane_toggle" => Method::AirplaneToggle,
            "data_toggle" => Method::DataToggle,
            "hilink_dialup" => Method::HilinkDialup,
            "hilink_reboot" => Method::HilinkReboot,
            "hilink_modeswitch" => Method::HilinkModeswitch,
            "usb_reauthorize" => Method::UsbReauthorize,
            "at_cfun_cycle" => Method::AtCfunCycle,
            _ => return None,
        })
    }
}

/// Result of a `probe()` call (spec.md §4.B item 1).
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub up: bool,
    pub control_addr_reachable: bool,
    pub local_ip: Option<String>,
}

/// A concrete device driver. One instance is attached per `DeviceRecord` at
/// discovery time; the registry asks it for `supported_methods()` once, at
/// registration, per spec.md §9 "Dynamic dispatch to drivers".
#[async_trait]
pub trait Driver: Send + Sync {
    /// Rotation methods this driver advertises support for, in no
    /// particular order — the engine orders them via the device's
    /// `method_preference`.
    fn supported_methods(&self) -> &[Method];

    async fn probe(&self) -> Result<ProbeResult, DriverError>;

    /// Best-effort external IP lookup via the well-known echo endpoint,
    /// reached through the device's bound interface.
    async fn query_external_ip(&self, interface: &str) -> Result<Option<String>, DriverError>;

    async fn rotate(&self, method: Method) -> Result<(), DriverError>;
}

/// Write `0` then `1` to a device's sysfs `authorized` file (spec.md §6
/// "sysfs authorize"), shared by the HiLink and Android drivers since both
/// advertise `usb_reauthorize`.
pub(crate) async fn reauthorize_sysfs(sysfs_path: &str) -> Result<(), DriverError> {
    let path = format!("{}/authorized", sysfs_path);
    tokio::fs::write(&path, b"0")
        .await
        .map_err(|e| DriverError::DriverError(format!("write {} = 0: {}", path, e)))?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    tokio::fs::write(&path, b"1")
        .await
        .map_err(|e| DriverError::DriverError(format!("write {} = 1: {}", path, e)))?;
    Ok(())
}

/// Fetch a plaintext body from a well-known IP echo endpoint through the
/// given interface. Shared by every driver's `query_external_ip`.
pub(crate) async fn fetch_external_ip(
    interface: &str,
    echo_host: &str,
    echo_port: u16,
    echo_path: &str,
    timeout: Duration,
) -> Result<Option<String>, DriverError> {
    use crate::interface_binder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = interface_binder::connect(interface, echo_host, echo_port, timeout)
        .await
        .map_err(|_| DriverError::Unreachable)?;

    let req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        echo_path, echo_host
    );
    stream
        .write_all(req.as_bytes())
        .await
        .map_err(|e| DriverError::DriverError(e.to_string()))?;

    let mut buf = Vec::new();
    tokio::time::timeout(timeout, stream.read_to_end(&mut buf))
        .await
        .map_err(|_| DriverError::TimedOut)?
        .map_err(|e| DriverError::DriverError(e.to_string()))?;

    let text = String::from_utf8_lossy(&buf);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or("").trim();
    if body.is_empty() {
        Ok(None)
    } else {
        Ok(Some(body.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_upper_bounds_match_spec_table() {
        assert_eq!(Method::DataToggle.upper_bound(), Duration::from_secs(30));
        assert_eq!(Method::AirplaneToggle.upper_bound(), Duration::from_secs(60));
        assert_eq!(Method::HilinkReboot.upper_bound(), Duration::from_secs(120));
        assert_eq!(Method::HilinkModeswitch.upper_bound(), Duration::from_secs(120));
        assert_eq!(Method::AtCfunCycle.upper_bound(), Duration::from_secs(45));
    }
}
