//! Process configuration (`[FULL]` §4.J): one `AppConfig`, layered from a
//! TOML file over built-in defaults via the `config` crate, hot-patchable
//! in place through the control API the same way the teacher patches its
//! own config file.

use serde::{Deserialize, Serialize};
use simplelog::*;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use toml_edit::{value, DocumentMut};

use crate::drivers::Method;

pub type SharedConfig = Arc<RwLock<AppConfig>>;

fn default_proxy_port() -> u16 {
    8080
}
fn default_api_port() -> u16 {
    8000
}
fn default_dedicated_port_range() -> (u16, u16) {
    (9000, 9099)
}
fn default_rotation_interval() -> u64 {
    600
}
fn default_max_devices() -> u32 {
    32
}
fn default_max_rpm() -> u32 {
    100
}
fn default_max_parallel_rotations() -> u32 {
    4
}
fn default_discovery_interval() -> u64 {
    10
}
fn default_health_interval() -> u64 {
    30
}
fn default_grace_scans() -> u32 {
    3
}
fn default_ip_refresh() -> u64 {
    300
}
fn default_post_rotation_delay() -> u64 {
    5
}
fn default_verify_attempts() -> u32 {
    5
}
fn default_verify_backoff() -> u64 {
    3
}
fn default_on_same_ip() -> OnSameIp {
    OnSameIp::Accept
}
fn default_busy_wait_secs() -> u64 {
    10
}
fn default_selection_strategy() -> SelectionStrategy {
    SelectionStrategy::LeastLoaded
}
fn default_connect_timeout() -> u16 {
    10
}
fn default_tunnel_idle_timeout() -> u64 {
    120
}
fn default_copy_buffer_bytes() -> usize {
    32 * 1024
}
fn default_state_file() -> PathBuf {
    "/etc/mobile-ip-gateway/devices.toml".into()
}
fn default_logfile() -> PathBuf {
    "/var/log/mobile-ip-gateway.log".into()
}
fn default_serial_glob() -> String {
    "/dev/ttyUSB*".to_string()
}
fn webserver_default_bind() -> Option<String> {
    Some("0.0.0.0:8000".into())
}

/// spec.md §4.E "on repeated same-IP rotations": either keep retrying up to
/// `verify_attempts` (`advance`) or settle for the unchanged address once
/// attempts are exhausted (`accept`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSameIp {
    Advance,
    Accept,
}

/// spec.md §4.E "shared-pool selection": which strategy the dispatcher
/// applies when a request arrives on the shared proxy port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
    StickyClient,
}

/// One upper-bound timeout per rotation method named in spec.md §4.B's
/// table, overridable independently of the driver's compiled-in defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MethodTimeouts {
    pub data_toggle_secs: u64,
    pub airplane_toggle_secs: u64,
    pub hilink_dialup_secs: u64,
    pub hilink_reboot_secs: u64,
    pub hilink_modeswitch_secs: u64,
    pub usb_reauthorize_secs: u64,
    pub at_cfun_cycle_secs: u64,
}

impl Default for MethodTimeouts {
    fn default() -> Self {
        MethodTimeouts {
            data_toggle_secs: Method::DataToggle.upper_bound().as_secs(),
            airplane_toggle_secs: Method::AirplaneToggle.upper_bound().as_secs(),
            hilink_dialup_secs: Method::HilinkDialup.upper_bound().as_secs(),
            hilink_reboot_secs: Method::HilinkReboot.upper_bound().as_secs(),
            hilink_modeswitch_secs: Method::HilinkModeswitch.upper_bound().as_secs(),
            usb_reauthorize_secs: Method::UsbReauthorize.upper_bound().as_secs(),
            at_cfun_cycle_secs: Method::AtCfunCycle.upper_bound().as_secs(),
        }
    }
}

impl MethodTimeouts {
    pub fn upper_bound(&self, method: Method) -> std::time::Duration {
        let secs = match method {
            Method::DataToggle => self.data_toggle_secs,
            Method::AirplaneToggle => self.airplane_toggle_secs,
            Method::HilinkDialup => self.hilink_dialup_secs,
            Method::HilinkReboot => self.hilink_reboot_secs,
            Method::HilinkModeswitch => self.hilink_modeswitch_secs,
            Method::UsbReauthorize => self.usb_reauthorize_secs,
            Method::AtCfunCycle => self.at_cfun_cycle_secs,
        };
        std::time::Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_dedicated_port_range")]
    pub dedicated_port_range: (u16, u16),
    #[serde(default = "default_rotation_interval")]
    pub default_rotation_interval_secs: u64,
    #[serde(default = "default_max_devices")]
    pub max_devices: u32,
    #[serde(default = "default_max_rpm")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_max_parallel_rotations")]
    pub max_parallel_rotations: u32,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_grace_scans")]
    pub grace_scans: u32,
    #[serde(default = "default_ip_refresh")]
    pub ip_refresh_secs: u64,
    #[serde(default = "default_post_rotation_delay")]
    pub post_rotation_delay_secs: u64,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_backoff")]
    pub verify_backoff_secs: u64,
    #[serde(default = "default_on_same_ip")]
    pub on_same_ip: OnSameIp,
    #[serde(default = "default_busy_wait_secs")]
    pub busy_wait_secs: u64,
    #[serde(default = "default_selection_strategy")]
    pub selection_strategy: SelectionStrategy,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u16,
    #[serde(default = "default_tunnel_idle_timeout")]
    pub tunnel_idle_timeout_secs: u64,
    #[serde(default = "default_copy_buffer_bytes")]
    pub copy_buffer_bytes: usize,
    #[serde(default)]
    pub method_timeouts: MethodTimeouts,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_logfile")]
    pub logfile: PathBuf,
    pub debug: bool,
    pub disable_console_debug: bool,
    #[serde(default = "webserver_default_bind")]
    pub webserver: Option<String>,

    /// `[FULL]`: operator-supplied device_id -> kernel network interface
    /// name mapping. Correlating a USB device to its udev-assigned
    /// interface is OS setup spec.md §1 treats as preconfigured, so the
    /// registry relies on this table rather than inferring it.
    #[serde(default)]
    pub interface_overrides: HashMap<String, String>,
    /// `[FULL]`: device_id -> HiLink management-API gateway IP, for
    /// devices that don't use the 192.168.8.1 factory default.
    #[serde(default)]
    pub hilink_gateway_overrides: HashMap<String, String>,
    /// `[FULL]`: device_id -> sysfs device path, for `usb_reauthorize`.
    #[serde(default)]
    pub sysfs_path_overrides: HashMap<String, String>,
    /// `[FULL]`: glob pattern the registry scans for bare AT-command
    /// modems during discovery.
    #[serde(default = "default_serial_glob")]
    pub serial_glob: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            api_port: default_api_port(),
            dedicated_port_range: default_dedicated_port_range(),
            default_rotation_interval_secs: default_rotation_interval(),
            max_devices: default_max_devices(),
            max_requests_per_minute: default_max_rpm(),
            max_parallel_rotations: default_max_parallel_rotations(),
            discovery_interval_secs: default_discovery_interval(),
            health_interval_secs: default_health_interval(),
            grace_scans: default_grace_scans(),
            ip_refresh_secs: default_ip_refresh(),
            post_rotation_delay_secs: default_post_rotation_delay(),
            verify_attempts: default_verify_attempts(),
            verify_backoff_secs: default_verify_backoff(),
            on_same_ip: default_on_same_ip(),
            busy_wait_secs: default_busy_wait_secs(),
            selection_strategy: default_selection_strategy(),
            connect_timeout_secs: default_connect_timeout(),
            tunnel_idle_timeout_secs: default_tunnel_idle_timeout(),
            copy_buffer_bytes: default_copy_buffer_bytes(),
            method_timeouts: MethodTimeouts::default(),
            state_file: default_state_file(),
            logfile: default_logfile(),
            debug: false,
            disable_console_debug: false,
            webserver: webserver_default_bind(),
            interface_overrides: HashMap::new(),
            hilink_gateway_overrides: HashMap::new(),
            sysfs_path_overrides: HashMap::new(),
            serial_glob: default_serial_glob(),
        }
    }
}

impl AppConfig {
    pub fn load(config_file: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::File;
        let file_config: AppConfig = ::config::Config::builder()
            .add_source(File::from(config_file).required(false))
            .build()?
            .try_deserialize()
            .unwrap_or_default();

        Ok(file_config)
    }

    /// Patch the on-disk config file in place, preserving comments/layout
    /// for anything this process doesn't itself manage — the same
    /// read-parse-patch-write idiom the teacher's `AppConfig::save` uses.
    pub fn save(&self, config_file: PathBuf) {
        debug!("Saving config: {:?}", self);
        let raw = fs::read_to_string(&config_file).unwrap_or_default();
        let mut doc = raw.parse::<DocumentMut>().unwrap_or_else(|_| DocumentMut::new());

        doc["proxy_port"] = value(self.proxy_port as i64);
        doc["api_port"] = value(self.api_port as i64);
        doc["default_rotation_interval_secs"] = value(self.default_rotation_interval_secs as i64);
        doc["max_devices"] = value(self.max_devices as i64);
        doc["max_requests_per_minute"] = value(self.max_requests_per_minute as i64);
        doc["max_parallel_rotations"] = value(self.max_parallel_rotations as i64);
        doc["discovery_interval_secs"] = value(self.discovery_interval_secs as i64);
        doc["health_interval_secs"] = value(self.health_interval_secs as i64);
        doc["grace_scans"] = value(self.grace_scans as i64);
        doc["ip_refresh_secs"] = value(self.ip_refresh_secs as i64);
        doc["post_rotation_delay_secs"] = value(self.post_rotation_delay_secs as i64);
        doc["verify_attempts"] = value(self.verify_attempts as i64);
        doc["verify_backoff_secs"] = value(self.verify_backoff_secs as i64);
        doc["on_same_ip"] = value(match self.on_same_ip {
            OnSameIp::Advance => "advance",
            OnSameIp::Accept => "accept",
        });
        doc["busy_wait_secs"] = value(self.busy_wait_secs as i64);
        doc["selection_strategy"] = value(match self.selection_strategy {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastLoaded => "least_loaded",
            SelectionStrategy::Random => "random",
            SelectionStrategy::StickyClient => "sticky_client",
        });
        doc["connect_timeout_secs"] = value(self.connect_timeout_secs as i64);
        doc["tunnel_idle_timeout_secs"] = value(self.tunnel_idle_timeout_secs as i64);
        doc["copy_buffer_bytes"] = value(self.copy_buffer_bytes as i64);
        doc["state_file"] = value(self.state_file.display().to_string());
        doc["logfile"] = value(self.logfile.display().to_string());
        doc["debug"] = value(self.debug);
        doc["disable_console_debug"] = value(self.disable_console_debug);
        if let Some(webserver) = &self.webserver {
            doc["webserver"] = value(webserver);
        }
        doc["serial_glob"] = value(&self.serial_glob);

        let _ = fs::write(config_file, doc.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_method_timeout() {
        let cfg = AppConfig::default();
        for method in [
            Method::DataToggle,
            Method::AirplaneToggle,
            Method::HilinkDialup,
            Method::HilinkReboot,
            Method::HilinkModeswitch,
            Method::UsbReauthorize,
            Method::AtCfunCycle,
        ] {
            assert_eq!(cfg.method_timeouts.upper_bound(method), method.upper_bound());
        }
    }

    #[test]
    fn dedicated_port_range_is_non_empty() {
        let cfg = AppConfig::default();
        assert!(cfg.dedicated_port_range.0 < cfg.dedicated_port_range.1);
    }
}
