//! Component C — Device Registry (spec.md §4.C, §3 "In-memory tables").

use chrono::Utc;
use indexmap::IndexMap;
use simplelog::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::RwLock;
use toml_edit::{value, Array, DocumentMut, Item, Table};

use crate::config::SharedConfig;
use crate::device::{
    Counters, DedicatedBinding, DeviceKind, DeviceRecord, DeviceStatus, RateWindow, RotationConfig,
};
use crate::drivers::android::AndroidDriver;
use crate::drivers::hilink::HilinkDriver;
use crate::drivers::usb_serial::UsbSerialDriver;
use crate::drivers::{Driver, Method};
use crate::error::GatewayError;

const NAME: &str = "<i><bright-black> registry: </>";

/// Well-known HiLink-capable vendor:product pairs (Huawei router-mode
/// modems). Devices in mass-storage mode present different PIDs and are
/// switched by `usb_modeswitch`; this table lists only the post-switch,
/// router-mode IDs the registry should attach a `HilinkDriver` to.
const HILINK_VID_PIDS: &[(u16, u16)] = &[
    (0x12d1, 0x1506), // Huawei E3372/E8372 family, HiLink mode
    (0x12d1, 0x14db),
    (0x12d1, 0x1f01),
];

pub struct DeviceEntry {
    pub record: DeviceRecord,
    pub driver: Arc<dyn Driver>,
    pub rate_window: RateWindow,
}

#[derive(Default)]
struct Tables {
    by_id: IndexMap<String, DeviceEntry>,
    by_port: HashMap<u16, String>,
}

/// spec.md §3.1 "Persistence format": the dedicated-port binding and
/// rotation config a device_id had before the last restart, re-applied to
/// the fresh `DeviceRecord` discovery builds once that device reappears.
#[derive(Debug, Clone, Default)]
struct PersistedDeviceState {
    rotation_config: Option<RotationConfig>,
    dedicated: Option<DedicatedBinding>,
}

pub struct DeviceRegistry {
    tables: RwLock<Tables>,
    config: SharedConfig,
    persisted: RwLock<HashMap<String, PersistedDeviceState>>,
}

pub type SharedRegistry = Arc<DeviceRegistry>;

impl DeviceRegistry {
    pub fn new(config: SharedConfig) -> SharedRegistry {
        Arc::new(DeviceRegistry {
            tables: RwLock::new(Tables::default()),
            config,
            persisted: RwLock::new(HashMap::new()),
        })
    }

    /// Load the on-disk state file once at startup (spec.md §3.1). A
    /// missing or unparsable file just means nothing is restored — every
    /// rediscovered device starts with its driver's default preference.
    pub async fn load_state(&self) {
        let path = self.config.read().await.state_file.clone();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(_) => return,
        };
        let doc = match raw.parse::<DocumentMut>() {
            Ok(d) => d,
            Err(e) => {
                warn!("{} state file {} is not valid TOML: {}", NAME, path.display(), e);
                return;
            }
        };
        let Some(devices) = doc.get("devices").and_then(|i| i.as_table()) else {
            return;
        };

        let mut persisted = self.persisted.write().await;
        for (id, entry) in devices.iter() {
            let Some(tbl) = entry.as_table() else { continue };
            let mut state = PersistedDeviceState::default();

            if let Some(auto) = tbl.get("auto").and_then(|v| v.as_bool()) {
                let interval = tbl
                    .get("interval_seconds")
                    .and_then(|v| v.as_integer())
                    .unwrap_or(0) as u64;
                let method_preference = tbl
                    .get("method_preference")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().and_then(Method::from_str_name))
                            .collect()
                    })
                    .unwrap_or_default();
                state.rotation_config = Some(RotationConfig {
                    interval_seconds: interval,
                    auto,
                    method_preference,
                });
            }

            if let Some(ded) = tbl.get("dedicated").and_then(|v| v.as_table()) {
                if let Some(port) = ded.get("listen_port").and_then(|v| v.as_integer()) {
                    state.dedicated = Some(DedicatedBinding {
                        listen_port: port as u16,
                        username: ded.get("username").and_then(|v| v.as_str()).map(String::from),
                        password_hash: ded
                            .get("password_hash")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                    });
                }
            }

            persisted.insert(id.clone(), state);
        }
        info!(
            "{} 💾 loaded persisted state for {} device(s) from {}",
            NAME,
            persisted.len(),
            path.display()
        );
    }

    /// Patch the state file in place, read-parse-patch-write like
    /// `AppConfig::save` (spec.md §3.1).
    async fn persist(&self) {
        let path = self.config.read().await.state_file.clone();
        let raw = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        let mut doc = raw.parse::<DocumentMut>().unwrap_or_else(|_| DocumentMut::new());
        if doc.get("devices").is_none() {
            doc["devices"] = Item::Table(Table::new());
        }

        let tables = self.tables.read().await;
        let devices_table = doc["devices"].as_table_mut().expect("just inserted as a table");
        for (id, entry) in tables.by_id.iter() {
            let mut tbl = Table::new();
            tbl["interval_seconds"] = value(entry.record.rotation_config.interval_seconds as i64);
            tbl["auto"] = value(entry.record.rotation_config.auto);

            let mut prefs = Array::new();
            for method in &entry.record.rotation_config.method_preference {
                prefs.push(method.as_str());
            }
            tbl["method_preference"] = value(prefs);

            if let Some(binding) = &entry.record.dedicated {
                let mut ded = Table::new();
                ded["listen_port"] = value(binding.listen_port as i64);
                if let Some(u) = &binding.username {
                    ded["username"] = value(u.clone());
                }
                if let Some(h) = &binding.password_hash {
                    ded["password_hash"] = value(h.clone());
                }
                tbl["dedicated"] = Item::Table(ded);
            }

            devices_table[id] = Item::Table(tbl);
        }
        drop(tables);

        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&path, doc.to_string()).await {
            warn!("{} failed to persist state to {}: {}", NAME, path.display(), e);
        }
    }

    pub async fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.tables.read().await.by_id.get(id).map(|e| e.record.clone())
    }

    pub async fn list(&self) -> Vec<DeviceRecord> {
        self.tables
            .read()
            .await
            .by_id
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub async fn driver_for(&self, id: &str) -> Option<Arc<dyn Driver>> {
        self.tables.read().await.by_id.get(id).map(|e| e.driver.clone())
    }

    pub async fn device_for_port(&self, port: u16) -> Option<String> {
        self.tables.read().await.by_port.get(&port).cloned()
    }

    /// The subset of devices eligible for shared-pool selection (spec.md §3
    /// "ready_queue"): status == online. The per-minute admission cap is
    /// evaluated separately by the dispatcher via `admission_check`.
    pub async fn ready_queue(&self) -> Vec<DeviceRecord> {
        self.tables
            .read()
            .await
            .by_id
            .values()
            .filter(|e| e.record.eligible_for_pool())
            .map(|e| e.record.clone())
            .collect()
    }

    pub async fn admission_check(&self, id: &str, max_rpm: u32, now: Instant) -> bool {
        let mut tables = self.tables.write().await;
        match tables.by_id.get_mut(id) {
            Some(entry) => entry.rate_window.record_and_count(now) <= max_rpm as usize,
            None => false,
        }
    }

    /// Like `admission_check`, but only peeks the trailing-minute count
    /// without recording a hit. Used to filter a pool of candidates down to
    /// the admissible ones before a selection strategy picks exactly one —
    /// only the chosen device's hit should actually be recorded.
    pub async fn admission_peek(&self, id: &str, max_rpm: u32, now: Instant) -> bool {
        let mut tables = self.tables.write().await;
        match tables.by_id.get_mut(id) {
            Some(entry) => entry.rate_window.count(now) <= max_rpm as usize,
            None => false,
        }
    }

    /// Mark a request as in flight on `id` (spec.md §4.E "least_loaded: ...
    /// in-flight count"). Paired with `end_request` around a proxy session.
    pub async fn begin_request(&self, id: &str) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.in_flight = entry.record.in_flight.saturating_add(1);
        }
    }

    pub async fn end_request(&self, id: &str) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.in_flight = entry.record.in_flight.saturating_sub(1);
        }
    }

    pub async fn record_request(
        &self,
        id: &str,
        ok: bool,
        bytes_in: u64,
        bytes_out: u64,
        latency_ms: f64,
    ) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.counters.record(ok, bytes_in, bytes_out, latency_ms);
        }
    }

    /// Transition a device into `busy` and capture `ip_before`, rejecting
    /// the call with `RotationBusy` if a rotation is already in flight
    /// (spec.md §3 invariant: at most one rotation per device).
    pub async fn begin_rotation(&self, id: &str) -> Result<Option<String>, GatewayError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .by_id
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownDevice(id.to_string()))?;
        if entry.record.status == DeviceStatus::Busy {
            return Err(GatewayError::RotationBusy(id.to_string()));
        }
        if entry.record.status == DeviceStatus::Disabled {
            return Err(GatewayError::DeviceOffline(id.to_string()));
        }
        let ip_before = entry.record.external_ip.clone();
        entry.record.status = DeviceStatus::Busy;
        Ok(ip_before)
    }

    pub async fn end_rotation(
        &self,
        id: &str,
        ok: bool,
        new_ip: Option<String>,
        still_reachable: bool,
    ) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.last_rotation_at = Some(Utc::now());
            entry.record.last_rotation_ok = Some(ok);
            if let Some(ip) = new_ip {
                entry.record.observe_external_ip(ip, Utc::now());
            }
            entry.record.status = if still_reachable {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            };
        }
    }

    pub async fn set_status(&self, id: &str, status: DeviceStatus) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.status = status;
        }
    }

    pub async fn observe_external_ip(&self, id: &str, ip: String) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.observe_external_ip(ip, Utc::now());
        }
    }

    pub async fn set_rotation_config(
        &self,
        id: &str,
        cfg: RotationConfig,
    ) -> Result<(), GatewayError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .by_id
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownDevice(id.to_string()))?;
        entry.record.rotation_config = cfg;
        drop(tables);
        self.persist().await;
        Ok(())
    }

    pub async fn create_dedicated(
        &self,
        id: &str,
        requested_port: Option<u16>,
        credentials: Option<(String, String)>,
        port_range: (u16, u16),
    ) -> Result<DedicatedBinding, GatewayError> {
        let mut tables = self.tables.write().await;
        if !tables.by_id.contains_key(id) {
            return Err(GatewayError::UnknownDevice(id.to_string()));
        }
        if tables.by_id[id].record.dedicated.is_some() {
            return Err(GatewayError::AlreadyDedicated(id.to_string()));
        }

        let port = match requested_port {
            Some(p) => {
                if tables.by_port.contains_key(&p) {
                    return Err(GatewayError::PortInUse(p));
                }
                p
            }
            None => {
                let free = (port_range.0..=port_range.1)
                    .find(|p| !tables.by_port.contains_key(p))
                    .ok_or_else(|| GatewayError::PortInUse(port_range.1))?;
                free
            }
        };

        let password_hash = credentials.as_ref().map(|(_, pass)| hash_password(pass));
        let username = credentials.map(|(user, _)| user);

        let binding = DedicatedBinding {
            listen_port: port,
            username,
            password_hash,
        };

        tables.by_port.insert(port, id.to_string());
        tables.by_id.get_mut(id).unwrap().record.dedicated = Some(binding.clone());
        drop(tables);
        self.persist().await;

        Ok(binding)
    }

    /// Returns the port that was freed, if the device had a binding, so the
    /// caller can tear down the listener actually bound to it.
    pub async fn remove_dedicated(&self, id: &str) -> Result<Option<u16>, GatewayError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .by_id
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownDevice(id.to_string()))?;
        let freed = entry.record.dedicated.take();
        if let Some(binding) = &freed {
            tables.by_port.remove(&binding.listen_port);
        }
        drop(tables);
        self.persist().await;
        Ok(freed.map(|b| b.listen_port))
    }

    /// One synchronous discovery pass (spec.md §4.C "Discovery loop" and
    /// §4.G "discover()").
    pub async fn discover_once(&self) {
        let config = self.config.read().await.clone();
        let mut found_ids = Vec::new();

        for (id, kind, control_addr, driver) in discover_usb_hilink(&config).await {
            found_ids.push(id.clone());
            self.upsert(id, kind, control_addr, driver, &config).await;
        }
        for (id, kind, control_addr, driver) in discover_android(&config).await {
            found_ids.push(id.clone());
            self.upsert(id, kind, control_addr, driver, &config).await;
        }
        for (id, kind, control_addr, driver) in discover_usb_serial(&config).await {
            found_ids.push(id.clone());
            self.upsert(id, kind, control_addr, driver, &config).await;
        }

        self.reap_absent(&found_ids, config.grace_scans).await;
    }

    async fn upsert(
        &self,
        id: String,
        kind: DeviceKind,
        control_addr: String,
        driver: Arc<dyn Driver>,
        config: &crate::config::AppConfig,
    ) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(&id) {
            entry.record.absence_count = 0;
            return;
        }
        if tables.by_id.len() >= config.max_devices as usize {
            warn!(
                "{} 🚫 ignoring newly discovered device {} — at max_devices cap ({})",
                NAME, id, config.max_devices
            );
            return;
        }

        let interface = config
            .interface_overrides
            .get(&id)
            .cloned()
            .unwrap_or_default();

        let mut record = DeviceRecord::new(id.clone(), kind, interface, control_addr);
        record.rotation_config = RotationConfig {
            interval_seconds: config.default_rotation_interval_secs,
            auto: false,
            method_preference: driver.supported_methods().to_vec(),
        };

        if let Some(state) = self.persisted.read().await.get(&id) {
            if let Some(cfg) = &state.rotation_config {
                record.rotation_config = cfg.clone();
            }
            if let Some(binding) = &state.dedicated {
                if !tables.by_port.contains_key(&binding.listen_port) {
                    tables.by_port.insert(binding.listen_port, id.clone());
                    record.dedicated = Some(binding.clone());
                }
            }
        }

        info!("{} 📡 discovered new device: {}", NAME, id);
        tables.by_id.insert(
            id,
            DeviceEntry {
                record,
                driver,
                rate_window: RateWindow::default(),
            },
        );
    }

    async fn reap_absent(&self, found_ids: &[String], grace_scans: u32) {
        let mut tables = self.tables.write().await;
        let mut to_remove = Vec::new();
        for (id, entry) in tables.by_id.iter_mut() {
            if found_ids.contains(id) {
                continue;
            }
            entry.record.absence_count += 1;
            if entry.record.absence_count > grace_scans {
                entry.record.status = DeviceStatus::Offline;
            }
            // spec.md §3 "Destroyed": removed once absent well past grace —
            // resolved in DESIGN.md as 2x the grace window.
            if entry.record.absence_count > grace_scans * 2 {
                to_remove.push(id.clone());
            }
        }
        for id in to_remove {
            warn!("{} 📴 removing absent device: {}", NAME, id);
            if let Some(entry) = tables.by_id.remove(&id) {
                if let Some(binding) = entry.record.dedicated {
                    tables.by_port.remove(&binding.listen_port);
                }
            }
        }
    }

    pub async fn discovery_loop(self: Arc<Self>, interval_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            self.discover_once().await;
        }
    }

    /// spec.md §4.C "Health loop": probe each device; two consecutive
    /// failures flip it offline, a success flips it back online and
    /// refreshes a stale external IP.
    pub async fn health_loop(self: Arc<Self>, interval_secs: u64, ip_refresh_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let snapshot: Vec<(String, Arc<dyn Driver>, String)> = {
                let tables = self.tables.read().await;
                tables
                    .by_id
                    .iter()
                    .filter(|(_, e)| e.record.status != DeviceStatus::Busy)
                    .map(|(id, e)| (id.clone(), e.driver.clone(), e.record.interface.clone()))
                    .collect()
            };

            for (id, driver, interface) in snapshot {
                match driver.probe().await {
                    Ok(probe) if probe.up && probe.control_addr_reachable => {
                        self.on_probe_success(&id, probe.local_ip).await;
                        let stale = {
                            let tables = self.tables.read().await;
                            tables
                                .by_id
                                .get(&id)
                                .and_then(|e| e.record.external_ip_observed_at)
                                .map(|t| {
                                    (Utc::now() - t).num_seconds() as u64 > ip_refresh_secs
                                })
                                .unwrap_or(true)
                        };
                        if stale && !interface.is_empty() {
                            if let Ok(Some(ip)) = driver.query_external_ip(&interface).await {
                                self.observe_external_ip(&id, ip).await;
                            }
                        }
                    }
                    // `probe()` never returns `Err` in practice (every driver
                    // encodes reachability in `ProbeResult`), but a future
                    // driver might — treat it the same as `up: false`.
                    Ok(_) | Err(_) => self.on_probe_failure(&id).await,
                }
            }
        }
    }

    async fn on_probe_success(&self, id: &str, local_ip: Option<String>) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.probe_failures = 0;
            entry.record.absence_count = 0;
            if let Some(ip) = local_ip {
                entry.record.local_ip = Some(ip);
            }
            if entry.record.status == DeviceStatus::Offline {
                entry.record.status = DeviceStatus::Online;
            }
        }
    }

    async fn on_probe_failure(&self, id: &str) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.by_id.get_mut(id) {
            entry.record.probe_failures += 1;
            if entry.record.probe_failures >= 2 {
                entry.record.status = DeviceStatus::Offline;
            }
        }
    }
}

pub(crate) fn hash_password(password: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

async fn discover_usb_hilink(
    config: &crate::config::AppConfig,
) -> Vec<(String, DeviceKind, String, Arc<dyn Driver>)> {
    let Ok(devices) = nusb::list_devices() else {
        return Vec::new();
    };

    devices
        .filter(|info| {
            HILINK_VID_PIDS
                .iter()
                .any(|(vid, pid)| info.vendor_id() == *vid && info.product_id() == *pid)
        })
        .map(|info| {
            let id = format!(
                "usb_{:04x}:{:04x}_{}",
                info.vendor_id(),
                info.product_id(),
                info.device_address()
            );
            let gateway_ip = config
                .hilink_gateway_overrides
                .get(&id)
                .cloned()
                .unwrap_or_else(|| "192.168.8.1".to_string());
            let sysfs_path = config
                .sysfs_path_overrides
                .get(&id)
                .cloned()
                .unwrap_or_default();
            let interface = config.interface_overrides.get(&id).cloned().unwrap_or_default();

            let driver: Arc<dyn Driver> = Arc::new(HilinkDriver::new(
                interface,
                gateway_ip.clone(),
                (info.vendor_id(), info.product_id()),
                sysfs_path,
                Duration::from_secs(config.connect_timeout_secs.into()),
            ));
            (id, DeviceKind::HuaweiHilink, gateway_ip, driver)
        })
        .collect()
}

async fn discover_android(
    config: &crate::config::AppConfig,
) -> Vec<(String, DeviceKind, String, Arc<dyn Driver>)> {
    let output = match Command::new("adb").arg("devices").output().await {
        Ok(o) => o,
        Err(e) => {
            debug!("{} adb devices failed: {}", NAME, e);
            return Vec::new();
        }
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            if state != "device" {
                return None;
            }
            Some(serial.to_string())
        })
        .map(|serial| {
            let id = format!("android_{}", serial);
            let interface = config.interface_overrides.get(&id).cloned().unwrap_or_default();
            let driver: Arc<dyn Driver> = Arc::new(AndroidDriver::new(
                serial.clone(),
                interface,
                config.sysfs_path_overrides.get(&id).cloned(),
                Duration::from_secs(config.connect_timeout_secs.into()),
            ));
            (id, DeviceKind::AndroidUsb, serial, driver)
        })
        .collect()
}

async fn discover_usb_serial(
    config: &crate::config::AppConfig,
) -> Vec<(String, DeviceKind, String, Arc<dyn Driver>)> {
    let Ok(paths) = glob::glob(&config.serial_glob) else {
        return Vec::new();
    };

    paths
        .flatten()
        .filter_map(|path| path.to_str().map(|s| s.to_string()))
        .map(|tty_path| {
            let sanitized = tty_path.trim_start_matches('/').replace('/', "_");
            let id = format!("serial_{}", sanitized);
            let interface = config.interface_overrides.get(&id).cloned().unwrap_or_default();
            let driver: Arc<dyn Driver> = Arc::new(UsbSerialDriver::new(
                tty_path.clone(),
                interface,
                Duration::from_secs(config.connect_timeout_secs.into()),
            ));
            (id, DeviceKind::UsbSerial, tty_path, driver)
        })
        .collect()
}

#[cfg(test)]
impl DeviceRegistry {
    /// Seed a device directly, bypassing discovery — for tests only.
    pub(crate) async fn insert_for_test(&self, record: DeviceRecord, driver: Arc<dyn Driver>) {
        let mut tables = self.tables.write().await;
        let id = record.device_id.clone();
        tables.by_id.insert(
            id,
            DeviceEntry {
                record,
                driver,
                rate_window: RateWindow::default(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::sync::RwLock as TokioRwLock;

    fn test_config() -> SharedConfig {
        Arc::new(TokioRwLock::new(AppConfig::default()))
    }

    #[tokio::test]
    async fn begin_rotation_rejects_when_already_busy() {
        let registry = DeviceRegistry::new(test_config());
        {
            let mut tables = registry.tables.write().await;
            let mut record = DeviceRecord::new(
                "dev1".into(),
                DeviceKind::HuaweiHilink,
                "eth0".into(),
                "192.168.8.1".into(),
            );
            record.status = DeviceStatus::Online;
            tables.by_id.insert(
                "dev1".into(),
                DeviceEntry {
                    record,
                    driver: Arc::new(HilinkDriver::new(
                        "eth0".into(),
                        "192.168.8.1".into(),
                        (0x12d1, 0x1506),
                        "/sys/bus/usb/devices/1-1".into(),
                        Duration::from_secs(5),
                    )),
                    rate_window: RateWindow::default(),
                },
            );
        }

        assert!(registry.begin_rotation("dev1").await.is_ok());
        let err = registry.begin_rotation("dev1").await.unwrap_err();
        assert_eq!(err, GatewayError::RotationBusy("dev1".into()));
    }

    #[tokio::test]
    async fn dedicated_port_uniqueness_is_enforced() {
        let registry = DeviceRegistry::new(test_config());
        {
            let mut tables = registry.tables.write().await;
            for id in ["dev1", "dev2"] {
                let record = DeviceRecord::new(
                    id.into(),
                    DeviceKind::HuaweiHilink,
                    "eth0".into(),
                    "192.168.8.1".into(),
                );
                tables.by_id.insert(
                    id.into(),
                    DeviceEntry {
                        record,
                        driver: Arc::new(HilinkDriver::new(
                            "eth0".into(),
                            "192.168.8.1".into(),
                            (0x12d1, 0x1506),
                            "/sys/bus/usb/devices/1-1".into(),
                            Duration::from_secs(5),
                        )),
                        rate_window: RateWindow::default(),
                    },
                );
            }
        }

        registry
            .create_dedicated("dev1", Some(6001), None, (6000, 6100))
            .await
            .unwrap();

        let err = registry
            .create_dedicated("dev2", Some(6001), None, (6000, 6100))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::PortInUse(6001));

        registry.remove_dedicated("dev1").await.unwrap();
        // port released, dev2 may now claim it
        registry
            .create_dedicated("dev2", Some(6001), None, (6000, 6100))
            .await
            .unwrap();
    }
}
