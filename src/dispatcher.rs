//! Component E — Dispatcher (spec.md §4.E): picks a device for an inbound
//! proxy request, either from the shared pool (subject to a selection
//! strategy and per-device admission control) or by dedicated-port pinning.

use rand::Rng;
use simplelog::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::{SelectionStrategy, SharedConfig};
use crate::device::{DeviceRecord, DeviceStatus};
use crate::error::GatewayError;
use crate::registry::SharedRegistry;

const NAME: &str = "<i><bright-black> dispatcher: </>";

pub struct Dispatcher {
    registry: SharedRegistry,
    config: SharedConfig,
    round_robin_cursor: Mutex<usize>,
    sticky_map: Mutex<HashMap<String, String>>,
}

pub type SharedDispatcher = Arc<Dispatcher>;

impl Dispatcher {
    pub fn new(registry: SharedRegistry, config: SharedConfig) -> SharedDispatcher {
        Arc::new(Dispatcher {
            registry,
            config,
            round_robin_cursor: Mutex::new(0),
            sticky_map: Mutex::new(HashMap::new()),
        })
    }

    /// Choose a device for a shared-pool request (spec.md §4.E). `client_key`
    /// — typically the remote peer's address — is only consulted under the
    /// `sticky_client` strategy.
    pub async fn select_shared(
        &self,
        client_key: Option<&str>,
    ) -> Result<DeviceRecord, GatewayError> {
        let (strategy, max_rpm) = {
            let cfg = self.config.read().await;
            (cfg.selection_strategy, cfg.max_requests_per_minute)
        };

        let pool = self.registry.ready_queue().await;
        if pool.is_empty() {
            return Err(GatewayError::NoDeviceAvailable);
        }

        let now = Instant::now();
        let admissible: Vec<DeviceRecord> = {
            let mut out = Vec::with_capacity(pool.len());
            for record in pool {
                if self
                    .registry
                    .admission_peek(&record.device_id, max_rpm, now)
                    .await
                {
                    out.push(record);
                }
            }
            out
        };
        if admissible.is_empty() {
            return Err(GatewayError::NoDeviceAvailable);
        }

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => self.pick_round_robin(&admissible).await,
            SelectionStrategy::LeastLoaded => pick_least_loaded(&admissible),
            SelectionStrategy::Random => pick_random(&admissible),
            SelectionStrategy::StickyClient => {
                self.pick_sticky(&admissible, client_key).await
            }
        };

        // only the device actually serving this request records a hit —
        // a peer that merely lost the selection never gets one.
        if !self
            .registry
            .admission_check(&chosen.device_id, max_rpm, Instant::now())
            .await
        {
            return Err(GatewayError::NoDeviceAvailable);
        }

        Ok(chosen)
    }

    async fn pick_round_robin(&self, pool: &[DeviceRecord]) -> DeviceRecord {
        let mut cursor = self.round_robin_cursor.lock().await;
        *cursor = (*cursor + 1) % pool.len();
        pool[*cursor].clone()
    }

    async fn pick_sticky(
        &self,
        pool: &[DeviceRecord],
        client_key: Option<&str>,
    ) -> DeviceRecord {
        let Some(key) = client_key else {
            return pick_least_loaded(pool);
        };

        let mut sticky = self.sticky_map.lock().await;
        if let Some(device_id) = sticky.get(key) {
            if let Some(record) = pool.iter().find(|r| &r.device_id == device_id) {
                return record.clone();
            }
        }

        let chosen = pick_least_loaded(pool);
        sticky.insert(key.to_string(), chosen.device_id.clone());
        chosen
    }

    /// `X-Proxy-Device-ID` hard pin (spec.md §4.F "Device hint"): same
    /// busy-wait behavior as a dedicated port, keyed by device_id instead
    /// of by listen_port.
    pub async fn resolve_pinned(&self, device_id: &str) -> Result<DeviceRecord, GatewayError> {
        let busy_wait = Duration::from_secs(self.config.read().await.busy_wait_secs);
        let deadline = Instant::now() + busy_wait;

        loop {
            let record = self
                .registry
                .get(device_id)
                .await
                .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;

            match record.status {
                DeviceStatus::Online => return Ok(record),
                DeviceStatus::Disabled | DeviceStatus::Offline => {
                    return Err(GatewayError::DeviceOffline(device_id.to_string()))
                }
                DeviceStatus::Busy => {
                    if Instant::now() >= deadline {
                        return Err(GatewayError::DeviceBusy(device_id.to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    /// Dedicated-port routing (spec.md §4.F "dedicated port binding"): the
    /// caller already knows which device a port maps to via the listener
    /// it connected on. If the device is mid-rotation, wait up to
    /// `busy_wait_secs` for it to come back rather than failing instantly.
    pub async fn resolve_dedicated(&self, port: u16) -> Result<DeviceRecord, GatewayError> {
        let device_id = self
            .registry
            .device_for_port(port)
            .await
            .ok_or(GatewayError::PortInUse(port))?;

        let busy_wait = Duration::from_secs(self.config.read().await.busy_wait_secs);
        let deadline = Instant::now() + busy_wait;

        loop {
            let record = self
                .registry
                .get(&device_id)
                .await
                .ok_or_else(|| GatewayError::UnknownDevice(device_id.clone()))?;

            match record.status {
                DeviceStatus::Online => return Ok(record),
                DeviceStatus::Disabled => return Err(GatewayError::DeviceOffline(device_id)),
                DeviceStatus::Offline => return Err(GatewayError::DeviceOffline(device_id)),
                DeviceStatus::Busy => {
                    if Instant::now() >= deadline {
                        return Err(GatewayError::DeviceBusy(device_id));
                    }
                    debug!("{} waiting on busy dedicated device {}", NAME, device_id);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }
}

/// spec.md §4.E "least_loaded: lowest in-flight count, ties broken by
/// lowest recent error rate" — in-flight, not the monotonic lifetime total.
fn pick_least_loaded(pool: &[DeviceRecord]) -> DeviceRecord {
    pool.iter()
        .min_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then_with(|| error_rate(a).total_cmp(&error_rate(b)))
        })
        .expect("pool checked non-empty by caller")
        .clone()
}

fn error_rate(r: &DeviceRecord) -> f64 {
    if r.counters.requests_total == 0 {
        0.0
    } else {
        r.counters.requests_fail as f64 / r.counters.requests_total as f64
    }
}

fn pick_random(pool: &[DeviceRecord]) -> DeviceRecord {
    let idx = rand::thread_rng().gen_range(0..pool.len());
    pool[idx].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::device::DeviceKind;
    use crate::drivers::hilink::HilinkDriver;
    use crate::registry::DeviceRegistry;
    use tokio::sync::RwLock;

    async fn seed_online_device(registry: &SharedRegistry, id: &str) {
        let mut record = crate::device::DeviceRecord::new(
            id.to_string(),
            DeviceKind::HuaweiHilink,
            "eth0".into(),
            "192.168.8.1".into(),
        );
        record.status = DeviceStatus::Online;
        let driver: Arc<dyn crate::drivers::Driver> = Arc::new(HilinkDriver::new(
            "eth0".into(),
            "192.168.8.1".into(),
            (0x12d1, 0x1506),
            "/sys/bus/usb/devices/1-1".into(),
            Duration::from_secs(5),
        ));
        registry.insert_for_test(record, driver).await;
    }

    #[tokio::test]
    async fn no_devices_means_no_device_available() {
        let config: SharedConfig = Arc::new(RwLock::new(AppConfig::default()));
        let registry = DeviceRegistry::new(config.clone());
        let dispatcher = Dispatcher::new(registry, config);
        let err = dispatcher.select_shared(None).await.unwrap_err();
        assert_eq!(err, GatewayError::NoDeviceAvailable);
    }

    #[tokio::test]
    async fn sticky_client_reuses_prior_assignment() {
        let mut config_value = AppConfig::default();
        config_value.selection_strategy = SelectionStrategy::StickyClient;
        let config: SharedConfig = Arc::new(RwLock::new(config_value));
        let registry = DeviceRegistry::new(config.clone());
        seed_online_device(&registry, "dev1").await;
        seed_online_device(&registry, "dev2").await;

        let dispatcher = Dispatcher::new(registry, config);
        let first = dispatcher.select_shared(Some("client-a")).await.unwrap();
        let second = dispatcher.select_shared(Some("client-a")).await.unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[tokio::test]
    async fn round_robin_cycles_through_pool() {
        let mut config_value = AppConfig::default();
        config_value.selection_strategy = SelectionStrategy::RoundRobin;
        let config: SharedConfig = Arc::new(RwLock::new(config_value));
        let registry = DeviceRegistry::new(config.clone());
        seed_online_device(&registry, "dev1").await;
        seed_online_device(&registry, "dev2").await;

        let dispatcher = Dispatcher::new(registry, config);
        let first = dispatcher.select_shared(None).await.unwrap();
        let second = dispatcher.select_shared(None).await.unwrap();
        assert_ne!(first.device_id, second.device_id);
    }

    #[tokio::test]
    async fn least_loaded_prefers_fewer_in_flight_requests() {
        let config: SharedConfig = Arc::new(RwLock::new(AppConfig::default()));
        let registry = DeviceRegistry::new(config.clone());
        seed_online_device(&registry, "dev1").await;
        seed_online_device(&registry, "dev2").await;

        // dev1 has two requests in flight, dev2 has none — dev2 should win
        // even though dev1 has served fewer requests lifetime-total.
        registry.begin_request("dev1").await;
        registry.begin_request("dev1").await;

        let dispatcher = Dispatcher::new(registry, config);
        let chosen = dispatcher.select_shared(None).await.unwrap();
        assert_eq!(chosen.device_id, "dev2");
    }

    #[tokio::test]
    async fn least_loaded_breaks_ties_on_error_rate() {
        let config: SharedConfig = Arc::new(RwLock::new(AppConfig::default()));
        let registry = DeviceRegistry::new(config.clone());
        seed_online_device(&registry, "dev1").await;
        seed_online_device(&registry, "dev2").await;

        // equal in-flight (zero), but dev1 has a worse historical error rate
        registry
            .record_request("dev1", false, 0, 0, 10.0)
            .await;
        registry.record_request("dev2", true, 0, 0, 10.0).await;

        let dispatcher = Dispatcher::new(registry, config);
        let chosen = dispatcher.select_shared(None).await.unwrap();
        assert_eq!(chosen.device_id, "dev2");
    }
}
