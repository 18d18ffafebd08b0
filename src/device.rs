//! Data model (spec.md §3): one record per attached cellular path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

use crate::drivers::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AndroidUsb,
    HuaweiHilink,
    UsbSerial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Busy,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    pub interval_seconds: u64,
    pub auto: bool,
    pub method_preference: Vec<Method>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            interval_seconds: 0,
            auto: false,
            method_preference: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_fail: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_latency_ms: f64,
}

impl Counters {
    pub fn record(&mut self, ok: bool, bytes_in: u64, bytes_out: u64, latency_ms: f64) {
        self.requests_total += 1;
        if ok {
            self.requests_ok += 1;
        } else {
            self.requests_fail += 1;
        }
        self.bytes_in += bytes_in;
        self.bytes_out += bytes_out;
        // running average, weighted by request count so far
        let n = self.requests_total as f64;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedicatedBinding {
    pub listen_port: u16,
    pub username: Option<String>,
    pub password_hash: Option<String>,
}

/// Admission-control bookkeeping: timestamps (monotonic) of requests
/// accepted in the trailing minute. Not serialized — in-memory only.
#[derive(Debug, Default)]
pub struct RateWindow {
    pub(crate) hits: VecDeque<Instant>,
}

impl RateWindow {
    /// Record a hit now and return the count still inside the trailing
    /// 60-second window (spec.md §4.E "Admission control").
    pub fn record_and_count(&mut self, now: Instant) -> usize {
        self.hits.push_back(now);
        self.decay(now);
        self.hits.len()
    }

    pub fn count(&mut self, now: Instant) -> usize {
        self.decay(now);
        self.hits.len()
    }

    fn decay(&mut self, now: Instant) {
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front).as_secs() >= 60 {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub kind: DeviceKind,
    pub interface: String,
    pub local_ip: Option<String>,
    pub control_addr: String,
    pub status: DeviceStatus,
    pub external_ip: Option<String>,
    pub external_ip_observed_at: Option<DateTime<Utc>>,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub last_rotation_ok: Option<bool>,
    pub rotation_config: RotationConfig,
    pub counters: Counters,
    pub dedicated: Option<DedicatedBinding>,
    /// consecutive discovery scans in which the physical device was absent
    #[serde(skip)]
    pub(crate) absence_count: u32,
    /// consecutive failed health probes
    #[serde(skip)]
    pub(crate) probe_failures: u32,
    /// requests currently being relayed through this device, used by the
    /// dispatcher's `least_loaded` strategy (spec.md §4.E) — this is a live
    /// concurrency count, not the monotonic `counters.requests_total`.
    #[serde(skip)]
    pub(crate) in_flight: u32,
}

impl DeviceRecord {
    pub fn new(device_id: String, kind: DeviceKind, interface: String, control_addr: String) -> Self {
        DeviceRecord {
            device_id,
            kind,
            interface,
            local_ip: None,
            control_addr,
            status: DeviceStatus::Offline,
            external_ip: None,
            external_ip_observed_at: None,
            last_rotation_at: None,
            last_rotation_ok: None,
            rotation_config: RotationConfig::default(),
            counters: Counters::default(),
            dedicated: None,
            absence_count: 0,
            probe_failures: 0,
            in_flight: 0,
        }
    }

    pub fn eligible_for_pool(&self) -> bool {
        matches!(self.status, DeviceStatus::Online)
    }

    /// Set `external_ip_observed_at`, enforcing the non-decreasing
    /// invariant from spec.md §3.
    pub fn observe_external_ip(&mut self, ip: String, at: DateTime<Utc>) {
        if let Some(prev) = self.external_ip_observed_at {
            if at < prev {
                return;
            }
        }
        self.external_ip = Some(ip);
        self.external_ip_observed_at = Some(at);
    }
}
