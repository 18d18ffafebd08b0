//! Component D — Rotation Engine (spec.md §4.D).
//!
//! One command-channel worker per engine instance, modeled on the teacher's
//! `spawn_ev_client_task`: a loop reads commands off an `mpsc::Receiver` and
//! dispatches work, except here each command fans out into its own task
//! gated by a global semaphore (`max_parallel_rotations`) rather than
//! managing a single child process.

use chrono::Utc;
use simplelog::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::config::{OnSameIp, SharedConfig};
use crate::device::DeviceStatus;
use crate::drivers::Method;
use crate::error::GatewayError;
use crate::registry::SharedRegistry;

const NAME: &str = "<i><bright-black> rotation: </>";

#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub device_id: String,
    pub ok: bool,
    pub method_used: Option<Method>,
    pub ip_before: Option<String>,
    pub ip_after: Option<String>,
    pub attempts: u32,
}

struct RotateCommand {
    device_id: String,
    method: Option<Method>,
    reply: oneshot::Sender<Result<RotationOutcome, GatewayError>>,
}

pub struct RotationEngine {
    command_tx: mpsc::Sender<RotateCommand>,
}

pub type SharedRotationEngine = Arc<RotationEngine>;

impl RotationEngine {
    pub fn spawn(registry: SharedRegistry, config: SharedConfig) -> SharedRotationEngine {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(command_loop(rx, registry, config));
        Arc::new(RotationEngine { command_tx: tx })
    }

    /// spec.md §4.G `force_rotate`: run now, out of band from the automatic
    /// schedule, and persist the resulting device state.
    pub async fn force_rotate(
        &self,
        device_id: &str,
        method: Option<Method>,
    ) -> Result<RotationOutcome, GatewayError> {
        self.submit(device_id, method).await
    }

    /// spec.md §4.G `test_rotation`: identical mechanics to `force_rotate`
    /// — the distinction is at the control-API boundary, where the caller
    /// is expected to be probing capability rather than relying on the
    /// rotation for traffic. The engine itself has no notion of a
    /// non-committing dry run since a driver call always has a real
    /// side effect on the device.
    pub async fn test_rotation(
        &self,
        device_id: &str,
        method: Option<Method>,
    ) -> Result<RotationOutcome, GatewayError> {
        self.submit(device_id, method).await
    }

    async fn submit(
        &self,
        device_id: &str,
        method: Option<Method>,
    ) -> Result<RotationOutcome, GatewayError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(RotateCommand {
                device_id: device_id.to_string(),
                method,
                reply,
            })
            .await
            .map_err(|_| GatewayError::DriverError("rotation engine shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| GatewayError::DriverError("rotation worker dropped reply".into()))?
    }
}

async fn command_loop(
    mut rx: mpsc::Receiver<RotateCommand>,
    registry: SharedRegistry,
    config: SharedConfig,
) {
    let max_parallel = config.read().await.max_parallel_rotations as usize;
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));

    while let Some(cmd) = rx.recv().await {
        let registry = registry.clone();
        let config = config.clone();
        let semaphore = semaphore.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let outcome = run_rotation(&registry, &config, &cmd.device_id, cmd.method).await;
            let _ = cmd.reply.send(outcome);
        });
    }

    info!("{} command channel closed, worker exiting", NAME);
}

/// idle -> preparing -> attempt -> verifying -> ok/failed (spec.md §4.D).
/// `preparing` is `DeviceRegistry::begin_rotation` flipping the device to
/// `busy`; `attempt`/`verifying` happen per candidate method below;
/// `ok`/`failed` is `DeviceRegistry::end_rotation`.
async fn run_rotation(
    registry: &SharedRegistry,
    config: &SharedConfig,
    device_id: &str,
    method: Option<Method>,
) -> Result<RotationOutcome, GatewayError> {
    let ip_before = registry.begin_rotation(device_id).await?;

    let result = attempt_methods(registry, config, device_id, method, ip_before.clone()).await;

    match &result {
        Ok(outcome) => {
            registry
                .end_rotation(device_id, true, outcome.ip_after.clone(), true)
                .await;
        }
        Err(_) => {
            // a failed rotation still leaves the device physically present;
            // the health loop's own probe decides offline vs online next.
            registry.end_rotation(device_id, false, None, true).await;
        }
    }

    result
}

async fn attempt_methods(
    registry: &SharedRegistry,
    config: &SharedConfig,
    device_id: &str,
    requested_method: Option<Method>,
    ip_before: Option<String>,
) -> Result<RotationOutcome, GatewayError> {
    let driver = registry
        .driver_for(device_id)
        .await
        .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;

    let record = registry
        .get(device_id)
        .await
        .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;

    let candidates: Vec<Method> = match requested_method {
        Some(m) => vec![m],
        None => record.rotation_config.method_preference.clone(),
    };
    if candidates.is_empty() {
        return Err(GatewayError::DriverUnsupported(
            "<none configured>".into(),
            device_id.to_string(),
        ));
    }

    let (verify_attempts, verify_backoff, on_same_ip, post_delay) = {
        let cfg = config.read().await;
        (
            cfg.verify_attempts,
            cfg.verify_backoff_secs,
            cfg.on_same_ip,
            cfg.post_rotation_delay_secs,
        )
    };

    let mut methods_tried: u32 = 0;

    for method in candidates {
        if !driver.supported_methods().contains(&method) {
            continue;
        }
        methods_tried += 1;

        let upper_bound = { config.read().await.method_timeouts.upper_bound(method) };

        info!("{} 🔄 attempting {:?} on {}", NAME, method, device_id);
        let attempt = tokio::time::timeout(upper_bound, driver.rotate(method)).await;
        let attempt = match attempt {
            Ok(inner) => inner,
            Err(_) => {
                warn!("{} {:?} timed out on {}", NAME, method, device_id);
                continue;
            }
        };
        if let Err(e) = attempt {
            warn!("{} {:?} failed on {}: {}", NAME, method, device_id, e);
            continue;
        }

        tokio::time::sleep(Duration::from_secs(post_delay)).await;

        if let Some(outcome) = verify_ip_changed(
            &driver,
            &record.interface,
            ip_before.clone(),
            verify_attempts,
            verify_backoff,
            on_same_ip,
        )
        .await
        {
            return Ok(RotationOutcome {
                device_id: device_id.to_string(),
                ok: true,
                method_used: Some(method),
                ip_before,
                ip_after: outcome.0,
                attempts: methods_tried,
            });
        }
    }

    Err(GatewayError::DriverError(format!(
        "no rotation method produced a verified result for {}",
        device_id
    )))
}

/// Poll `query_external_ip` up to `verify_attempts` times, spaced by
/// `verify_backoff`. Returns `Some((ip, attempts_used))` once a result
/// satisfies `on_same_ip` (spec.md §4.E open question (c)).
async fn verify_ip_changed(
    driver: &Arc<dyn crate::drivers::Driver>,
    interface: &str,
    ip_before: Option<String>,
    verify_attempts: u32,
    verify_backoff_secs: u64,
    on_same_ip: OnSameIp,
) -> Option<(Option<String>, u32)> {
    let mut last_seen = None;
    for attempt in 1..=verify_attempts.max(1) {
        match driver.query_external_ip(interface).await {
            Ok(Some(ip)) => {
                last_seen = Some(ip.clone());
                let changed = ip_before.as_deref() != Some(ip.as_str());
                if changed || (attempt == verify_attempts && on_same_ip == OnSameIp::Accept) {
                    return Some((Some(ip), attempt));
                }
            }
            _ => {}
        }
        if attempt < verify_attempts {
            tokio::time::sleep(Duration::from_secs(verify_backoff_secs)).await;
        }
    }
    if on_same_ip == OnSameIp::Accept {
        Some((last_seen, verify_attempts.max(1)))
    } else {
        None
    }
}

/// spec.md §4.D "automatic rotation": a timer loop that calls
/// `force_rotate` for every device whose `rotation_config.auto` is set and
/// whose interval has elapsed.
pub async fn auto_rotation_loop(engine: SharedRotationEngine, registry: SharedRegistry) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let now = Utc::now();

        for record in registry.list().await {
            if !record.rotation_config.auto || record.status != DeviceStatus::Online {
                continue;
            }
            let due = record
                .last_rotation_at
                .map(|t| {
                    (now - t).num_seconds() as u64 >= record.rotation_config.interval_seconds
                })
                .unwrap_or(true);
            if !due {
                continue;
            }

            let engine = engine.clone();
            let device_id = record.device_id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.force_rotate(&device_id, None).await {
                    warn!("{} auto-rotation failed for {}: {}", NAME, device_id, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::device::{DeviceKind, DeviceRecord};
    use crate::drivers::usb_serial::UsbSerialDriver;
    use crate::registry::DeviceRegistry;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn force_rotate_on_unknown_device_is_an_error() {
        let config: SharedConfig = Arc::new(RwLock::new(AppConfig::default()));
        let registry = DeviceRegistry::new(config.clone());
        let engine = RotationEngine::spawn(registry, config);

        let err = engine.force_rotate("ghost", None).await.unwrap_err();
        assert_eq!(err, GatewayError::UnknownDevice("ghost".into()));
    }

    #[tokio::test]
    async fn on_same_ip_accept_settles_for_unchanged_address() {
        let driver: Arc<dyn crate::drivers::Driver> = Arc::new(UsbSerialDriver::new(
            "/dev/ttyUSB0".into(),
            "wwan0".into(),
            Duration::from_secs(1),
        ));
        // UsbSerialDriver::query_external_ip dials a real echo host, which
        // is unreachable in the test sandbox, so it resolves to Ok(None)
        // repeatedly; with OnSameIp::Accept the loop still terminates with
        // a result rather than hanging forever.
        let outcome = verify_ip_changed(
            &driver,
            "nonexistent0",
            Some("1.2.3.4".into()),
            1,
            0,
            OnSameIp::Accept,
        )
        .await;
        assert!(outcome.is_some());
        let _ = DeviceKind::UsbSerial;
        let _ = DeviceRecord::new(
            "x".into(),
            DeviceKind::UsbSerial,
            "wwan0".into(),
            "".into(),
        );
    }
}
