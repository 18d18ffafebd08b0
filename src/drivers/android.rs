//! Android-ADB driver: phones in USB-tethering mode, managed via `adb shell`
//! subprocess invocations (spec.md §4.B, §6 "Android Debug Bridge").

use async_trait::async_trait;
use simplelog::*;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout as tokio_timeout;

use super::{fetch_external_ip, reauthorize_sysfs, Driver, Method, ProbeResult};
use crate::error::DriverError;

const NAME: &str = "<i><bright-black> drivers/android: </>";
const ECHO_HOST: &str = "ifconfig.me";
const ECHO_PORT: u16 = 80;
const ECHO_PATH: &str = "/ip";

const SUPPORTED: [Method; 3] = [
    Method::AirplaneToggle,
    Method::DataToggle,
    Method::UsbReauthorize,
];

pub struct AndroidDriver {
    pub serial: String,
    pub interface: String,
    pub sysfs_path: Option<String>,
    /// spec.md §9 open question (a): whether data_toggle should also flip
    /// airplane mode as a belt-and-braces step. Driver-tunable, default off.
    pub data_toggle_also_airplane: bool,
    pub adb_timeout: Duration,
}

impl AndroidDriver {
    pub fn new(serial: String, interface: String, sysfs_path: Option<String>, adb_timeout: Duration) -> Self {
        AndroidDriver {
            serial,
            interface,
            sysfs_path,
            data_toggle_also_airplane: false,
            adb_timeout,
        }
    }

    async fn adb_shell(&self, cmd: &str) -> Result<String, DriverError> {
        let fut = Command::new("adb")
            .args(["-s", &self.serial, "shell", cmd])
            .output();

        let output = tokio_timeout(self.adb_timeout, fut)
            .await
            .map_err(|_| DriverError::TimedOut)?
            .map_err(|e| DriverError::DriverError(format!("adb spawn: {}", e)))?;

        if !output.status.success() {
            return Err(DriverError::DriverError(format!(
                "adb shell {:?} exited with {}",
                cmd, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn devices_contains_serial(&self) -> bool {
        let fut = Command::new("adb").arg("devices").output();
        match tokio_timeout(self.adb_timeout, fut).await {
            Ok(Ok(out)) => String::from_utf8_lossy(&out.stdout)
                .lines()
                .any(|l| l.starts_with(&self.serial) && l.contains("device")),
            _ => false,
        }
    }

    async fn data_toggle(&self) -> Result<(), DriverError> {
        self.adb_shell("svc data disable").await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.adb_shell("svc data enable").await?;

        if self.data_toggle_also_airplane {
            self.airplane_toggle().await?;
        }
        Ok(())
    }

    async fn airplane_toggle(&self) -> Result<(), DriverError> {
        self.adb_shell("settings put global airplane_mode_on 1")
            .await?;
        self.adb_shell("am broadcast -a android.intent.action.AIRPLANE_MODE --ez state true")
            .await?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.adb_shell("settings put global airplane_mode_on 0")
            .await?;
        self.adb_shell("am broadcast -a android.intent.action.AIRPLANE_MODE --ez state false")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for AndroidDriver {
    fn supported_methods(&self) -> &[Method] {
        &SUPPORTED
    }

    async fn probe(&self) -> Result<ProbeResult, DriverError> {
        let reachable = self.devices_contains_serial().await;
        if !reachable {
            return Ok(ProbeResult {
                up: false,
                control_addr_reachable: false,
                local_ip: None,
            });
        }

        let local_ip = netif::up().ok().and_then(|it| {
            it.filter(|ifa| ifa.name() == self.interface)
                .find(|ifa| ifa.scope_id().is_none())
                .map(|ifa| ifa.address().to_string())
        });

        Ok(ProbeResult {
            up: local_ip.is_some(),
            control_addr_reachable: true,
            local_ip,
        })
    }

    async fn query_external_ip(&self, interface: &str) -> Result<Option<String>, DriverError> {
        fetch_external_ip(interface, ECHO_HOST, ECHO_PORT, ECHO_PATH, self.adb_timeout).await
    }

    async fn rotate(&self, method: Method) -> Result<(), DriverError> {
        match method {
            Method::DataToggle => {
                info!("{} 📵 data_toggle on {}", NAME, self.serial);
                self.data_toggle().await
            }
            Method::AirplaneToggle => {
                info!("{} ✈️ airplane_toggle on {}", NAME, self.serial);
                self.airplane_toggle().await
            }
            Method::UsbReauthorize => {
                let path = self
                    .sysfs_path
                    .as_ref()
                    .ok_or(DriverError::Unsupported)?;
                reauthorize_sysfs(path).await
            }
            _ => Err(DriverError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_methods_match_spec_table() {
        let driver = AndroidDriver::new(
            "ABC123".into(),
            "usb0".into(),
            None,
            Duration::from_secs(5),
        );
        assert_eq!(driver.supported_methods().len(), 3);
        assert!(driver.supported_methods().contains(&Method::AirplaneToggle));
        assert!(driver.supported_methods().contains(&Method::DataToggle));
    }
}
