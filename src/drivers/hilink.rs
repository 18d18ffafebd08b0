//! USB-HiLink driver: Huawei modems running in router mode, managed over
//! their on-device HTTP/XML management API (spec.md §4.B, §6 "HiLink HTTP
//! API").

use async_trait::async_trait;
use simplelog::*;
use std::process::Command;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout as tokio_timeout;

use super::{fetch_external_ip, reauthorize_sysfs, Driver, Method, ProbeResult};
use crate::error::DriverError;
use crate::interface_binder;

const NAME: &str = "<i><bright-black> drivers/hilink: </>";
const ECHO_HOST: &str = "ifconfig.me";
const ECHO_PORT: u16 = 80;
const ECHO_PATH: &str = "/ip";

const SUPPORTED: [Method; 4] = [
    Method::HilinkDialup,
    Method::HilinkReboot,
    Method::HilinkModeswitch,
    Method::UsbReauthorize,
];

pub struct HilinkDriver {
    /// interface carrying this device's traffic
    pub interface: String,
    /// the device's HiLink gateway IP, e.g. "192.168.8.1"
    pub gateway_ip: String,
    /// vendor:product as hex, for usb_modeswitch invocation
    pub vid_pid: (u16, u16),
    /// sysfs path, e.g. "/sys/bus/usb/devices/1-1.2"
    pub sysfs_path: String,
    pub http_timeout: Duration,
}

impl HilinkDriver {
    pub fn new(
        interface: String,
        gateway_ip: String,
        vid_pid: (u16, u16),
        sysfs_path: String,
        http_timeout: Duration,
    ) -> Self {
        HilinkDriver {
            interface,
            gateway_ip,
            vid_pid,
            sysfs_path,
            http_timeout,
        }
    }

    async fn http_roundtrip(
        &self,
        method: &str,
        path: &str,
        extra_headers: &[(String, String)],
        body: Option<&str>,
    ) -> Result<String, DriverError> {
        let mut stream = interface_binder::connect(
            &self.interface,
            &self.gateway_ip,
            80,
            self.http_timeout,
        )
        .await
        .map_err(|_| DriverError::Unreachable)?;

        let body_bytes = body.unwrap_or("").as_bytes();
        let mut req = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
            method,
            path,
            self.gateway_ip,
            body_bytes.len()
        );
        for (k, v) in extra_headers {
            req.push_str(&format!("{}: {}\r\n", k, v));
        }
        req.push_str("\r\n");

        tokio_timeout(self.http_timeout, async {
            stream.write_all(req.as_bytes()).await?;
            if !body_bytes.is_empty() {
                stream.write_all(body_bytes).await?;
            }
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        })
        .await
        .map_err(|_| DriverError::TimedOut)?
        .map_err(|e| DriverError::DriverError(e.to_string()))
        .map(|buf| {
            let text = String::from_utf8_lossy(&buf).to_string();
            text.split("\r\n\r\n").nth(1).unwrap_or("").to_string()
        })
    }

    /// `GET /api/webserver/SesTokInfo`, returning the session token echoed
    /// in the `__RequestVerificationToken` header on subsequent POSTs.
    async fn session_token(&self) -> Result<String, DriverError> {
        let body = self
            .http_roundtrip("GET", "/api/webserver/SesTokInfo", &[], None)
            .await?;
        let doc = roxmltree::Document::parse(&body)
            .map_err(|e| DriverError::DriverError(format!("SesTokInfo parse: {}", e)))?;
        doc.descendants()
            .find(|n| n.has_tag_name("TokInfo"))
            .and_then(|n| n.text())
            .map(|s| s.to_string())
            .ok_or_else(|| DriverError::DriverError("missing TokInfo".into()))
    }

    async fn dial(&self, connect: bool) -> Result<(), DriverError> {
        let token = self.session_token().await?;
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><request><Action>{}</Action></request>",
            if connect { 1 } else { 0 }
        );
        self.http_roundtrip(
            "POST",
            "/api/dialup/dial",
            &[("__RequestVerificationToken".to_string(), token)],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn reboot(&self) -> Result<(), DriverError> {
        let token = self.session_token().await?;
        let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><request><Control>1</Control></request>";
        self.http_roundtrip(
            "POST",
            "/api/device/control",
            &[("__RequestVerificationToken".to_string(), token)],
            Some(body),
        )
        .await?;
        Ok(())
    }

    /// Switch to mass-storage mode and back via usb_modeswitch, then wait
    /// for the network interface to reappear with a DHCP lease (spec.md
    /// §4.B, §9 "Open questions" (b): fail the attempt if the interface
    /// does not come back within the upper bound).
    async fn modeswitch(&self) -> Result<(), DriverError> {
        let (vid, pid) = self.vid_pid;
        let message = format!("{:04x}:{:04x}", vid, pid);
        info!("{} 🔌 usb_modeswitch on {}", NAME, message);

        let status = Command::new("usb_modeswitch")
            .args(["-v", &format!("{:04x}", vid), "-p", &format!("{:04x}", pid), "-R"])
            .status()
            .map_err(|e| DriverError::DriverError(format!("usb_modeswitch spawn: {}", e)))?;
        if !status.success() {
            return Err(DriverError::DriverError(format!(
                "usb_modeswitch exited with {}",
                status
            )));
        }

        // storage-wait ~15s, restore-wait ~20s (spec.md §4.B budget)
        tokio::time::sleep(Duration::from_secs(15)).await;

        let reappeared = tokio_timeout(Duration::from_secs(60), wait_for_interface(&self.interface))
            .await
            .is_ok();
        if !reappeared {
            return Err(DriverError::DriverError(
                "interface did not reappear after modeswitch".into(),
            ));
        }

        let dhcp_ok = tokio_timeout(Duration::from_secs(20), wait_for_dhcp(&self.interface))
            .await
            .is_ok();
        if !dhcp_ok {
            return Err(DriverError::DriverError(
                "no DHCP lease after modeswitch".into(),
            ));
        }

        Ok(())
    }

    async fn reauthorize(&self) -> Result<(), DriverError> {
        reauthorize_sysfs(&self.sysfs_path).await
    }
}

async fn wait_for_interface(interface: &str) {
    loop {
        if netif::up()
            .map(|mut it| it.any(|ifa| ifa.name() == interface))
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn wait_for_dhcp(interface: &str) {
    loop {
        let has_ip = netif::up()
            .map(|mut it| {
                it.any(|ifa| ifa.name() == interface && ifa.scope_id().is_none())
            })
            .unwrap_or(false);
        if has_ip {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[async_trait]
impl Driver for HilinkDriver {
    fn supported_methods(&self) -> &[Method] {
        &SUPPORTED
    }

    async fn probe(&self) -> Result<ProbeResult, DriverError> {
        let up = netif::up()
            .map(|mut it| it.any(|ifa| ifa.name() == self.interface))
            .unwrap_or(false);

        let reachable = self.session_token().await.is_ok();

        let local_ip = netif::up().ok().and_then(|it| {
            it.filter(|ifa| ifa.name() == self.interface)
                .find(|ifa| ifa.scope_id().is_none())
                .map(|ifa| ifa.address().to_string())
        });

        Ok(ProbeResult {
            up,
            control_addr_reachable: reachable,
            local_ip,
        })
    }

    async fn query_external_ip(&self, interface: &str) -> Result<Option<String>, DriverError> {
        fetch_external_ip(interface, ECHO_HOST, ECHO_PORT, ECHO_PATH, self.http_timeout).await
    }

    async fn rotate(&self, method: Method) -> Result<(), DriverError> {
        match method {
            Method::HilinkDialup => {
                self.dial(false).await?;
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.dial(true).await
            }
            Method::HilinkReboot => self.reboot().await,
            Method::HilinkModeswitch => self.modeswitch().await,
            Method::UsbReauthorize => self.reauthorize().await,
            _ => Err(DriverError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_methods_match_spec_table() {
        let driver = HilinkDriver::new(
            "enx0".into(),
            "192.168.8.1".into(),
            (0x12d1, 0x1506),
            "/sys/bus/usb/devices/1-1".into(),
            Duration::from_secs(5),
        );
        assert_eq!(driver.supported_methods().len(), 4);
        assert!(driver.supported_methods().contains(&Method::HilinkDialup));
        assert!(driver.supported_methods().contains(&Method::UsbReauthorize));
    }
}
