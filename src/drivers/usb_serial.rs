//! USB-Serial driver: bare modems controlled line-oriented over a serial
//! TTY with AT commands (spec.md §4.B, §6 "AT commands").

use async_trait::async_trait;
use simplelog::*;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use super::{fetch_external_ip, Driver, Method, ProbeResult};
use crate::error::DriverError;

const NAME: &str = "<i><bright-black> drivers/usb_serial: </>";
const ECHO_HOST: &str = "ifconfig.me";
const ECHO_PORT: u16 = 80;
const ECHO_PATH: &str = "/ip";
const BAUD_RATE: u32 = 115_200;

const SUPPORTED: [Method; 1] = [Method::AtCfunCycle];

pub struct UsbSerialDriver {
    pub tty_path: String,
    pub interface: String,
    pub at_timeout: Duration,
}

impl UsbSerialDriver {
    pub fn new(tty_path: String, interface: String, at_timeout: Duration) -> Self {
        UsbSerialDriver {
            tty_path,
            interface,
            at_timeout,
        }
    }

    /// Send one AT command, expecting an `OK` line back. Serial I/O is
    /// blocking, so this runs on a blocking-pool thread (spec.md §5
    /// "Driver rotations suspend on ... serial I/O").
    async fn send_at(&self, cmd: &'static str) -> Result<(), DriverError> {
        let tty_path = self.tty_path.clone();
        let at_timeout = self.at_timeout;

        let task = tokio::task::spawn_blocking(move || -> Result<(), DriverError> {
            let mut port = serialport::new(&tty_path, BAUD_RATE)
                .timeout(at_timeout)
                .open()
                .map_err(|e| DriverError::DriverError(format!("open {}: {}", tty_path, e)))?;

            port.write_all(format!("{}\r", cmd).as_bytes())
                .map_err(|e| DriverError::DriverError(format!("write: {}", e)))?;

            let mut reader = BufReader::new(port);
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader
                    .read_line(&mut line)
                    .map_err(|e| DriverError::DriverError(format!("read: {}", e)))?;
                if n == 0 {
                    return Err(DriverError::TimedOut);
                }
                if line.trim() == "OK" {
                    return Ok(());
                }
                if line.trim() == "ERROR" {
                    return Err(DriverError::DriverError(format!("{} -> ERROR", cmd)));
                }
            }
        });

        tokio::time::timeout(at_timeout + Duration::from_secs(1), task)
            .await
            .map_err(|_| DriverError::TimedOut)?
            .map_err(|e| DriverError::DriverError(format!("join: {}", e)))?
    }
}

#[async_trait]
impl Driver for UsbSerialDriver {
    fn supported_methods(&self) -> &[Method] {
        &SUPPORTED
    }

    async fn probe(&self) -> Result<ProbeResult, DriverError> {
        let exists = tokio::fs::metadata(&self.tty_path).await.is_ok();
        let local_ip = netif::up().ok().and_then(|it| {
            it.filter(|ifa| ifa.name() == self.interface)
                .find(|ifa| ifa.scope_id().is_none())
                .map(|ifa| ifa.address().to_string())
        });

        Ok(ProbeResult {
            up: exists,
            control_addr_reachable: exists,
            local_ip,
        })
    }

    async fn query_external_ip(&self, interface: &str) -> Result<Option<String>, DriverError> {
        fetch_external_ip(interface, ECHO_HOST, ECHO_PORT, ECHO_PATH, self.at_timeout).await
    }

    async fn rotate(&self, method: Method) -> Result<(), DriverError> {
        match method {
            Method::AtCfunCycle => {
                info!("{} 📡 AT+CFUN cycle on {}", NAME, self.tty_path);
                self.send_at("AT+CFUN=0").await?;
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.send_at("AT+CFUN=1").await
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
        let driver = UsbSerialDriver::new(
            "/dev/ttyUSB2".into(),
            "wwan0".into(),
            Duration::from_secs(5),
        );
        assert_eq!(driver.supported_methods(), &[Method::AtCfunCycle]);
    }
}
