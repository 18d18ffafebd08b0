//! Component A — Interface Binder.
//!
//! Produces outbound TCP connections whose source is bound to a named local
//! network interface, so traffic egresses via a specific cellular path.
//! DNS resolution for the target stays local; only the TCP connect itself is
//! constrained to the interface (spec.md §4.A).

use simplelog::*;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::GatewayError;

const NAME: &str = "<i><bright-black> bind: </>";

/// Resolve `host:port` locally, then connect a fresh socket bound to
/// `interface`, honoring `connect_timeout`.
///
/// Each call opens a new socket; the caller owns pooling policy, if any —
/// this binder never reuses a connection across devices (spec.md §4.A).
pub async fn connect(
    interface: &str,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, GatewayError> {
    let addrs = resolve(host, port)?;

    let mut last_err: Option<GatewayError> = None;
    for addr in addrs {
        match timeout(connect_timeout, connect_one(interface, addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("{} connect to {} via {} failed: {}", NAME, addr, interface, e);
                last_err = Some(e);
            }
            Err(_) => {
                return Err(GatewayError::UpstreamTimeout);
            }
        }
    }

    Err(last_err.unwrap_or(GatewayError::UpstreamConnectFailed(format!(
        "no address resolved for {}:{}",
        host, port
    ))))
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, GatewayError> {
    (host, port)
        .to_socket_addrs()
        .map(|it| it.collect::<Vec<_>>())
        .map_err(|e| GatewayError::UpstreamConnectFailed(format!("resolve {}: {}", host, e)))
}

async fn connect_one(interface: &str, addr: SocketAddr) -> Result<TcpStream, GatewayError> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| GatewayError::BindFailed(interface.to_string(), e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| GatewayError::BindFailed(interface.to_string(), e.to_string()))?;

    #[cfg(any(target_os = "android", target_os = "linux"))]
    socket
        .bind_device(Some(interface.as_bytes()))
        .map_err(|e| GatewayError::BindFailed(interface.to_string(), e.to_string()))?;

    let std_stream: std::net::TcpStream = socket.into();
    let tokio_socket = tokio::net::TcpSocket::from_std(std_stream)
        .map_err(|e| GatewayError::BindFailed(interface.to_string(), e.to_string()))?;
    tokio_socket
        .connect(addr)
        .await
        .map_err(|e| classify_connect_error(interface, e))
}

fn classify_connect_error(interface: &str, e: io::Error) -> GatewayError {
    match e.kind() {
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotFound => {
            GatewayError::BindFailed(interface.to_string(), e.to_string())
        }
        io::ErrorKind::TimedOut => GatewayError::UpstreamTimeout,
        _ => GatewayError::UpstreamConnectFailed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_nonexistent_interface_fails() {
        let res = connect("nonexistent-iface-xyz", "127.0.0.1", 1, Duration::from_millis(500)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn resolve_unroutable_host_is_an_error() {
        let res = resolve("this.host.does.not.resolve.invalid", 80);
        assert!(res.is_err());
    }
}
