//! Component F — Proxy Dataplane (spec.md §4.F).
//!
//! Listens on the shared forward-proxy port and on each dedicated port.
//! Request framing is parsed by hand, line-oriented, the same way
//! `drivers::fetch_external_ip` and `drivers::hilink::HilinkDriver::http_roundtrip`
//! already read HTTP off a socket in this crate — there is no independent
//! HTTP server stack here, just enough RFC 7230 to run a forward proxy.

use simplelog::*;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::config::SharedConfig;
use crate::device::DeviceRecord;
use crate::dispatcher::SharedDispatcher;
use crate::error::GatewayError;
use crate::interface_binder;
use crate::registry::SharedRegistry;

const NAME: &str = "<i><bright-black> proxy: </>";

/// Headers stripped on both inbound and outbound legs (spec.md §4.F
/// "Hop-by-hop header list").
const HOP_BY_HOP: &[&str] = &[
    "proxy-authorization",
    "proxy-authenticate",
    "proxy-connection",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "x-proxy-device-id",
];

const DEVICE_HINT_HEADER: &str = "x-proxy-device-id";

#[derive(Debug, Clone, Copy)]
enum PortKind {
    Shared,
    Dedicated(u16),
}

struct ParsedRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    fn filtered_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(k, _)| !HOP_BY_HOP.contains(&k.to_ascii_lowercase().as_str()))
            .cloned()
            .collect()
    }
}

/// Run the shared-pool listener (spec.md §6, default port 8080).
pub async fn run_shared(
    bind_addr: std::net::SocketAddr,
    dispatcher: SharedDispatcher,
    registry: SharedRegistry,
    config: SharedConfig,
) -> io::Result<()> {
    run_listener(bind_addr, PortKind::Shared, dispatcher, registry, config).await
}

/// Run one dedicated-port listener (spec.md §4.E "Dedicated port").
pub async fn run_dedicated(
    bind_addr: std::net::SocketAddr,
    port: u16,
    dispatcher: SharedDispatcher,
    registry: SharedRegistry,
    config: SharedConfig,
) -> io::Result<()> {
    run_listener(
        bind_addr,
        PortKind::Dedicated(port),
        dispatcher,
        registry,
        config,
    )
    .await
}

async fn run_listener(
    bind_addr: std::net::SocketAddr,
    kind: PortKind,
    dispatcher: SharedDispatcher,
    registry: SharedRegistry,
    config: SharedConfig,
) -> io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("{} 👂 listening on {} ({:?})", NAME, bind_addr, kind);

    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        let registry = registry.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, kind, dispatcher, registry, config).await {
                debug!("{} session with {} ended: {}", NAME, peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    kind: PortKind,
    dispatcher: SharedDispatcher,
    registry: SharedRegistry,
    config: SharedConfig,
) -> Result<(), GatewayError> {
    let mut reader = BufReader::new(stream);
    let Some(req) = read_request_head(&mut reader).await? else {
        return Ok(());
    };

    if let PortKind::Dedicated(port) = kind {
        if let Err(e) = check_dedicated_auth(&registry, port, &req).await {
            let mut stream = reader.into_inner();
            write_error_response(&mut stream, &e).await;
            return Err(e);
        }
    }

    let device_hint = req.header(DEVICE_HINT_HEADER).map(|s| s.to_string());
    let device = match select_device(kind, device_hint, peer, &dispatcher).await {
        Ok(d) => d,
        Err(e) => {
            let mut stream = reader.into_inner();
            write_error_response(&mut stream, &e).await;
            return Err(e);
        }
    };

    let (connect_timeout, idle_timeout, copy_buf) = {
        let cfg = config.read().await;
        (
            Duration::from_secs(cfg.connect_timeout_secs.into()),
            Duration::from_secs(cfg.tunnel_idle_timeout_secs),
            cfg.copy_buffer_bytes,
        )
    };

    registry.begin_request(&device.device_id).await;
    let start = Instant::now();
    let result = if req.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(reader, &req, &device, connect_timeout, idle_timeout, copy_buf).await
    } else {
        handle_plain(reader, &req, &device, connect_timeout, copy_buf).await
    };
    registry.end_request(&device.device_id).await;

    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let (ok, bytes_in, bytes_out) = match &result {
        Ok((bin, bout)) => (true, *bin, *bout),
        Err(_) => (false, 0, 0),
    };
    registry
        .record_request(&device.device_id, ok, bytes_in, bytes_out, latency_ms)
        .await;

    result.map(|_| ())
}

async fn select_device(
    kind: PortKind,
    device_hint: Option<String>,
    peer: std::net::SocketAddr,
    dispatcher: &SharedDispatcher,
) -> Result<DeviceRecord, GatewayError> {
    match kind {
        PortKind::Dedicated(port) => dispatcher.resolve_dedicated(port).await,
        PortKind::Shared => match device_hint {
            // spec.md §4.F "Device hint": a hard pin, same as a dedicated port.
            Some(id) => dispatcher.resolve_pinned(&id).await,
            None => dispatcher.select_shared(Some(&peer.ip().to_string())).await,
        },
    }
}

async fn check_dedicated_auth(
    registry: &SharedRegistry,
    port: u16,
    req: &ParsedRequest,
) -> Result<(), GatewayError> {
    let device_id = registry
        .device_for_port(port)
        .await
        .ok_or(GatewayError::PortInUse(port))?;
    let record = registry
        .get(&device_id)
        .await
        .ok_or_else(|| GatewayError::UnknownDevice(device_id.clone()))?;

    let Some(binding) = record.dedicated else {
        return Ok(());
    };
    let (Some(username), Some(password_hash)) = (&binding.username, &binding.password_hash) else {
        return Ok(());
    };

    let header = req
        .header("proxy-authorization")
        .ok_or(GatewayError::AuthRequired)?;
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or(GatewayError::AuthBad)?;
    use base64::Engine as _;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| GatewayError::AuthBad)?;
    let decoded = String::from_utf8(decoded).map_err(|_| GatewayError::AuthBad)?;
    let (user, pass) = decoded.split_once(':').ok_or(GatewayError::AuthBad)?;

    if user != username || crate::registry::hash_password(pass) != *password_hash {
        return Err(GatewayError::AuthBad);
    }
    Ok(())
}

/// Read a request line and headers off the socket, RFC 7230 style. Returns
/// `Ok(None)` on a clean EOF before any bytes arrive (client closed idly).
async fn read_request_head(
    reader: &mut BufReader<TcpStream>,
) -> Result<Option<ParsedRequest>, GatewayError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }

    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts
        .next()
        .ok_or_else(|| GatewayError::UpstreamConnectFailed("malformed request line".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| GatewayError::UpstreamConnectFailed("malformed request line".into()))?
        .to_string();

    let mut headers = Vec::new();
    loop {
        let mut hline = String::new();
        let n = reader
            .read_line(&mut hline)
            .await
            .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;
        if n == 0 || hline.trim_end().is_empty() {
            break;
        }
        if let Some((k, v)) = hline.trim_end().split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    Ok(Some(ParsedRequest {
        method,
        target,
        headers,
    }))
}

/// `CONNECT host:port HTTP/1.1` (spec.md §4.F, §6).
async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    req: &ParsedRequest,
    device: &DeviceRecord,
    connect_timeout: Duration,
    idle_timeout: Duration,
    copy_buf: usize,
) -> Result<(u64, u64), GatewayError> {
    let Some((host, port)) = req.target.rsplit_once(':').and_then(|(h, p)| {
        p.parse::<u16>().ok().map(|p| (h.to_string(), p))
    }) else {
        let mut stream = reader.into_inner();
        let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        return Err(GatewayError::UpstreamConnectFailed("bad CONNECT target".into()));
    };

    let mut upstream = match interface_binder::connect(&device.interface, &host, port, connect_timeout).await {
        Ok(s) => s,
        Err(e) => {
            let mut stream = reader.into_inner();
            write_error_response(&mut stream, &e).await;
            return Err(e);
        }
    };

    let mut client = reader.into_inner();
    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;

    relay_bidirectional(&mut client, &mut upstream, idle_timeout, copy_buf).await
}

/// Absolute-form `GET http://host/path HTTP/1.1` (spec.md §4.F).
async fn handle_plain(
    mut reader: BufReader<TcpStream>,
    req: &ParsedRequest,
    device: &DeviceRecord,
    connect_timeout: Duration,
    copy_buf: usize,
) -> Result<(u64, u64), GatewayError> {
    let (host, port, path) = parse_absolute_form(&req.target)
        .ok_or_else(|| GatewayError::UpstreamConnectFailed("non-absolute-form request".into()))?;

    let mut upstream =
        interface_binder::connect(&device.interface, &host, port, connect_timeout).await?;

    let mut out_headers = req.filtered_headers();
    if !out_headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
        out_headers.push(("Host".to_string(), host.clone()));
    }

    let mut head = format!("{} {} HTTP/1.1\r\n", req.method, path);
    for (k, v) in &out_headers {
        head.push_str(&format!("{}: {}\r\n", k, v));
    }
    head.push_str("Connection: close\r\n\r\n");

    upstream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;
    let mut bytes_out = head.len() as u64;

    if let Some(len) = req.content_length() {
        let mut remaining = len;
        let mut buf = vec![0u8; copy_buf];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            let n = reader
                .read(&mut buf[..chunk])
                .await
                .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;
            if n == 0 {
                break;
            }
            upstream
                .write_all(&buf[..n])
                .await
                .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;
            bytes_out += n as u64;
            remaining -= n as u64;
        }
    }

    let mut client = reader.into_inner();
    let mut buf = vec![0u8; copy_buf];
    let mut bytes_in = 0u64;
    loop {
        let n = upstream
            .read(&mut buf)
            .await
            .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        client
            .write_all(&buf[..n])
            .await
            .map_err(|e| GatewayError::UpstreamConnectFailed(e.to_string()))?;
        bytes_in += n as u64;
    }

    Ok((bytes_out, bytes_in))
}

fn parse_absolute_form(target: &str) -> Option<(String, u16, String)> {
    let rest = target.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
        None => (authority.to_string(), 80),
    };
    Some((host, port, if path.is_empty() { "/".to_string() } else { path.to_string() }))
}

/// Bidirectional byte relay with an idle timeout applied independently to
/// each direction (spec.md §4.F "Timeouts": idle timeout on established
/// tunnels). Either side closing ends the whole session promptly.
async fn relay_bidirectional(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    idle_timeout: Duration,
    copy_buf: usize,
) -> Result<(u64, u64), GatewayError> {
    let (mut cr, mut cw) = client.split();
    let (mut ur, mut uw) = upstream.split();

    let client_to_upstream = copy_with_idle_timeout(&mut cr, &mut uw, idle_timeout, copy_buf);
    let upstream_to_client = copy_with_idle_timeout(&mut ur, &mut cw, idle_timeout, copy_buf);

    let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);
    Ok((sent.unwrap_or(0), received.unwrap_or(0)))
}

async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
    copy_buf: usize,
) -> io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; copy_buf];
    let mut total = 0u64;
    loop {
        let read = tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => break, // idle timeout: stop this direction
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

async fn write_error_response(stream: &mut TcpStream, err: &GatewayError) {
    let status = err.status_code();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    if matches!(err, GatewayError::AuthRequired | GatewayError::AuthBad) {
        head.push_str("Proxy-Authenticate: Basic realm=\"proxy\"\r\n");
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_form_with_explicit_port() {
        let (host, port, path) = parse_absolute_form("http://echo.example:8081/ip").unwrap();
        assert_eq!(host, "echo.example");
        assert_eq!(port, 8081);
        assert_eq!(path, "/ip");
    }

    #[test]
    fn parses_absolute_form_defaults_to_port_80_and_root_path() {
        let (host, port, path) = parse_absolute_form("http://echo.example").unwrap();
        assert_eq!(host, "echo.example");
        assert_eq!(port, 80);
        assert_eq!(path, "/");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let req = ParsedRequest {
            method: "GET".into(),
            target: "http://echo.example/".into(),
            headers: vec![
                ("Host".into(), "echo.example".into()),
                ("Proxy-Authorization".into(), "Basic xxx".into()),
                ("Connection".into(), "keep-alive".into()),
                ("X-Proxy-Device-ID".into(), "dev1".into()),
                ("Accept".into(), "*/*".into()),
            ],
        };
        let filtered = req.filtered_headers();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().any(|(k, _)| k == "Host"));
        assert!(filtered.iter().any(|(k, _)| k == "Accept"));
    }
}
