//! Ops convenience, mirroring the teacher's `src/bin/generate_config.rs`:
//! write a commented default `config.toml` next to the binary. Not part of
//! the gateway's own runtime contract.

use mobile_ip_gateway::config::{AppConfig, OnSameIp, SelectionStrategy};
use std::path::{Path, PathBuf};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🚀 Starting default config generation...");

    let output_path: PathBuf = std::env::current_exe()?
        .parent()
        .ok_or("Unable to get parent directory of the binary")?
        .join("config.toml");

    println!("💾 Saving config to: {}", output_path.display());
    generate_config(&output_path)?;
    println!("✅ Config generation completed successfully!");
    Ok(())
}

/// Builds the commented TOML by hand, field by field, the same way the
/// teacher's generator walks its `ConfigJson` schema and writes a `# ` comment
/// line per field description — we just don't have a separate schema file to
/// drive it from, so the descriptions are inlined here instead.
fn generate_config<P: AsRef<Path>>(output_path: P) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = AppConfig::default();
    let mut out = String::new();

    let mut field = |comment: &str, line: String| {
        for c in comment.lines() {
            out.push_str(&format!("# {}\n", c.trim()));
        }
        out.push_str(&line);
        out.push_str("\n\n");
    };

    field(
        "shared forward-proxy port: round-robins/least-loads across every online device",
        format!("proxy_port = {}", cfg.proxy_port),
    );
    field(
        "fallback bind port for the control API when `webserver` has no explicit address",
        format!("api_port = {}", cfg.api_port),
    );
    field(
        "inclusive [low, high] range `create_dedicated` allocates an unpinned port from",
        format!(
            "dedicated_port_range = [{}, {}]",
            cfg.dedicated_port_range.0, cfg.dedicated_port_range.1
        ),
    );
    field(
        "auto-rotation interval applied to newly discovered devices",
        format!(
            "default_rotation_interval_secs = {}",
            cfg.default_rotation_interval_secs
        ),
    );
    field(
        "soft cap on concurrently tracked devices",
        format!("max_devices = {}", cfg.max_devices),
    );
    field(
        "per-device admission ceiling over a trailing 60s window",
        format!(
            "max_requests_per_minute = {}",
            cfg.max_requests_per_minute
        ),
    );
    field(
        "global semaphore size for concurrent in-flight rotations",
        format!(
            "max_parallel_rotations = {}",
            cfg.max_parallel_rotations
        ),
    );
    field(
        "how often the registry rescans for attached devices",
        format!("discovery_interval_secs = {}", cfg.discovery_interval_secs),
    );
    field(
        "how often the registry probes already-known devices",
        format!("health_interval_secs = {}", cfg.health_interval_secs),
    );
    field(
        "consecutive absent discovery scans tolerated before a device is marked offline\n(removed entirely after 2x this many)",
        format!("grace_scans = {}", cfg.grace_scans),
    );
    field(
        "how stale external_ip may get before the health loop re-fetches it",
        format!("ip_refresh_secs = {}", cfg.ip_refresh_secs),
    );
    field(
        "settle time after a rotation method runs, before IP verification begins",
        format!(
            "post_rotation_delay_secs = {}",
            cfg.post_rotation_delay_secs
        ),
    );
    field(
        "max external-IP polls while verifying a rotation",
        format!("verify_attempts = {}", cfg.verify_attempts),
    );
    field(
        "delay between verification polls",
        format!("verify_backoff_secs = {}", cfg.verify_backoff_secs),
    );
    field(
        r#""advance" keeps retrying methods on an unchanged IP, "accept" settles for it"#,
        format!(
            "on_same_ip = \"{}\"",
            match cfg.on_same_ip {
                OnSameIp::Advance => "advance",
                OnSameIp::Accept => "accept",
            }
        ),
    );
    field(
        "how long a dedicated-port or pinned request waits on a busy/rotating device",
        format!("busy_wait_secs = {}", cfg.busy_wait_secs),
    );
    field(
        "round_robin | least_loaded | random | sticky_client",
        format!(
            "selection_strategy = \"{}\"",
            match cfg.selection_strategy {
                SelectionStrategy::RoundRobin => "round_robin",
                SelectionStrategy::LeastLoaded => "least_loaded",
                SelectionStrategy::Random => "random",
                SelectionStrategy::StickyClient => "sticky_client",
            }
        ),
    );
    field(
        "per-attempt upstream TCP connect timeout",
        format!("connect_timeout_secs = {}", cfg.connect_timeout_secs),
    );
    field(
        "idle timeout applied independently to each direction of a CONNECT tunnel",
        format!(
            "tunnel_idle_timeout_secs = {}",
            cfg.tunnel_idle_timeout_secs
        ),
    );
    field(
        "buffer size used when relaying proxied bodies/tunnels",
        format!("copy_buffer_bytes = {}", cfg.copy_buffer_bytes),
    );
    field(
        "TOML file persisting dedicated-port bindings and rotation configs across restarts",
        format!("state_file = \"{}\"", cfg.state_file.display()),
    );
    field("log file path", format!("logfile = \"{}\"", cfg.logfile.display()));
    field("enable debug-level logging", format!("debug = {}", cfg.debug));
    field(
        "keep the console at info level while still writing debug lines to the logfile",
        format!("disable_console_debug = {}", cfg.disable_console_debug),
    );
    field(
        "control API bind address; comment out to disable the control API entirely",
        format!(
            "webserver = {}",
            cfg.webserver
                .as_ref()
                .map(|w| format!("\"{}\"", w))
                .unwrap_or_else(|| "\"0.0.0.0:8000\"".to_string())
        ),
    );
    field(
        "glob pattern the registry scans for bare AT-command modems",
        format!("serial_glob = \"{}\"", cfg.serial_glob),
    );

    out.push_str("# per-method upper-bound rotation timeouts, seconds\n[method_timeouts]\n");
    out.push_str(&format!(
        "data_toggle_secs = {}\n",
        cfg.method_timeouts.data_toggle_secs
    ));
    out.push_str(&format!(
        "airplane_toggle_secs = {}\n",
        cfg.method_timeouts.airplane_toggle_secs
    ));
    out.push_str(&format!(
        "hilink_dialup_secs = {}\n",
        cfg.method_timeouts.hilink_dialup_secs
    ));
    out.push_str(&format!(
        "hilink_reboot_secs = {}\n",
        cfg.method_timeouts.hilink_reboot_secs
    ));
    out.push_str(&format!(
        "hilink_modeswitch_secs = {}\n",
        cfg.method_timeouts.hilink_modeswitch_secs
    ));
    out.push_str(&format!(
        "usb_reauthorize_secs = {}\n",
        cfg.method_timeouts.usb_reauthorize_secs
    ));
    out.push_str(&format!(
        "at_cfun_cycle_secs = {}\n\n",
        cfg.method_timeouts.at_cfun_cycle_secs
    ));

    out.push_str(
        "# device_id -> kernel network interface name, since correlating a USB\n\
         # device to its udev-assigned interface happens outside this process\n\
         [interface_overrides]\n\n\
         # device_id -> HiLink management-API gateway IP, for devices that\n\
         # don't use the 192.168.8.1 factory default\n\
         [hilink_gateway_overrides]\n\n\
         # device_id -> sysfs device path, for usb_reauthorize\n\
         [sysfs_path_overrides]\n",
    );

    std::fs::write(output_path, out)?;
    Ok(())
}
