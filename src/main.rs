use mobile_ip_gateway::config::AppConfig;
use mobile_ip_gateway::dispatcher::Dispatcher;
use mobile_ip_gateway::registry::DeviceRegistry;
use mobile_ip_gateway::rotation::{auto_rotation_loop, RotationEngine};
use mobile_ip_gateway::{control, proxy};

use clap::Parser;
use humantime::format_duration;
use simplelog::*;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

const NAME: &str = "<i><bright-black> main: </>";

/// Mobile-IP proxy gateway: forward HTTP/CONNECT proxying over rotating
/// cellular uplinks.
#[derive(Parser, Debug)]
#[clap(version, long_about = None, about = format!(
    "📶 mobile-ip-gateway, build: {}, git: {}-{}",
    env!("BUILD_DATE"),
    env!("GIT_DATE"),
    env!("GIT_HASH")
))]
struct Args {
    /// Config file path
    #[clap(
        short,
        long,
        value_parser,
        default_value = "/etc/mobile-ip-gateway/config.toml"
    )]
    config: PathBuf,
}

fn logging_init(debug: bool, disable_console_debug: bool, log_path: &PathBuf) {
    let conf = ConfigBuilder::new()
        .set_time_format("%F, %H:%M:%S%.3f".to_string())
        .set_write_log_enable_colors(true)
        .build();

    let mut loggers = vec![];

    let requested_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let console_logger: Box<dyn SharedLogger> = TermLogger::new(
        if disable_console_debug {
            LevelFilter::Info
        } else {
            requested_level
        },
        conf.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    loggers.push(console_logger);

    let mut logfile_error: Option<String> = None;
    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(logfile) => {
            loggers.push(WriteLogger::new(requested_level, conf, logfile));
        }
        Err(e) => {
            logfile_error = Some(format!(
                "Error creating/opening log file: {:?}: {:?}",
                log_path, e
            ));
        }
    }

    CombinedLogger::init(loggers).expect("Cannot initialize logging subsystem");
    if let Some(err) = logfile_error {
        error!("{} {}", NAME, err);
        warn!("{} Will do console logging only...", NAME);
    }
}

/// Wires up the registry/engine/dispatcher, restores persisted device state,
/// runs one synchronous discovery pass so the pool isn't empty at startup,
/// then spawns every background loop and listener on the current runtime.
async fn run(config: AppConfig, config_file: PathBuf) -> anyhow::Result<()> {
    let proxy_port = config.proxy_port;
    let api_port = config.api_port;
    let webserver = config.webserver.clone();
    let discovery_interval = config.discovery_interval_secs;
    let health_interval = config.health_interval_secs;
    let ip_refresh_secs = config.ip_refresh_secs;

    let config: mobile_ip_gateway::config::SharedConfig = Arc::new(RwLock::new(config));
    let registry = DeviceRegistry::new(config.clone());
    registry.load_state().await;
    registry.discover_once().await;

    let engine = RotationEngine::spawn(registry.clone(), config.clone());
    let dispatcher = Dispatcher::new(registry.clone(), config.clone());

    tokio::spawn(registry.clone().discovery_loop(discovery_interval));
    tokio::spawn(registry.clone().health_loop(health_interval, ip_refresh_secs));
    tokio::spawn(auto_rotation_loop(engine.clone(), registry.clone()));

    let state = Arc::new(control::AppState::new(
        registry.clone(),
        engine.clone(),
        dispatcher.clone(),
        config.clone(),
    ));

    let dedicated_devices: Vec<(u16, String)> = registry
        .list()
        .await
        .into_iter()
        .filter_map(|d| d.dedicated.map(|b| (b.listen_port, d.device_id)))
        .collect();
    for (port, device_id) in dedicated_devices {
        info!(
            "{} 🔌 restoring dedicated port {} for device {}",
            NAME, port, device_id
        );
        state.spawn_dedicated_listener(port).await;
    }

    let shared_bind: SocketAddr = ([0, 0, 0, 0], proxy_port).into();
    let proxy_handle = tokio::spawn(proxy::run_shared(
        shared_bind,
        dispatcher.clone(),
        registry.clone(),
        config.clone(),
    ));

    if let Some(bindaddr) = webserver {
        let app = control::app(state);

        let addr = bindaddr
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| ([0, 0, 0, 0], api_port).into());
        info!("{} ⚙️ control API listening at http://{addr}/", NAME);
        tokio::spawn(async move {
            if let Err(e) = hyper::Server::bind(&addr).serve(app.into_make_service()).await {
                error!("{} control API exited: {}", NAME, e);
            }
        });
    } else {
        info!("{} ⚙️ control API disabled (webserver = none)", NAME);
    }

    let _ = config_file;
    proxy_handle.await??;
    Ok(())
}

fn main() {
    let started = Instant::now();

    let args = Args::parse();
    let config = AppConfig::load(args.config.clone()).unwrap_or_default();

    logging_init(config.debug, config.disable_console_debug, &config.logfile);
    info!(
        "📶 <b><blue>mobile-ip-gateway</> is starting, build: {}, git: {}-{}",
        env!("BUILD_DATE"),
        env!("GIT_DATE"),
        env!("GIT_HASH")
    );

    if args.config.exists() {
        info!(
            "{} ⚙️ config loaded from file: {}",
            NAME,
            args.config.display()
        );
    } else {
        warn!(
            "{} ⚙️ config file: {} doesn't exist, defaults used",
            NAME,
            args.config.display()
        );
    }
    debug!("{} ⚙️ startup configuration: {:#?}", NAME, config);

    info!(
        "{} 📡 shared proxy port: <b><green>{}</>, dedicated pool: {:?}",
        NAME, config.proxy_port, config.dedicated_port_range
    );
    info!(
        "{} 📜 Log file path: <b><green>{}</>",
        NAME,
        config.logfile.display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    if let Err(e) = runtime.block_on(run(config, args.config)) {
        error!("{} fatal: {}", NAME, e);
    }

    info!(
        "🚩 mobile-ip-gateway terminated, running time: {}",
        format_duration(started.elapsed())
    );
}
