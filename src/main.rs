//! ES9018K2M gateway daemon
//!
//! Drives an ES9018K2M DAC over I2C and keeps it in sync with a playback
//! engine reached over a WebSocket.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use es9018k2m_gw::config::{AppConfig, ConfigWatcher};
use es9018k2m_gw::dac::bootstrap::detect;
use es9018k2m_gw::dac::mock::MockTransport;
use es9018k2m_gw::dac::transport::ShellTransport;
use es9018k2m_gw::dac::{BusGateway, BusTransport, RegisterShadow};
use es9018k2m_gw::engine::{PlaybackEngine, SeekInterceptor, WebSocketEngine};
use es9018k2m_gw::feed::EventFeed;
use es9018k2m_gw::{DacController, DacError};

/// How often the status snapshot is logged at debug level
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// ES9018K2M gateway - keep a DAC in sync with a playback engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write daily rolling log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Probe for the DAC once, print the result and exit
    #[arg(long)]
    check: bool,

    /// Use an in-memory register file instead of the bus
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let (log_filter, _log_guard) = init_logging(&args.log_level, args.log_dir.as_deref())?;

    info!("Starting ES9018K2M gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    if args.check {
        let config = AppConfig::load(&args.config).await?;
        return run_check(&config, args.dry_run).await;
    }

    let (config_watcher, initial_config) = ConfigWatcher::new(args.config.clone()).await?;
    let config = (*initial_config).clone();
    apply_log_level(&log_filter, &args.log_level, config.debug_logging);
    info!("Configuration loaded with hot-reload enabled");

    let gateway = BusGateway::spawn(
        build_transport(&config, args.dry_run),
        RegisterShadow::new(),
        config.bus_settings(),
    );
    let controller = DacController::new(gateway, config.controller_settings());

    match controller.bootstrap().await {
        Ok(identity) => info!(
            "DAC ready on bus {} at {:#04x} (revision {})",
            identity.bus, identity.address, identity.revision
        ),
        Err(e @ DacError::DeviceAbsent { .. }) => {
            warn!("{}; running without hardware writes (SIGHUP re-checks)", e)
        }
        Err(e) => warn!("DAC initialization incomplete: {}", e),
    }

    run_app(
        controller,
        config,
        config_watcher,
        log_filter,
        args.log_level,
        shutdown_signal(),
    )
    .await?;

    info!("ES9018K2M gateway shutdown complete");
    Ok(())
}

async fn run_app(
    controller: DacController,
    config: AppConfig,
    mut config_watcher: ConfigWatcher,
    log_filter: FilterHandle,
    log_level: String,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    info!("Connecting to playback engine at {}", config.engine.url);

    let engine: Arc<dyn PlaybackEngine> = Arc::new(WebSocketEngine::new(
        config.engine.url.clone(),
        config.engine.state_url.clone(),
    ));
    let interceptor = SeekInterceptor::new(Arc::clone(&engine));
    interceptor.install(controller.seek_hook());

    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let feed = EventFeed::spawn(engine, config.feed_settings(), updates_tx);

    let (recheck_tx, mut recheck_rx) = mpsc::unbounded_channel();
    spawn_recheck_trigger(recheck_tx);

    let mut status_tick = tokio::time::interval(STATUS_LOG_INTERVAL);
    let mut engine_config = config.engine.clone();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(update) = updates_rx.recv() => {
                controller.handle_update(update);
            }

            Some(new_config) = config_watcher.next_config() => {
                info!("Configuration file changed, applying");
                apply_log_level(&log_filter, &log_level, new_config.debug_logging);
                if new_config.engine != engine_config {
                    warn!("Engine settings changed; they take effect after a restart");
                    engine_config = new_config.engine.clone();
                }
                if let Err(e) = controller.apply_settings(new_config.controller_settings()).await {
                    warn!("Reloaded settings not fully applied: {}", e);
                }
            }

            Some(()) = recheck_rx.recv() => {
                match controller.recheck_device().await {
                    Ok(identity) => info!("Device re-check: found = {}", identity.found),
                    Err(e) => warn!("Device re-check failed: {}", e),
                }
            }

            _ = status_tick.tick() => {
                let status = controller.status(Some(feed.state()));
                match serde_json::to_string(&status) {
                    Ok(json) => debug!("Status: {}", json),
                    Err(e) => debug!("Status not serializable: {}", e),
                }
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    info!("Shutting down...");
    controller.shutdown(Some(feed), Some(&interceptor)).await;
    Ok(())
}

fn build_transport(config: &AppConfig, dry_run: bool) -> Box<dyn BusTransport> {
    if dry_run {
        info!("Dry run: using the in-memory register file");
        return Box::new(MockTransport::new());
    }
    Box::new(ShellTransport::new(
        config.device.bus,
        config.device.address,
        config.device.bus_tool.i2cset.clone(),
        config.device.bus_tool.i2cget.clone(),
    ))
}

/// Probe once and print the result
async fn run_check(config: &AppConfig, dry_run: bool) -> Result<()> {
    use colored::*;

    let transport = build_transport(config, dry_run);
    let target = transport.describe();
    let gateway = BusGateway::spawn(transport, RegisterShadow::new(), config.bus_settings());

    println!("\n{}", "=== ES9018K2M Detection ===".bold().cyan());
    println!("  Target: {}", target.yellow());

    let identity = detect(&gateway, config.device.bus, config.device.address).await;
    if identity.found {
        println!(
            "  Result: {} (revision {})",
            "found".green().bold(),
            identity.revision.to_string().green()
        );
        Ok(())
    } else {
        println!("  Result: {}", "not found".red().bold());
        anyhow::bail!(
            "no ES9018K2M on bus {} at {:#04x}",
            config.device.bus,
            config.device.address
        )
    }
}

/// Forward SIGHUP as a device re-check request
fn spawn_recheck_trigger(tx: mpsc::UnboundedSender<()>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!("SIGHUP handler unavailable, re-check disabled: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });

    #[cfg(not(unix))]
    drop(tx);
}

fn init_logging(level: &str, log_dir: Option<&Path>) -> Result<(FilterHandle, Option<WorkerGuard>)> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "es9018k2m-gw.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(file_layer)
        .try_init()?;

    Ok((handle, guard))
}

/// Raise the filter to `debug` when the config asks for it
///
/// An explicit `RUST_LOG` always wins.
fn apply_log_level(handle: &FilterHandle, level: &str, debug_logging: bool) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let effective = match level {
        "error" | "warn" | "info" if debug_logging => "debug",
        other => other,
    };
    if let Err(e) = handle.reload(EnvFilter::new(effective)) {
        warn!("Failed to change log level: {}", e);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
}
