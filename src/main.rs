use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use lumenlink::at::SerialTransport;
use lumenlink::bus::{ApplicationEnd, MessageBus};
use lumenlink::config::{default_config_path, DeviceConfig};
use lumenlink::connectivity::{Collaborators, ConnectivityHandle, Exit, LinkStatus, Supervisor};
use lumenlink::hal::{GpioPowerKey, HeartbeatWatchdog, ModemPower, NoPowerKey, SystemClock};
use lumenlink::ota::FileFirmwareSink;
use lumenlink::persistence::FileStore;
use lumenlink::protocol::{codec, MessageType};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Exit code asking the service manager to start the new firmware image
const RESTART_EXIT_CODE: i32 = 75;
const WATCHDOG_EXIT_CODE: i32 = 70;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = default_config_path();
    let config = DeviceConfig::load_or_init(&config_path).await?;

    let transport = SerialTransport::open(&config.serial.port, config.serial.baud_rate)
        .map_err(|e| eyre!("Failed to open modem port {}: {}", config.serial.port, e))?;
    let store = FileStore::open(&config.store.path)
        .map_err(|e| eyre!("Failed to open store {}: {}", config.store.path.display(), e))?;
    let power = power_key(&config);
    let watchdog = HeartbeatWatchdog::new();
    let cancel = CancellationToken::new();

    let _monitor = watchdog.spawn_monitor(
        Duration::from_secs(config.runtime.watchdog_timeout_s),
        cancel.clone(),
        |starved| {
            error!("Connectivity loop stalled for {:?}, exiting", starved);
            std::process::exit(WATCHDOG_EXIT_CODE);
        },
    );

    let (bus, app) = MessageBus::new(config.runtime.channel_capacity);
    let parts = Collaborators {
        transport,
        power,
        store: Box::new(store),
        firmware: Box::new(FileFirmwareSink::new(config.update.image_dir.clone())),
        clock: Arc::new(SystemClock::new()),
        watchdog: Arc::new(watchdog),
    };
    let status_interval = Duration::from_secs(config.runtime.status_interval_s);
    let supervisor = Supervisor::new(config, parts, bus);
    let handle = ConnectivityHandle::spawn(supervisor, cancel.clone());

    let _app = tokio::spawn(run_application(app, handle.status(), status_interval, cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    let exit = handle.join().await;
    cancel.cancel();
    if exit == Exit::Restart {
        info!("Restarting into new firmware");
        std::process::exit(RESTART_EXIT_CODE);
    }
    info!("Stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn power_key(config: &DeviceConfig) -> Box<dyn ModemPower> {
    match config.power.gpio_pin {
        Some(pin) => match GpioPowerKey::open(pin) {
            Ok(key) => Box::new(key),
            Err(e) => {
                warn!("Power key unavailable, power cycling disabled: {}", e);
                Box::new(NoPowerKey)
            }
        },
        None => Box::new(NoPowerKey),
    }
}

/// Stand-in for the lighting subsystems: logs inbound messages and link changes and asks
/// for a status report at a fixed interval.
async fn run_application(
    mut app: ApplicationEnd,
    mut status: watch::Receiver<LinkStatus>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut heartbeat = (!interval.is_zero()).then(|| tokio::time::interval(interval));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = app.incoming_rx.recv() => match message {
                Some(message) => info!("Inbound message: {}", message),
                None => return,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let link = status.borrow_and_update().clone();
                info!(
                    "Link: {} (mqtt {}, position {})",
                    link.state, link.mqtt_connected, link.gnss_found
                );
            }
            _ = async {
                match heartbeat.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                let request = codec::empty_request(&MessageType::StatusReport);
                if app.outgoing.try_send(request).is_err() {
                    debug!("Outgoing channel full, skipping status report");
                }
            }
        }
    }
}
