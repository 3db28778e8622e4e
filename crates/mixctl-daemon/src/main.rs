// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! mixctl Daemon - sound device service.
//!
//! This daemon follows the PulseAudio server, keeps the user-facing input and
//! output device model current and exposes it over D-Bus.

mod config;
mod dbus;
mod pulse;
mod service;

use config::{ConfigError, DaemonConfig};
use dbus::DaemonDbusService;
use mixctl::MixerEvent;
use mixctl_ipc::{DBUS_NAME, DBUS_PATH};
use parking_lot::Mutex;
use service::MixerService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use zbus::connection::Builder;

const DEFAULT_LOG_FILTER: &str = "mixctl=debug,mixctl_daemon=debug,zbus=warn";

/// How often backend events are fed to the mixer control.
const EVENT_INTERVAL: Duration = Duration::from_millis(50);

/// Build the log filter from `RUST_LOG` (or the defaults) plus the
/// configured directives. Returns the directives that did not parse.
fn log_filter(config: Option<&DaemonConfig>) -> (EnvFilter, Vec<String>) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let mut rejected = Vec::new();
    let extra = config.and_then(|c| c.log_filter.as_deref()).unwrap_or_default();
    for directive in extra.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(_) => rejected.push(directive.to_string()),
        }
    }
    (filter, rejected)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration is read first so it can adjust logging
    let config_manager = config::ConfigManager::new()?;
    let loaded: Result<DaemonConfig, ConfigError> = config_manager.load_or_create();

    let (filter, rejected) = log_filter(loaded.as_ref().ok());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mixctl daemon starting...");
    for directive in rejected {
        warn!("Ignoring invalid log directive '{}'", directive);
    }
    let daemon_config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load {:?}: {}, using defaults", config_manager.config_path(), e);
            DaemonConfig::default()
        }
    };
    info!(
        "Sound server: {}, client name '{}'",
        daemon_config.server.as_deref().unwrap_or("default"),
        daemon_config.client_name
    );

    // Mixer events become D-Bus signals
    let (event_tx, event_rx) = tokio_mpsc::unbounded_channel::<MixerEvent>();

    let mut mixer_service = MixerService::new(&daemon_config);
    mixer_service.set_event_sender(event_tx);
    if let Err(e) = mixer_service.start() {
        warn!("Initial connection failed: {} (will retry)", e);
    }

    let service = Arc::new(Mutex::new(mixer_service));

    let dbus_service = DaemonDbusService::new(service.clone());

    let connection = Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, dbus_service)?
        .build()
        .await?;

    info!("D-Bus service registered at {}", DBUS_NAME);
    info!("mixctl daemon ready");

    let shutdown_flag = Arc::new(AtomicBool::new(false));

    // Feed backend events to the control
    let service_events = service.clone();
    let shutdown_flag_events = shutdown_flag.clone();
    let event_task = tokio::spawn(async move {
        while !shutdown_flag_events.load(Ordering::Relaxed) {
            tokio::time::sleep(EVENT_INTERVAL).await;
            service_events.lock().process_events();
        }
    });

    // Re-emit mixer events as D-Bus signals
    let shutdown_flag_signals = shutdown_flag.clone();
    let signal_task = tokio::spawn(async move {
        let mut event_rx = event_rx;
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    let object_server = connection.object_server();
                    let iface_ref = match object_server.interface::<_, DaemonDbusService>(DBUS_PATH).await {
                        Ok(iface) => iface,
                        Err(e) => {
                            warn!("Failed to get D-Bus interface for signal: {}", e);
                            continue;
                        }
                    };
                    debug!("Emitting D-Bus signal for {:?}", event);
                    if let Err(e) = dbus::emit_event(iface_ref.signal_context(), &event).await {
                        warn!("Failed to emit signal for {:?}: {}", event, e);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if shutdown_flag_signals.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    shutdown_flag.store(true, Ordering::Relaxed);

    let _ = tokio::time::timeout(Duration::from_secs(2), event_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), signal_task).await;

    service.lock().shutdown();

    info!("mixctl daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_rejects_bad_directives() {
        let config = DaemonConfig {
            log_filter: Some("mixctl=trace, ,mixctl=[".into()),
            ..DaemonConfig::default()
        };
        let (_, rejected) = log_filter(Some(&config));
        assert_eq!(rejected, vec!["mixctl=[".to_string()]);
    }
}
