//! handoff monitor daemon.
//!
//! Single-writer service that owns the heartbeat, status, routing and
//! snapshot artifacts. It runs the monitor's timers on the main thread until
//! interrupted, then removes the heartbeat and exits.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use handoff_core::{load_config, Monitor, MonitorConfig, MonitorDeps, StorageConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod backoff;

/// Longest uninterrupted sleep, so a stop request is noticed promptly.
const MAX_IDLE: Duration = Duration::from_millis(500);

fn main() {
    init_logging();

    let storage = match StorageConfig::from_env() {
        Ok(storage) => storage,
        Err(err) => {
            error!(error = %err, "Failed to resolve storage paths");
            std::process::exit(1);
        }
    };

    backoff::apply_startup_backoff(&storage.backoff_file());

    let config = match load_config(&storage.config_file()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load monitor config; using defaults");
            MonitorConfig::default()
        }
    };
    info!(
        min_active = config.consensus.min_active,
        practical_limit = config.usage.practical_limit,
        consensus_secs = config.intervals.consensus_secs,
        log_scan_secs = config.intervals.log_scan_secs,
        "Monitor config loaded"
    );

    let deps = MonitorDeps::standard(&config, &storage);
    let mut monitor = Monitor::new(config, storage, deps);
    monitor.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let stop = monitor.stop_handle();
        if let Err(err) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            stop.store(true, Ordering::SeqCst);
        }) {
            warn!(error = %err, "Failed to install signal handler");
        }
    }

    info!(session_id = %monitor.session_id(), "handoff daemon started");

    while !shutdown.load(Ordering::SeqCst) {
        monitor.run_due();
        let idle = monitor.until_next().unwrap_or(MAX_IDLE).min(MAX_IDLE);
        thread::sleep(idle);
    }

    info!(state = %monitor.state(), "Shutdown requested");
    monitor.stop();
}

fn init_logging() {
    let debug_enabled = env::var("HANDOFF_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
