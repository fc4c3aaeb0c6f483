//! esp-modular firmware entry point.
//!
//! ```text
//!   logger ─► SPIFFS ─► registry · config · watchdog
//!                              │
//!            register FS · WIFI · LCD · WEB
//!                              │
//!            init_all ─► watchdog up ─► start_all
//!                              │
//!            loop { update_all · feed · health }
//! ```
#![deny(unused_must_use)]

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::Result;
use log::{LevelFilter, error, info, warn};

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};

use esp_modular::adapters::display::LogDisplay;
use esp_modular::adapters::http::HttpServer;
use esp_modular::adapters::log_sink::FileLogSink;
use esp_modular::adapters::storage::{StdFileStore, mount_spiffs};
use esp_modular::adapters::system::EspSystem;
use esp_modular::adapters::time::uptime_ms;
use esp_modular::adapters::wifi::WifiAdapter;
use esp_modular::config::{ConfigEngine, SharedConfig};
use esp_modular::health::{SystemMetrics, install_panic_hook};
use esp_modular::modules::{FsModule, LcdModule, WebModule, WifiModule};
use esp_modular::ports::SharedStore;
use esp_modular::watchdog::{DEFAULT_SYSTEM_TIMEOUT_MS, Watchdog};
use esp_modular::{Error, ModuleManager, Registry};

const MOUNT_POINT: &core::ffi::CStr = c"/spiffs";
const LOG_QUEUE_DEPTH: usize = 64;
const LOOP_PERIOD: Duration = Duration::from_millis(50);
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;

fn config_u64(config: &SharedConfig, path: &str) -> Option<u64> {
    config
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_value(path)
        .and_then(|v| v.as_u64())
}

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap + logging ────────────────────────
    esp_idf_svc::sys::link_patches();
    let (sink, log_rx) = FileLogSink::new(Some(Box::new(EspLogger::new())), LevelFilter::Info, LOG_QUEUE_DEPTH);
    sink.install()
        .map_err(|e| anyhow::anyhow!("logger install failed: {e}"))?;
    install_panic_hook();

    info!("╔══════════════════════════════════════╗");
    info!("║  esp-modular v{}                  ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Storage ────────────────────────────────────────────
    mount_spiffs(MOUNT_POINT).map_err(Error::from)?;
    let store: SharedStore = Arc::new(StdFileStore::new("/spiffs").map_err(Error::from)?);

    // ── 3. Core handles ───────────────────────────────────────
    let registry = Arc::new(Registry::new());
    let config = ConfigEngine::new(Arc::clone(&store)).into_shared();
    let reset = Arc::new(EspSystem::new());
    let watchdog = Watchdog::new(reset.clone());

    // ── 4. Radio ──────────────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let wifi = BlockingWifi::wrap(EspWifi::new(peripherals.modem, sysloop.clone(), Some(nvs))?, sysloop)?;

    // ── 5. Modules ────────────────────────────────────────────
    let mut manager = ModuleManager::new(Arc::clone(&registry))
        .with_watchdog(watchdog.clone())
        .with_config(Arc::clone(&config));
    manager
        .register_module(Box::new(
            FsModule::new(Arc::clone(&store), Arc::clone(&config)).with_log_receiver(log_rx),
        ))
        .map_err(Error::from)?;
    manager
        .register_module(Box::new(WifiModule::new(Box::new(WifiAdapter::with_driver(wifi)))))
        .map_err(Error::from)?;
    manager
        .register_module(Box::new(LcdModule::new(Box::new(LogDisplay::new()), Arc::clone(&registry))))
        .map_err(Error::from)?;
    manager
        .register_module(Box::new(WebModule::new(Box::new(HttpServer::new()), Arc::clone(&registry))))
        .map_err(Error::from)?;

    // ── 6. Boot ───────────────────────────────────────────────
    if let Err(e) = manager.init_all() {
        error!("Boot: init aborted: {}", e);
        return Err(e.into());
    }
    match manager.ensure_module_entries() {
        Ok(0) => {}
        Ok(n) => {
            info!("Boot: added {} module entries to config", n);
            if let Err(e) = manager.save_global_config() {
                warn!("Boot: config save failed: {}", e);
            }
        }
        Err(e) => warn!("Boot: module entries not ensured: {}", e),
    }

    let wdt_timeout = config_u64(&config, "system.watchdog.timeout_ms")
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(DEFAULT_SYSTEM_TIMEOUT_MS);
    watchdog.initialize(wdt_timeout).map_err(Error::from)?;
    watchdog.start().map_err(Error::from)?;

    if let Err(e) = manager.start_all() {
        error!("Boot: start aborted: {}", e);
        return Err(e.into());
    }
    info!("System ready. Entering main loop.");

    // ── 7. Main loop ──────────────────────────────────────────
    let health_interval =
        config_u64(&config, "monitoring.health_check_interval").unwrap_or(DEFAULT_HEALTH_INTERVAL_MS);
    let mut next_health = uptime_ms() + health_interval;

    loop {
        manager.update_all();
        watchdog.feed();

        if uptime_ms() >= next_health {
            next_health = uptime_ms() + health_interval;
            let metrics = SystemMetrics::collect(reset.as_ref(), &manager.status());
            if metrics.is_degraded() {
                warn!(
                    "Health: degraded ({} in error, {} tasks unhealthy, heap {} B)",
                    metrics.modules_error, metrics.tasks_unhealthy, metrics.heap_free
                );
            } else {
                info!(
                    "Health: {}/{} running, heap {} B (min {} B)",
                    metrics.modules_running, metrics.modules_total, metrics.heap_free, metrics.heap_min_free
                );
            }
        }

        std::thread::sleep(LOOP_PERIOD);
    }
}
