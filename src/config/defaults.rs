//! Compiled-in defaults: the global configuration document and the files
//! the filesystem module lays down on first boot.

use serde_json::{Value, json};

use crate::module::{CONTROL_FS, CONTROL_LCD, CONTROL_RADAR, CONTROL_SERIAL, CONTROL_WEB, CONTROL_WIFI};

/// Firmware version written to the `/.init` marker.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn module(priority: u8, autostart: bool, critical: bool, stack: u32, core: i8, queue: Option<u8>) -> Value {
    json!({
        "state": "enabled",
        "priority": priority,
        "version": "1.0.0",
        "autostart": autostart,
        "debug": false,
        "critical": critical,
        "freertos": {
            "task": { "stack": stack, "priority": 3, "core": core, "enabled": true },
            "queue": {
                "length": queue.unwrap_or(8),
                "send_timeout_ms": -1,
                "recv_timeout_ms": 100,
                "enabled": queue.is_some(),
            },
        },
        "watchdog": { "enabled": true, "timeout_ms": 5_000, "auto_restart": true },
    })
}

/// The default global configuration at the current version.
pub fn default_document() -> Value {
    let mut modules = serde_json::Map::new();
    modules.insert(CONTROL_FS.into(), module(100, true, true, 6144, 0, None));
    modules.insert(CONTROL_WIFI.into(), module(90, true, false, 4096, 0, None));
    modules.insert(CONTROL_LCD.into(), module(85, true, false, 4096, 1, Some(16)));
    modules.insert(CONTROL_SERIAL.into(), module(80, true, false, 4096, 1, Some(8)));
    modules.insert(CONTROL_WEB.into(), module(75, true, false, 8192, 0, Some(8)));
    modules.insert(CONTROL_RADAR.into(), module(50, false, false, 4096, 1, Some(8)));

    json!({
        "version": super::CURRENT_VERSION.to_string(),
        "system": {
            "name": "ESP32_Modular_System",
            "debug": false,
            "timezone": "UTC",
            "watchdog": { "enabled": true, "timeout_ms": 10_000, "reset_on_timeout": true },
        },
        "filesystem": {
            "max_size": 2_097_152,
            "log_max_size": 1_048_576,
            "auto_format": false,
            "enable_cache": true,
        },
        "backup_settings": { "auto_backup": true, "backup_count": 10, "backup_interval_hours": 24 },
        "monitoring": { "enabled": true, "health_check_interval": 30_000, "performance_tracking": true },
        "wifi": { "ssid": "", "password": "" },
        "web": { "port": 80 },
        "modules": modules,
    })
}

/// Files (path, content) created when the `/.init` marker is missing or
/// stale. `/config/config.json` is written by the config engine.
pub fn default_files() -> Vec<(&'static str, String)> {
    vec![
        ("/web/index.html", include_str!("index.html").to_string()),
        ("/logs/system.log", String::new()),
        ("/logs/debug.log", String::new()),
    ]
}
