//! Boot sequence: priority ordering, autostart, critical failures and a
//! full boot with the bundled modules on simulated adapters.

use std::sync::Arc;

use esp_modular::adapters::display::LogDisplay;
use esp_modular::adapters::http::HttpServer;
use esp_modular::adapters::storage::MemFileStore;
use esp_modular::adapters::wifi::WifiAdapter;
use esp_modular::bus::{LCD_LOG_APPEND, log_append_vars, Envelope};
use esp_modular::config::ConfigEngine;
use esp_modular::error::{Error, LifecycleError};
use esp_modular::ports::FileStore;
use esp_modular::module::{
    CONTROL_FS, CONTROL_LCD, CONTROL_RADAR, CONTROL_SERIAL, CONTROL_WEB, CONTROL_WIFI, MAIN_CONTEXT,
};
use esp_modular::modules::{FsModule, LcdModule, WebModule, WifiModule};
use esp_modular::ports::SharedStore;
use esp_modular::registry::FunctionKind;
use esp_modular::{ModuleManager, ModuleState, Registry};
use serde_json::json;

use crate::mock_modules::{MockModule, calls, journal, wait_for};

const BOOT_SET: [(&str, u8, bool); 6] = [
    (CONTROL_WEB, 75, true),
    (CONTROL_RADAR, 50, false),
    (CONTROL_FS, 100, true),
    (CONTROL_SERIAL, 80, false),
    (CONTROL_WIFI, 90, true),
    (CONTROL_LCD, 85, true),
];

#[test]
fn modules_init_in_priority_order_and_autostart_runs() {
    let j = journal();
    let mut mgr = ModuleManager::new(Arc::new(Registry::new()));
    for (name, prio, auto) in BOOT_SET {
        mgr.register_module(Box::new(MockModule::new(name, prio, auto, &j)))
            .unwrap();
    }

    mgr.init_all().unwrap();
    assert_eq!(
        calls(&j, "init:"),
        [CONTROL_FS, CONTROL_WIFI, CONTROL_LCD, CONTROL_SERIAL, CONTROL_WEB, CONTROL_RADAR]
    );
    assert_eq!(mgr.module_names(), calls(&j, "init:"));

    mgr.start_all().unwrap();
    assert_eq!(calls(&j, "start:"), [CONTROL_FS, CONTROL_WIFI, CONTROL_LCD, CONTROL_WEB]);
    for (name, _, auto) in BOOT_SET {
        let expected = if auto { ModuleState::Running } else { ModuleState::Enabled };
        assert_eq!(mgr.module_state(name), Some(expected), "{name}");
    }
}

#[test]
fn failing_critical_module_aborts_start() {
    let j = journal();
    let mut mgr = ModuleManager::new(Arc::new(Registry::new()));
    let mut fs = MockModule::new(CONTROL_FS, 100, true, &j);
    fs.fail_start = true;
    mgr.register_module(Box::new(fs)).unwrap();
    mgr.register_module(Box::new(MockModule::new(CONTROL_LCD, 85, true, &j)))
        .unwrap();
    mgr.with_module(CONTROL_FS, |m| m.core_mut().critical = true);

    mgr.init_all().unwrap();
    assert_eq!(mgr.start_all(), Err(Error::Lifecycle(LifecycleError::StartFailed)));
    assert_eq!(mgr.module_state(CONTROL_FS), Some(ModuleState::Error));
    assert!(calls(&j, "start:").iter().all(|n| n != CONTROL_LCD));
}

#[test]
fn errored_module_must_be_reinitialized_before_start() {
    let j = journal();
    let mut mgr = ModuleManager::new(Arc::new(Registry::new()));
    let mut m = MockModule::new("FLAKY", 10, true, &j);
    m.fail_init = true;
    mgr.register_module(Box::new(m)).unwrap();
    mgr.init_all().unwrap();
    assert_eq!(mgr.module_state("FLAKY"), Some(ModuleState::Error));

    assert!(mgr.start_module("FLAKY").is_err());
    mgr.init_module("FLAKY").unwrap_err();
    assert_eq!(mgr.module_state("FLAKY"), Some(ModuleState::Error));
}

#[test]
fn running_module_is_not_initialized_twice() {
    let j = journal();
    let mut mgr = ModuleManager::new(Arc::new(Registry::new()));
    mgr.register_module(Box::new(MockModule::new("X", 10, true, &j)))
        .unwrap();
    mgr.init_all().unwrap();
    mgr.start_all().unwrap();

    assert_eq!(
        mgr.init_module("X"),
        Err(Error::Lifecycle(LifecycleError::InvalidTransition {
            from: ModuleState::Running,
            to: ModuleState::Enabled,
        }))
    );
    assert_eq!(calls(&j, "init:"), ["X"]);
    assert!(calls(&j, "stop:").is_empty());
    assert_eq!(mgr.module_state("X"), Some(ModuleState::Running));

    mgr.stop_module("X").unwrap();
    assert!(mgr.init_module("X").is_err());
    assert_eq!(calls(&j, "init:"), ["X"]);
    assert_eq!(mgr.module_state("X"), Some(ModuleState::Enabled));
}

fn bundled_boot() -> (ModuleManager, Arc<Registry>, Arc<MemFileStore>) {
    let store = Arc::new(MemFileStore::new());
    let shared: SharedStore = store.clone();
    let registry = Arc::new(Registry::new());
    let config = ConfigEngine::new(shared.clone()).into_shared();

    let mut mgr = ModuleManager::new(Arc::clone(&registry)).with_config(Arc::clone(&config));
    mgr.register_module(Box::new(WebModule::new(Box::new(HttpServer::new()), Arc::clone(&registry))))
        .unwrap();
    mgr.register_module(Box::new(LcdModule::new(Box::new(LogDisplay::new()), Arc::clone(&registry))))
        .unwrap();
    mgr.register_module(Box::new(WifiModule::new(Box::new(WifiAdapter::new()))))
        .unwrap();
    mgr.register_module(Box::new(FsModule::new(shared, config)))
        .unwrap();
    (mgr, registry, store)
}

#[test]
fn bundled_modules_boot_and_web_waits_for_wifi() {
    let (mut mgr, registry, store) = bundled_boot();
    mgr.init_all().unwrap();
    assert_eq!(
        mgr.module_names(),
        [CONTROL_FS, CONTROL_WIFI, CONTROL_LCD, CONTROL_WEB]
    );
    assert!(store.read("/config/config.json").is_ok());
    assert!(registry.find_queue(CONTROL_LCD).is_some());

    mgr.start_all().unwrap();
    for name in [CONTROL_FS, CONTROL_WIFI, CONTROL_LCD] {
        assert_eq!(mgr.module_state(name), Some(ModuleState::Running), "{name}");
    }
    // Default config has no SSID, so the link is down and web is deferred.
    assert_eq!(mgr.module_state(CONTROL_WEB), Some(ModuleState::Enabled));
    assert_eq!(mgr.is_task_suspended(CONTROL_WEB), Some(true));

    // Boot progress reached the display task.
    assert!(wait_for(|| {
        mgr.with_module(CONTROL_LCD, |m| m.status()["last_step"]["op"] == "Start completed")
            .unwrap_or(false)
    }));

    registry.register_function(
        CONTROL_WIFI,
        "connect",
        FunctionKind::ByName { handle_name: "wifi_connect".into() },
    );
    let up = mgr
        .call_function(CONTROL_WIFI, "connect", &json!({ "ssid": "Lab", "password": "password123" }))
        .unwrap();
    assert_eq!(up, true);

    mgr.update_all();
    assert_eq!(mgr.module_state(CONTROL_WEB), Some(ModuleState::Running));
    assert_eq!(mgr.is_task_suspended(CONTROL_WEB), Some(false));
    assert_eq!(
        mgr.with_module(CONTROL_WEB, |m| m.status()["running"].clone()),
        Some(json!(true))
    );
}

#[test]
fn display_log_lines_reach_lcd_task() {
    let (mut mgr, registry, _store) = bundled_boot();
    mgr.init_all().unwrap();
    mgr.start_all().unwrap();

    registry
        .find_queue(CONTROL_LCD)
        .unwrap()
        .try_send(Envelope::notify(
            MAIN_CONTEXT,
            CONTROL_LCD,
            LCD_LOG_APPEND,
            log_append_vars(&["hello", "world"]),
        ))
        .unwrap();
    assert!(wait_for(|| {
        mgr.with_module(CONTROL_LCD, |m| m.status()["lines"] == json!(["hello", "world"]))
            .unwrap_or(false)
    }));
}

#[test]
fn global_config_round_trips_module_settings() {
    let (mut mgr, _registry, _store) = bundled_boot();
    mgr.init_all().unwrap();

    mgr.with_module(CONTROL_LCD, |m| m.core_mut().priority = 42);
    mgr.save_global_config().unwrap();
    mgr.with_module(CONTROL_LCD, |m| m.core_mut().priority = 1);

    mgr.load_global_config().unwrap();
    assert_eq!(mgr.with_module(CONTROL_LCD, |m| m.core().priority), Some(42));
    assert_eq!(mgr.ensure_module_entries().unwrap(), 0);
}
