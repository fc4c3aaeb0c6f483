//! Watchdog escalation: a module task stuck in `update()` trips the
//! system timeout exactly once; healthy tasks never do.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use esp_modular::module::ModuleCore;
use esp_modular::ports::ResetPort;
use esp_modular::watchdog::Watchdog;
use esp_modular::{ModuleManager, Registry};

use crate::mock_modules::{MockModule, MockReset, journal};

const TIMEOUT_MS: u32 = 200;

fn tasked_manager(reset: &Arc<MockReset>) -> (ModuleManager, Watchdog, MockModule) {
    let port: Arc<dyn ResetPort> = reset.clone();
    let wd = Watchdog::new(port);
    wd.initialize(TIMEOUT_MS).unwrap();

    let j = journal();
    let module = MockModule::with_core(
        ModuleCore::new("CONTROL_SERIAL")
            .with_priority(80)
            .with_autostart(true),
        &j,
    );
    let mgr = ModuleManager::new(Arc::new(Registry::new())).with_watchdog(wd.clone());
    (mgr, wd, module)
}

/// Feed the system timer from this thread for `window`, stopping early if
/// the watchdog fires.
fn feed_for(wd: &Watchdog, window: Duration) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline && !wd.has_fired() {
        wd.feed();
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn stalled_task_triggers_single_restart() {
    let reset = Arc::new(MockReset::default());
    let (mut mgr, wd, module) = tasked_manager(&reset);
    let stall = Arc::clone(&module.stall);

    mgr.register_module(Box::new(module)).unwrap();
    mgr.init_all().unwrap();
    mgr.start_all().unwrap();
    stall.store(true, Ordering::SeqCst);
    wd.start().unwrap();

    let started = Instant::now();
    feed_for(&wd, Duration::from_millis(u64::from(TIMEOUT_MS) + 200 + 600));
    assert!(wd.has_fired(), "no restart after {:?}", started.elapsed());
    assert_eq!(reset.restarts(), 1);

    feed_for(&wd, Duration::from_millis(u64::from(TIMEOUT_MS) * 2));
    assert_eq!(reset.restarts(), 1);

    stall.store(false, Ordering::SeqCst);
    wd.stop();
    mgr.stop_all();
}

#[test]
fn healthy_task_is_never_reset() {
    let reset = Arc::new(MockReset::default());
    let (mut mgr, wd, module) = tasked_manager(&reset);

    mgr.register_module(Box::new(module)).unwrap();
    mgr.init_all().unwrap();
    mgr.start_all().unwrap();
    wd.start().unwrap();

    feed_for(&wd, Duration::from_millis(u64::from(TIMEOUT_MS) * 4));
    assert!(!wd.has_fired());
    assert_eq!(reset.restarts(), 0);
    assert_eq!(wd.status()["subscribed_tasks"].as_array().map(Vec::len), Some(1));

    wd.stop();
    mgr.stop_all();
}

#[test]
fn silent_main_loop_triggers_restart() {
    let reset = Arc::new(MockReset::default());
    let port: Arc<dyn ResetPort> = reset.clone();
    let wd = Watchdog::new(port);
    wd.initialize(TIMEOUT_MS).unwrap();
    wd.start().unwrap();

    let deadline = Instant::now() + Duration::from_millis(u64::from(TIMEOUT_MS) * 5);
    while Instant::now() < deadline && !wd.has_fired() {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(wd.has_fired());
    assert_eq!(reset.restarts(), 1);
    wd.stop();
}
