//! Mock modules and ports shared by the integration tests.
//!
//! `MockModule` records every lifecycle call into a shared journal so
//! tests can assert on ordering across modules.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use esp_modular::adapters::storage::MemFileStore;
use esp_modular::config::ConfigEngine;
use esp_modular::error::{LifecycleError, Result};
use esp_modular::module::{Module, ModuleCore};
use esp_modular::ports::{ResetPort, SharedStore};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Entries of `journal` starting with `prefix`, prefix stripped.
pub fn calls(journal: &Journal, prefix: &str) -> Vec<String> {
    journal
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
        .collect()
}

pub struct MockModule {
    core: ModuleCore,
    journal: Journal,
    pub fail_init: bool,
    pub fail_start: bool,
    /// While set, `update()` spins instead of returning.
    pub stall: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl MockModule {
    pub fn new(name: &str, priority: u8, autostart: bool, journal: &Journal) -> Self {
        Self {
            core: ModuleCore::new(name)
                .with_priority(priority)
                .with_autostart(autostart)
                .with_task(false),
            journal: Arc::clone(journal),
            fail_init: false,
            fail_start: false,
            stall: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_core(core: ModuleCore, journal: &Journal) -> Self {
        Self {
            core,
            journal: Arc::clone(journal),
            fail_init: false,
            fail_start: false,
            stall: Arc::new(AtomicBool::new(false)),
        }
    }

    fn note(&self, what: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{what}:{}", self.core.name()));
    }
}

impl Module for MockModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<()> {
        self.note("init");
        if self.fail_init {
            return Err(LifecycleError::InitFailed.into());
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.note("start");
        if self.fail_start {
            return Err(LifecycleError::StartFailed.into());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.note("stop");
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.stall.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Counts restart requests instead of resetting.
#[derive(Default)]
pub struct MockReset {
    restarts: AtomicU32,
}

impl MockReset {
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl ResetPort for MockReset {
    fn free_heap(&self) -> u32 {
        100_000
    }

    fn min_free_heap(&self) -> u32 {
        90_000
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory store plus an engine initialized at `/config`.
#[allow(dead_code)]
pub fn engine() -> (Arc<MemFileStore>, ConfigEngine) {
    let store = Arc::new(MemFileStore::new());
    let shared: SharedStore = store.clone();
    let mut engine = ConfigEngine::new(shared);
    engine.initialize("/config").unwrap();
    (store, engine)
}

/// Poll `cond` for up to two seconds.
#[allow(dead_code)]
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
