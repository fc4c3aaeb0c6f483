//! Lifecycle manager.
//!
//! Owns the registered modules, drives the state machine and wires tasks,
//! queues and boot progress.
//!
//! ```text
//!   register_module ─► init_all ─► start_all ─► loop { update_all; feed }
//!                      (priority     (autostart:
//!                       desc, load    start, queue,
//!                       config, init) spawn task)
//! ```
//!
//! Every module sits behind its own mutex. The manager, the module's task
//! and by-name registry calls all take that lock, so at most one of them
//! touches a module at a time. The lock is never held while a task is
//! joined. Lock order is module first, then the config engine.

use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde_json::{Map, Value, json};

use crate::adapters::time::uptime_ms;
use crate::bus::{
    Envelope, LCD_BOOT_STEP, LCD_LOG_APPEND, ModuleQueue, boot_step_vars, log_append_vars,
};
use crate::config::SharedConfig;
use crate::error::{ConfigError, LifecycleError, RegistryError, Result};
use crate::module::{
    CONTROL_LCD, CONTROL_WEB, CONTROL_WIFI, ConfigState, MAIN_CONTEXT, Module, ModuleName,
    ModuleState, module_name,
};
use crate::registry::{FunctionResult, NameDispatch, Registry};
use crate::task::{TaskContext, TaskHealth, TaskRunner, WATCHDOG_MIN_PRIORITY};
use crate::watchdog::Watchdog;

pub type ModuleSlot = Arc<Mutex<Box<dyn Module>>>;

fn lock(slot: &ModuleSlot) -> MutexGuard<'_, Box<dyn Module>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Entry {
    name: ModuleName,
    slot: ModuleSlot,
    runner: Option<TaskRunner>,
}

impl Entry {
    fn has_live_task(&self) -> bool {
        self.runner.as_ref().is_some_and(|r| !r.is_finished())
    }
}

pub struct ModuleManager {
    entries: Vec<Entry>,
    registry: Arc<Registry>,
    watchdog: Option<Watchdog>,
    config: Option<SharedConfig>,
    /// Last observed `CONTROL_WIFI.isConnected`.
    wifi_connected: Option<bool>,
}

impl ModuleManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            entries: Vec::new(),
            registry,
            watchdog: None,
            config: None,
            wifi_connected: None,
        }
    }

    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SharedConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ───────────────────────────────────────────────────────────
    // Collection
    // ───────────────────────────────────────────────────────────

    pub fn register_module(&mut self, module: Box<dyn Module>) -> core::result::Result<(), RegistryError> {
        let name = module_name(module.name());
        if self.position(&name).is_some() {
            warn!("Manager: module '{}' already registered", name);
            return Err(RegistryError::AlreadyRegistered);
        }
        info!("Manager: registered '{}'", name);
        self.entries.push(Entry {
            name,
            slot: Arc::new(Mutex::new(module)),
            runner: None,
        });
        Ok(())
    }

    /// Stop, tear down the task and queue, and drop the module.
    pub fn unregister_module(&mut self, name: &str) -> core::result::Result<(), RegistryError> {
        let idx = self.position(name).ok_or(RegistryError::NotFound)?;
        let mut entry = self.entries.remove(idx);
        {
            let mut m = lock(&entry.slot);
            if m.core().state() == ModuleState::Running {
                if let Err(e) = m.stop() {
                    warn!("Manager: stop of '{}' failed during unregister: {}", name, e);
                }
            }
        }
        if let Some(mut runner) = entry.runner.take() {
            runner.shutdown();
        }
        {
            let mut m = lock(&entry.slot);
            m.core_mut().attach_task(None);
            drop(m.core_mut().take_queue());
        }
        self.registry.unregister_task(name);
        self.registry.unregister_queue(name);
        info!("Manager: unregistered '{}'", name);
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name.as_str() == name)
    }

    pub fn get_module(&self, name: &str) -> Option<ModuleSlot> {
        self.position(name).map(|i| Arc::clone(&self.entries[i].slot))
    }

    /// Run `f` on the named module under its lock.
    pub fn with_module<R>(&self, name: &str, f: impl FnOnce(&mut dyn Module) -> R) -> Option<R> {
        let slot = self.get_module(name)?;
        let mut m = lock(&slot);
        Some(f(&mut **m))
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.with_module(name, |m| m.core().state())
    }

    /// Names in current order.
    pub fn module_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stable, descending priority.
    pub fn sort_by_priority(&mut self) {
        self.entries
            .sort_by_cached_key(|e| Reverse(lock(&e.slot).core().priority));
    }

    pub fn task_health(&self, name: &str) -> Option<TaskHealth> {
        let idx = self.position(name)?;
        self.entries[idx].runner.as_ref().map(TaskRunner::health)
    }

    pub fn is_task_suspended(&self, name: &str) -> Option<bool> {
        let idx = self.position(name)?;
        self.entries[idx].runner.as_ref().map(TaskRunner::is_suspended)
    }

    // ───────────────────────────────────────────────────────────
    // Boot
    // ───────────────────────────────────────────────────────────

    /// Sort, load each module's config subtree and init in priority order.
    /// A critical failure aborts; others leave the module in `Error`.
    pub fn init_all(&mut self) -> Result<()> {
        self.sort_by_priority();
        let n = self.entries.len().max(1);
        let registry = Arc::clone(&self.registry);

        for (idx, entry) in self.entries.iter().enumerate() {
            let percent = percent(idx, n);
            // Re-read per module: the filesystem module loads the document
            // during its own init.
            let global = self.config_snapshot();
            let mut m = lock(&entry.slot);
            if let Some(doc) = &global {
                if !m.load_config(doc) {
                    debug!("Manager: no config entry for '{}'", entry.name);
                }
            }
            if m.core().desired == ConfigState::Disabled {
                info!("Manager: '{}' disabled by config", entry.name);
                continue;
            }

            boot_step(&registry, &format!("Init {}", entry.name), percent);
            match init_locked(&mut **m) {
                Ok(()) => {
                    ensure_queue(&registry, &mut **m);
                    info!("Manager: '{}' initialized", entry.name);
                    boot_step(&registry, &format!("Initialized {}", entry.name), percent);
                }
                Err(e) => {
                    boot_error(&registry, &format!("Init {} failed: {}", entry.name, e));
                    if m.core().critical {
                        error!("Manager: critical module '{}' failed to init, aborting", entry.name);
                        return Err(LifecycleError::InitFailed.into());
                    }
                }
            }
        }

        boot_step(&registry, "Init completed", 100);
        Ok(())
    }

    /// Start every `autostart` module in `Enabled`, then ensure its queue
    /// and spawn its task. `CONTROL_WEB` waits for WiFi: its task is
    /// spawned suspended and the rising edge in `update_all` starts it.
    pub fn start_all(&mut self) -> Result<()> {
        self.wifi_connected = self.wifi_link();
        let wifi_down = self.wifi_connected == Some(false);
        let registry = Arc::clone(&self.registry);
        let watchdog = self.watchdog.clone();

        let targets: Vec<usize> = (0..self.entries.len())
            .filter(|&i| {
                let m = lock(&self.entries[i].slot);
                m.core().autostart && m.core().state() == ModuleState::Enabled
            })
            .collect();
        let total = targets.len().max(1);

        for (done, idx) in targets.into_iter().enumerate() {
            let entry = &mut self.entries[idx];
            boot_step(&registry, &format!("Start {}", entry.name), percent(done, total));

            if wifi_down && entry.name.as_str() == CONTROL_WEB {
                info!("Manager: WiFi down, deferring '{}'", entry.name);
                ensure_queue(&registry, &mut **lock(&entry.slot));
                if let Err(e) = spawn_task(&registry, watchdog.as_ref(), entry) {
                    warn!("Manager: task for '{}' not spawned: {}", entry.name, e);
                }
                if let Some(r) = &entry.runner {
                    r.suspend();
                }
                continue;
            }

            let started = {
                let mut m = lock(&entry.slot);
                let r = start_locked(&mut **m);
                if r.is_ok() {
                    ensure_queue(&registry, &mut **m);
                }
                r.map_err(|e| (e, m.core().critical))
            };
            match started {
                Ok(()) => {
                    if let Err(e) = spawn_task(&registry, watchdog.as_ref(), entry) {
                        boot_error(&registry, &format!("Task {} failed: {}", entry.name, e));
                    }
                    info!("Manager: '{}' running", entry.name);
                }
                Err((e, critical)) => {
                    boot_error(&registry, &format!("Start {} failed: {}", entry.name, e));
                    if critical {
                        error!("Manager: critical module '{}' failed to start, aborting", entry.name);
                        return Err(LifecycleError::StartFailed.into());
                    }
                }
            }
        }

        boot_step(&registry, "Start completed", 100);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Runtime
    // ───────────────────────────────────────────────────────────

    /// One pass of the main loop: WiFi/web wiring, then `update()` on
    /// every active module that is not driven by its own task.
    pub fn update_all(&mut self) {
        self.track_wifi();
        for entry in &self.entries {
            if entry.has_live_task() {
                continue;
            }
            let mut m = lock(&entry.slot);
            if !m.core().state().is_active() {
                continue;
            }
            if let Err(e) = m.update() {
                warn!("Manager: update of '{}' failed: {}", entry.name, e);
                let _ = m.core_mut().set_state(ModuleState::Error);
            }
        }
    }

    fn wifi_link(&self) -> Option<bool> {
        self.with_module(CONTROL_WIFI, |m| m.status().get("isConnected").and_then(Value::as_bool))
            .flatten()
    }

    fn track_wifi(&mut self) {
        let Some(now) = self.wifi_link() else {
            return;
        };
        match self.wifi_connected.replace(now) {
            Some(true) if !now => self.on_wifi_lost(),
            Some(false) if now => self.on_wifi_up(),
            _ => {}
        }
    }

    fn on_wifi_lost(&mut self) {
        let Some(idx) = self.position(CONTROL_WEB) else {
            return;
        };
        info!("Manager: WiFi lost, stopping '{}'", CONTROL_WEB);
        let entry = &self.entries[idx];
        if let Some(r) = &entry.runner {
            r.suspend();
        }
        let mut m = lock(&entry.slot);
        if m.core().state() == ModuleState::Running {
            if let Err(e) = stop_locked(&mut **m) {
                warn!("Manager: stop of '{}' failed: {}", CONTROL_WEB, e);
            }
        }
    }

    fn on_wifi_up(&mut self) {
        let Some(idx) = self.position(CONTROL_WEB) else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let watchdog = self.watchdog.clone();
        let entry = &mut self.entries[idx];
        let started = {
            let mut m = lock(&entry.slot);
            match m.core().state() {
                ModuleState::Enabled => start_locked(&mut **m).map(|()| true),
                ModuleState::Running => Ok(true),
                _ => Ok(false),
            }
        };
        match started {
            Ok(true) => {
                info!("Manager: WiFi up, '{}' running", CONTROL_WEB);
                if entry.runner.is_none() {
                    if let Err(e) = spawn_task(&registry, watchdog.as_ref(), entry) {
                        warn!("Manager: task for '{}' not spawned: {}", entry.name, e);
                    }
                }
                if let Some(r) = &entry.runner {
                    r.resume();
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Manager: start of '{}' failed: {}", CONTROL_WEB, e),
        }
    }

    /// Stop every running module, lowest priority first.
    pub fn stop_all(&mut self) {
        for entry in self.entries.iter().rev() {
            let mut m = lock(&entry.slot);
            if m.core().state() == ModuleState::Running {
                if let Err(e) = stop_locked(&mut **m) {
                    warn!("Manager: stop of '{}' failed: {}", entry.name, e);
                }
            }
        }
    }

    // ── Individual control ────────────────────────────────────

    /// Init a `Disabled` or `Error` module; anything else is refused.
    pub fn init_module(&mut self, name: &str) -> Result<()> {
        let slot = self.get_module(name).ok_or(RegistryError::NotFound)?;
        let mut m = lock(&slot);
        init_locked(&mut **m)?;
        ensure_queue(&self.registry, &mut **m);
        Ok(())
    }

    pub fn start_module(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name).ok_or(RegistryError::NotFound)?;
        let registry = Arc::clone(&self.registry);
        let watchdog = self.watchdog.clone();
        let entry = &mut self.entries[idx];
        {
            let mut m = lock(&entry.slot);
            start_locked(&mut **m)?;
            ensure_queue(&registry, &mut **m);
        }
        if entry.runner.is_none() {
            spawn_task(&registry, watchdog.as_ref(), entry)?;
        }
        if let Some(r) = &entry.runner {
            r.resume();
        }
        Ok(())
    }

    pub fn stop_module(&mut self, name: &str) -> Result<()> {
        let slot = self.get_module(name).ok_or(RegistryError::NotFound)?;
        let mut m = lock(&slot);
        stop_locked(&mut **m)
    }

    /// Run the module's self-test.
    pub fn test_module(&self, name: &str) -> Result<()> {
        let slot = self.get_module(name).ok_or(RegistryError::NotFound)?;
        let mut m = lock(&slot);
        m.test().map_err(|e| {
            warn!("Manager: self-test of '{}' failed: {}", name, e);
            LifecycleError::Unhealthy.into()
        })
    }

    /// Registry call routed through this manager for `ByName` entries.
    pub fn call_function(&self, module: &str, function: &str, params: &Value) -> FunctionResult {
        self.registry.call_function(module, function, params, Some(self))
    }

    // ───────────────────────────────────────────────────────────
    // Configuration
    // ───────────────────────────────────────────────────────────

    fn config_snapshot(&self) -> Option<Value> {
        let cfg = self.config.as_ref()?;
        let engine = cfg.lock().unwrap_or_else(PoisonError::into_inner);
        Some(engine.current().clone())
    }

    fn config(&self) -> core::result::Result<&SharedConfig, ConfigError> {
        self.config.as_ref().ok_or(ConfigError::NotInitialized)
    }

    /// Load from storage and route the result to every module.
    pub fn load_global_config(&mut self) -> Result<()> {
        let doc = {
            let mut engine = self.config()?.lock().unwrap_or_else(PoisonError::into_inner);
            engine.load()?;
            engine.current().clone()
        };
        self.apply_config(&doc);
        Ok(())
    }

    /// Merge every module's settings into `modules.<name>` and save.
    pub fn save_global_config(&mut self) -> Result<()> {
        let updates: Vec<(String, Value, Map<String, Value>)> = self
            .entries
            .iter()
            .map(|e| {
                let m = lock(&e.slot);
                (e.name.to_string(), m.core().config_entry(), m.save_config())
            })
            .collect();

        let mut engine = self.config()?.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, common, extra) in updates {
            let mut merged = match engine.load_module_config(&name) {
                Some(Value::Object(existing)) => existing,
                _ => Map::new(),
            };
            if let Value::Object(common) = common {
                merged.extend(common);
            }
            merged.extend(extra);
            engine.save_module_config(&name, Value::Object(merged))?;
        }
        engine.save()?;
        Ok(())
    }

    /// Route `doc` to every module's `load_config`.
    pub fn apply_config(&mut self, doc: &Value) {
        for entry in &self.entries {
            lock(&entry.slot).load_config(doc);
        }
    }

    /// Give every registered module a default entry under `modules`.
    /// Returns the number of entries added.
    pub fn ensure_module_entries(&mut self) -> Result<usize> {
        let defaults: Vec<(String, Value)> = self
            .entries
            .iter()
            .map(|e| (e.name.to_string(), lock(&e.slot).core().config_entry()))
            .collect();

        let mut engine = self.config()?.lock().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for (name, default) in defaults {
            if engine.load_module_config(&name).is_some() {
                continue;
            }
            engine.save_module_config(&name, default)?;
            added += 1;
        }
        Ok(added)
    }

    // ───────────────────────────────────────────────────────────
    // Status
    // ───────────────────────────────────────────────────────────

    pub fn status(&self) -> Value {
        let modules: Vec<Value> = self
            .entries
            .iter()
            .map(|e| {
                let mut s = lock(&e.slot).status();
                if let (Some(obj), Some(r)) = (s.as_object_mut(), &e.runner) {
                    obj.insert("task_health".into(), json!(r.health()));
                }
                s
            })
            .collect();
        json!({
            "uptime_ms": uptime_ms(),
            "modules": modules,
            "watchdog": self.watchdog.as_ref().map_or(Value::Null, Watchdog::status),
            "wifi_connected": self.wifi_connected,
        })
    }
}

impl NameDispatch for ModuleManager {
    fn dispatch_by_name(&self, module: &str, handle_name: &str, params: &Value) -> FunctionResult {
        let slot = self.get_module(module).ok_or(RegistryError::NotFound)?;
        let mut m = lock(&slot);
        m.call_function_by_name(handle_name, params)
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        for entry in &mut self.entries {
            if let Some(mut r) = entry.runner.take() {
                r.shutdown();
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Helpers
// ───────────────────────────────────────────────────────────────

fn percent(done: usize, total: usize) -> u8 {
    ((done * 100) / total.max(1)).min(100) as u8
}

fn init_locked(m: &mut dyn Module) -> Result<()> {
    let from = m.core().state();
    // Only a fresh or failed module may be initialized again.
    if !matches!(from, ModuleState::Disabled | ModuleState::Error) {
        return Err(LifecycleError::InvalidTransition { from, to: ModuleState::Enabled }.into());
    }
    match m.init() {
        Ok(()) => {
            m.core_mut().set_state(ModuleState::Enabled)?;
            Ok(())
        }
        Err(e) => {
            let _ = m.core_mut().set_state(ModuleState::Error);
            warn!("Manager: init of '{}' failed: {}", m.name(), e);
            Err(LifecycleError::InitFailed.into())
        }
    }
}

fn start_locked(m: &mut dyn Module) -> Result<()> {
    let from = m.core().state();
    if from != ModuleState::Enabled {
        return Err(LifecycleError::InvalidTransition { from, to: ModuleState::Running }.into());
    }
    match m.start() {
        Ok(()) => {
            m.core_mut().set_state(ModuleState::Running)?;
            Ok(())
        }
        Err(e) => {
            let _ = m.core_mut().set_state(ModuleState::Error);
            warn!("Manager: start of '{}' failed: {}", m.name(), e);
            Err(LifecycleError::StartFailed.into())
        }
    }
}

fn stop_locked(m: &mut dyn Module) -> Result<()> {
    let from = m.core().state();
    if from != ModuleState::Running {
        return Err(LifecycleError::InvalidTransition { from, to: ModuleState::Enabled }.into());
    }
    match m.stop() {
        Ok(()) => {
            m.core_mut().set_state(ModuleState::Enabled)?;
            Ok(())
        }
        Err(e) => {
            let _ = m.core_mut().set_state(ModuleState::Error);
            warn!("Manager: stop of '{}' failed: {}", m.name(), e);
            Err(LifecycleError::StopFailed.into())
        }
    }
}

/// Create and register the module's queue if it wants one. Idempotent.
fn ensure_queue(registry: &Registry, m: &mut dyn Module) {
    let core = m.core_mut();
    if !core.use_queue {
        return;
    }
    if core.queue().is_none() {
        let q = ModuleQueue::new(core.name(), core.queue_cfg);
        debug!("Manager: queue {} created for '{}'", q.id().raw(), core.name());
        core.attach_queue(q);
    }
    if let Some(q) = core.queue() {
        registry.register_queue(core.name(), q.handle().clone());
    }
}

fn spawn_task(registry: &Registry, watchdog: Option<&Watchdog>, entry: &mut Entry) -> Result<()> {
    if entry.runner.is_some() {
        return Ok(());
    }
    let cfg = {
        let m = lock(&entry.slot);
        if !m.core().use_task {
            return Ok(());
        }
        m.core().task_cfg.clone()
    };
    let slot = Arc::clone(&entry.slot);
    let wd = watchdog
        .filter(|_| cfg.priority >= WATCHDOG_MIN_PRIORITY)
        .cloned();
    let runner = TaskRunner::spawn(&cfg, move |ctx| module_task(&ctx, &slot, wd))?;
    registry.register_task(&entry.name, runner.id());
    lock(&entry.slot).core_mut().attach_task(Some(runner.id()));
    entry.runner = Some(runner);
    Ok(())
}

/// Body of every module task: tick `update()` while the module is running,
/// feed the watchdog every iteration.
fn module_task(ctx: &TaskContext, slot: &ModuleSlot, watchdog: Option<Watchdog>) {
    let watchdog = watchdog.filter(|wd| match wd.add_task(ctx.id) {
        Ok(()) => true,
        Err(e) => {
            debug!("Task {}: not subscribed to watchdog: {}", ctx.id.raw(), e);
            false
        }
    });

    while !ctx.should_exit() {
        if !ctx.is_suspended() {
            let mut m = lock(slot);
            if m.core().state() == ModuleState::Running {
                if let Err(e) = m.update() {
                    warn!("Task {}: update of '{}' failed: {}", ctx.id.raw(), m.name(), e);
                    let _ = m.core_mut().set_state(ModuleState::Error);
                }
            }
        }
        if let Some(wd) = &watchdog {
            wd.feed_task(ctx.id);
        }
        ctx.tick();
    }

    if let Some(wd) = &watchdog {
        wd.remove_task(ctx.id);
    }
}

fn send_to_display(registry: &Registry, call_name: &str, vars: Value) {
    let Some(q) = registry.find_queue(CONTROL_LCD) else {
        debug!("Boot: no display queue for '{}'", call_name);
        return;
    };
    let env = Envelope::notify(MAIN_CONTEXT, CONTROL_LCD, call_name, vars);
    if let Err(r) = q.try_send(env) {
        warn!("Boot: display message '{}' not delivered: {}", call_name, r.error);
    }
}

fn boot_step(registry: &Registry, op: &str, percent: u8) {
    debug!("Boot: {} ({}%)", op, percent);
    send_to_display(registry, LCD_BOOT_STEP, boot_step_vars(op, percent));
}

fn boot_error(registry: &Registry, msg: &str) {
    error!("Boot: {}", msg);
    send_to_display(registry, LCD_LOG_APPEND, log_append_vars(&[format!("[ERROR][BOOT] {msg}")]));
}
