//! Module contract.
//!
//! A module is a struct that owns a [`ModuleCore`] (the common record:
//! name, priority, flags, lifecycle state, task/queue configuration) and
//! implements [`Module`]. The lifecycle manager drives the state machine;
//! modules only report success or failure from their lifecycle hooks.
//!
//! ```text
//!   Disabled ──init ok──► Enabled ──start ok──► Running
//!                           ▲  ▲                  │
//!                           │  └──────stop────────┘
//!   Error ──init ok─────────┘
//!   any ──failure──► Error
//! ```

pub mod state;

use serde_json::{Map, Value, json};

use crate::bus::{ModuleQueue, QueueConfig, Ticks};
use crate::error::{LifecycleError, RegistryError, Result};
use crate::task::{Core, TaskConfig, TaskId};

pub use state::{ConfigState, ModuleState};

// ── Well-known module names ───────────────────────────────────

pub const CONTROL_FS: &str = "CONTROL_FS";
pub const CONTROL_WIFI: &str = "CONTROL_WIFI";
pub const CONTROL_LCD: &str = "CONTROL_LCD";
pub const CONTROL_SERIAL: &str = "CONTROL_SERIAL";
pub const CONTROL_WEB: &str = "CONTROL_WEB";
pub const CONTROL_RADAR: &str = "CONTROL_RADAR";
/// Source name used by the top-level context when it sends messages.
pub const MAIN_CONTEXT: &str = "main";

pub const MODULE_NAME_LEN: usize = 32;
pub type ModuleName = heapless::String<MODULE_NAME_LEN>;

/// Fixed-capacity copy of `name`, truncated on a char boundary.
pub fn module_name(name: &str) -> ModuleName {
    let mut out = ModuleName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

// ───────────────────────────────────────────────────────────────
// ModuleCore
// ───────────────────────────────────────────────────────────────

/// Common record every module carries.
#[derive(Debug)]
pub struct ModuleCore {
    name: ModuleName,
    pub version: String,
    pub priority: u8,
    pub autostart: bool,
    pub debug: bool,
    pub critical: bool,
    /// State requested by configuration; `Disabled` modules are not
    /// initialized.
    pub desired: ConfigState,
    pub use_task: bool,
    pub use_queue: bool,
    pub task_cfg: TaskConfig,
    pub queue_cfg: QueueConfig,
    state: ModuleState,
    config: Value,
    queue: Option<ModuleQueue>,
    task: Option<TaskId>,
}

impl ModuleCore {
    pub fn new(name: &str) -> Self {
        let name = module_name(name);
        Self {
            task_cfg: TaskConfig::for_module(&name),
            name,
            version: "1.0.0".into(),
            priority: 0,
            autostart: false,
            debug: false,
            critical: false,
            desired: ConfigState::Enabled,
            use_task: true,
            use_queue: false,
            queue_cfg: QueueConfig::default(),
            state: ModuleState::Disabled,
            config: Value::Null,
            queue: None,
            task: None,
        }
    }

    // ── Builder-style setup ───────────────────────────────────

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    #[must_use]
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    #[must_use]
    pub fn with_queue(mut self, length: usize) -> Self {
        self.use_queue = true;
        self.queue_cfg.length = length;
        self
    }

    #[must_use]
    pub fn with_task(mut self, use_task: bool) -> Self {
        self.use_task = use_task;
        self
    }

    #[must_use]
    pub fn pinned_to(mut self, core: Core) -> Self {
        self.task_cfg.core = Some(core);
        self
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Move along the state machine; illegal edges are refused.
    pub fn set_state(&mut self, to: ModuleState) -> core::result::Result<(), LifecycleError> {
        if !self.state.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// The subtree captured by the last successful `load_config`.
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn queue(&self) -> Option<&ModuleQueue> {
        self.queue.as_ref()
    }

    pub fn attach_queue(&mut self, queue: ModuleQueue) {
        self.queue = Some(queue);
    }

    pub fn take_queue(&mut self) -> Option<ModuleQueue> {
        self.queue.take()
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn attach_task(&mut self, task: Option<TaskId>) {
        self.task = task;
    }

    // ── Config ────────────────────────────────────────────────

    /// Pull common fields from `modules.<name>` (or a top-level `<name>`).
    /// Returns `false` when the document has no subtree for this module.
    pub fn load_config(&mut self, global: &Value) -> bool {
        let subtree = global
            .get("modules")
            .and_then(|m| m.get(self.name.as_str()))
            .or_else(|| global.get(self.name.as_str()));
        let Some(sub) = subtree.filter(|s| s.is_object()) else {
            return false;
        };

        if let Some(p) = sub.get("priority").and_then(Value::as_u64) {
            self.priority = p.min(255) as u8;
        }
        if let Some(a) = sub
            .get("autostart")
            .or_else(|| sub.get("autoStart"))
            .and_then(Value::as_bool)
        {
            self.autostart = a;
        }
        if let Some(d) = sub.get("debug").and_then(Value::as_bool) {
            self.debug = d;
        }
        if let Some(c) = sub.get("critical").and_then(Value::as_bool) {
            self.critical = c;
        }
        if let Some(v) = sub.get("version").and_then(Value::as_str) {
            self.version = v.to_string();
        }
        if let Some(s) = sub.get("state").and_then(Value::as_str).and_then(ConfigState::parse) {
            self.desired = s;
        }

        if let Some(task) = sub.pointer("/freertos/task") {
            self.load_task_config(task);
        }
        if let Some(queue) = sub.pointer("/freertos/queue") {
            self.load_queue_config(queue);
        }

        self.config = sub.clone();
        true
    }

    fn load_task_config(&mut self, task: &Value) {
        if let Some(n) = task.get("name").and_then(Value::as_str) {
            self.task_cfg.name = n.to_string();
        }
        if let Some(s) = task.get("stack").and_then(Value::as_u64) {
            self.task_cfg.stack_bytes = s as usize;
        }
        if let Some(p) = task.get("priority").and_then(Value::as_u64) {
            self.task_cfg.priority = p.min(24) as u8;
        }
        if let Some(c) = task.get("core").and_then(Value::as_i64) {
            self.task_cfg.core = Core::from_index(c);
        }
        if let Some(e) = task.get("enabled").and_then(Value::as_bool) {
            self.use_task = e;
        }
    }

    fn load_queue_config(&mut self, queue: &Value) {
        fn timeout(v: &Value) -> Option<Ticks> {
            let ms = v.as_i64()?;
            Some(if ms < 0 { Ticks::MAX } else { Ticks::from_ms(ms.min(i64::from(u32::MAX)) as u32) })
        }

        if let Some(l) = queue.get("length").and_then(Value::as_u64) {
            self.queue_cfg.length = (l as usize).max(1);
        }
        if let Some(t) = queue.get("send_timeout_ms").and_then(timeout) {
            self.queue_cfg.send_timeout = t;
        }
        if let Some(t) = queue.get("recv_timeout_ms").and_then(timeout) {
            self.queue_cfg.recv_timeout = t;
        }
        if let Some(e) = queue.get("enabled").and_then(Value::as_bool) {
            self.use_queue = e;
        }
    }

    /// Common fields in config form, for merging back into `modules.<name>`.
    pub fn config_entry(&self) -> Value {
        let ms = |t: Ticks| if t.is_forever() { -1 } else { t.as_ms() as i64 };
        json!({
            "state": self.desired.as_str(),
            "priority": self.priority,
            "version": self.version,
            "autostart": self.autostart,
            "debug": self.debug,
            "critical": self.critical,
            "freertos": {
                "task": {
                    "name": self.task_cfg.name,
                    "stack": self.task_cfg.stack_bytes,
                    "priority": self.task_cfg.priority,
                    "core": Core::index(self.task_cfg.core),
                    "enabled": self.use_task,
                },
                "queue": {
                    "length": self.queue_cfg.length,
                    "send_timeout_ms": ms(self.queue_cfg.send_timeout),
                    "recv_timeout_ms": ms(self.queue_cfg.recv_timeout),
                    "enabled": self.use_queue,
                },
            },
        })
    }

    /// Base status document.
    pub fn status(&self) -> Value {
        let mut doc = json!({
            "name": self.name.as_str(),
            "version": self.version,
            "priority": self.priority,
            "state": self.state.code(),
            "state_name": self.state.as_str(),
            "autostart": self.autostart,
            "critical": self.critical,
            "debug": self.debug,
        });
        if let Some(q) = &self.queue {
            doc["queue"] = json!({ "id": q.id().raw(), "len": q.len(), "cap": q.config().length });
        }
        if let Some(t) = self.task {
            doc["task"] = json!({ "id": t.raw(), "name": self.task_cfg.name });
        }
        doc
    }

    /// Base status with module-specific fields merged on top.
    pub fn status_with(&self, extra: Value) -> Value {
        let mut doc = self.status();
        if let (Some(base), Value::Object(more)) = (doc.as_object_mut(), extra) {
            base.extend(more);
        }
        doc
    }
}

// ───────────────────────────────────────────────────────────────
// Module trait
// ───────────────────────────────────────────────────────────────

/// The capability set every module implements.
///
/// Lifecycle hooks report success or failure; the manager owns the state
/// transitions. `update()` must be cheap and idempotent.
pub trait Module: Send {
    fn core(&self) -> &ModuleCore;
    fn core_mut(&mut self) -> &mut ModuleCore;

    fn init(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn update(&mut self) -> Result<()>;

    fn test(&mut self) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> Value {
        self.core().status()
    }

    fn load_config(&mut self, global: &Value) -> bool {
        self.core_mut().load_config(global)
    }

    /// Module-specific keys to persist alongside the common fields.
    fn save_config(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Target of registry `ByName` calls.
    fn call_function_by_name(&mut self, name: &str, params: &Value) -> core::result::Result<Value, RegistryError> {
        let _ = params;
        log::debug!("{}: no by-name function '{}'", self.name(), name);
        Err(RegistryError::NotFound)
    }

    fn name(&self) -> &str {
        self.core().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_truncate_on_char_boundary() {
        let long = "é".repeat(40);
        let n = module_name(&long);
        assert_eq!(n.len(), 32);
        assert!(n.chars().all(|c| c == 'é'));
    }

    #[test]
    fn load_config_reads_common_fields() {
        let mut core = ModuleCore::new("CONTROL_LCD");
        let doc = json!({
            "version": "2.0.0",
            "modules": {
                "CONTROL_LCD": {
                    "state": "disabled", "priority": 85, "version": "1.2.0",
                    "autoStart": true, "critical": true, "extra": 1,
                    "freertos": {
                        "task": { "stack": 8192, "priority": 5, "core": 1, "enabled": true },
                        "queue": { "length": 16, "send_timeout_ms": -1, "recv_timeout_ms": 50, "enabled": true }
                    }
                }
            }
        });
        assert!(core.load_config(&doc));
        assert_eq!(core.priority, 85);
        assert!(core.autostart && core.critical);
        assert_eq!(core.desired, ConfigState::Disabled);
        assert_eq!(core.version, "1.2.0");
        assert_eq!(core.task_cfg.stack_bytes, 8192);
        assert_eq!(core.task_cfg.core, Some(Core::App));
        assert!(core.use_queue);
        assert_eq!(core.queue_cfg.length, 16);
        assert!(core.queue_cfg.send_timeout.is_forever());
        assert_eq!(core.queue_cfg.recv_timeout, Ticks::from_ms(50));
        assert_eq!(core.config()["extra"], 1);

        let entry = core.config_entry();
        assert_eq!(entry["state"], "disabled");
        assert_eq!(entry["freertos"]["queue"]["send_timeout_ms"], -1);
        assert_eq!(entry["freertos"]["task"]["core"], 1);
    }

    #[test]
    fn load_config_accepts_top_level_and_reports_missing() {
        let mut core = ModuleCore::new("SOLO");
        assert!(!core.load_config(&json!({"modules": {}})));
        assert!(core.load_config(&json!({"SOLO": {"priority": 300}})));
        assert_eq!(core.priority, 255);
    }

    #[test]
    fn set_state_enforces_machine() {
        let mut core = ModuleCore::new("M");
        assert!(core.set_state(ModuleState::Running).is_err());
        core.set_state(ModuleState::Enabled).unwrap();
        core.set_state(ModuleState::Running).unwrap();
        core.set_state(ModuleState::Error).unwrap();
        assert_eq!(
            core.set_state(ModuleState::Running),
            Err(LifecycleError::InvalidTransition { from: ModuleState::Error, to: ModuleState::Running })
        );
        core.set_state(ModuleState::Enabled).unwrap();
        assert_eq!(core.status()["state"], 1);
    }

    #[test]
    fn status_with_merges_fields() {
        let core = ModuleCore::new("M").with_priority(7);
        let s = core.status_with(json!({"isConnected": true}));
        assert_eq!(s["priority"], 7);
        assert_eq!(s["isConnected"], true);
        assert_eq!(s["state_name"], "disabled");
    }
}
