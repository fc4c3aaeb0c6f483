//! Runtime health snapshot and panic hook.
//!
//! `SystemMetrics` is collected on demand from the reset port and the
//! manager's status document; `main` logs one every
//! `monitoring.health_check_interval` ms.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::adapters::time::uptime_ms;
use crate::module::ModuleState;
use crate::ports::ResetPort;

const MAX_PANIC_LEN: usize = 160;

static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemMetrics {
    pub uptime_ms: u64,
    pub heap_free: u32,
    pub heap_min_free: u32,
    pub modules_total: usize,
    pub modules_running: usize,
    pub modules_error: usize,
    pub tasks_unhealthy: usize,
}

impl SystemMetrics {
    /// `status` is the document produced by `ModuleManager::status`.
    pub fn collect(reset: &dyn ResetPort, status: &Value) -> Self {
        let modules = status
            .get("modules")
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice);
        let in_state = |s: ModuleState| {
            modules
                .iter()
                .filter(|m| m.get("state").and_then(Value::as_u64) == Some(u64::from(s.code())))
                .count()
        };
        let tasks_unhealthy = modules
            .iter()
            .filter_map(|m| m.get("task_health"))
            .filter(|h| h.get("healthy").and_then(Value::as_bool) == Some(false))
            .count();
        Self {
            uptime_ms: uptime_ms(),
            heap_free: reset.free_heap(),
            heap_min_free: reset.min_free_heap(),
            modules_total: modules.len(),
            modules_running: in_state(ModuleState::Running),
            modules_error: in_state(ModuleState::Error),
            tasks_unhealthy,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.modules_error > 0 || self.tasks_unhealthy > 0
    }
}

/// Route panics through `log::error!` so the message reaches the log
/// file before the reset. The previous hook still runs afterwards.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };
        let location = info
            .location()
            .map_or_else(|| "?".to_string(), |l| format!("{}:{}", l.file(), l.line()));
        let thread = std::thread::current();
        let mut record = format!("{} at {} ({})", reason, location, thread.name().unwrap_or("?"));
        if record.len() > MAX_PANIC_LEN {
            let mut cut = MAX_PANIC_LEN;
            while !record.is_char_boundary(cut) {
                cut -= 1;
            }
            record.truncate(cut);
        }

        log::error!("PANIC: {}", record);
        *LAST_PANIC.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
        previous(info);
    }));
}

/// The most recent panic seen by the hook.
pub fn last_panic() -> Option<String> {
    LAST_PANIC.lock().unwrap_or_else(PoisonError::into_inner).clone()
}
