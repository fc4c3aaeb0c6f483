//! Module tasks: core-pinned spawning, cooperative suspend/resume and
//! per-task telemetry.
//!
//! # ESP-IDF threading model
//!
//! ESP-IDF implements `std::thread` via pthreads, which are thin wrappers
//! around FreeRTOS tasks. `esp_pthread_set_cfg()` sets thread-local
//! configuration that applies to the *next* `pthread_create()` call from
//! the calling thread, so the config→spawn pair in [`spawn_on_core`] must
//! not be interleaved with other thread creation on the same thread.
//!
//! Suspension is cooperative: the task body checks [`TaskContext`] between
//! ticks. A suspended task keeps feeding the watchdog but does no work.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::adapters::time::uptime_ms;
use crate::error::LifecycleError;

/// Sleep between two `update()` calls of a module task.
pub const TASK_TICK: Duration = Duration::from_millis(10);
/// Tasks at or above this RTOS priority are subscribed to the watchdog.
pub const WATCHDOG_MIN_PRIORITY: u8 = 2;
/// No activity for this long marks a task unhealthy.
pub const UNHEALTHY_AFTER_MS: u64 = 30_000;

#[cfg(not(target_os = "espidf"))]
const HOST_MIN_STACK: usize = 256 * 1024;

/// Opaque task identifier, unique within a boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// CPU core identifiers for the ESP32 dual-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU): protocol stacks (WiFi, lwIP) and the filesystem.
    Pro = 0,
    /// Core 1 (APP_CPU): application modules and the display.
    App = 1,
}

impl Core {
    /// Config encoding: `0`, `1`, or `-1` for "any core".
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Pro),
            1 => Some(Self::App),
            _ => None,
        }
    }

    pub fn index(core: Option<Self>) -> i64 {
        core.map_or(-1, |c| c as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    pub stack_bytes: usize,
    pub priority: u8,
    pub core: Option<Core>,
}

impl TaskConfig {
    /// Defaults: `<NAME>_TASK`, 4 KiB, priority 3, any core.
    pub fn for_module(module: &str) -> Self {
        Self {
            name: format!("{module}_TASK"),
            stack_bytes: 4096,
            priority: 3,
            core: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Control and telemetry
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TaskControl {
    suspended: AtomicBool,
    exit: AtomicBool,
}

impl TaskControl {
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn should_exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}

const HIGH_WATER_UNKNOWN: u32 = u32::MAX;

#[derive(Debug)]
pub struct TaskTelemetry {
    id: TaskId,
    name: String,
    stack_bytes: usize,
    started_ms: u64,
    last_activity_ms: AtomicU64,
    iterations: AtomicU64,
    high_water: AtomicU32,
}

/// Health snapshot of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHealth {
    pub id: u32,
    pub name: String,
    pub stack_bytes: usize,
    pub stack_high_water: Option<u32>,
    pub stack_usage_percent: Option<u8>,
    pub last_activity_ms: u64,
    pub uptime_ms: u64,
    pub iterations: u64,
    pub suspended: bool,
    pub healthy: bool,
}

impl TaskTelemetry {
    fn new(id: TaskId, cfg: &TaskConfig) -> Self {
        let now = uptime_ms();
        Self {
            id,
            name: cfg.name.clone(),
            stack_bytes: cfg.stack_bytes,
            started_ms: now,
            last_activity_ms: AtomicU64::new(now),
            iterations: AtomicU64::new(0),
            high_water: AtomicU32::new(HIGH_WATER_UNKNOWN),
        }
    }

    /// Record one unit of progress.
    pub fn touch(&self) {
        self.last_activity_ms.store(uptime_ms(), Ordering::Release);
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Must run on the task itself: FreeRTOS reports the caller's stack.
    #[cfg(target_os = "espidf")]
    pub fn sample_stack(&self) {
        let free = unsafe { esp_idf_svc::sys::uxTaskGetStackHighWaterMark(core::ptr::null_mut()) };
        self.high_water.store(free as u32, Ordering::Relaxed);
    }

    /// Host threads have no high-water mark; the value stays unknown.
    #[cfg(not(target_os = "espidf"))]
    pub fn sample_stack(&self) {}

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, now_ms: u64, suspended: bool) -> TaskHealth {
        let hw = self.high_water.load(Ordering::Relaxed);
        let stack_high_water = (hw != HIGH_WATER_UNKNOWN).then_some(hw);
        let stack_usage_percent = stack_high_water.filter(|_| self.stack_bytes > 0).map(|free| {
            let used = self.stack_bytes.saturating_sub(free as usize);
            ((used * 100) / self.stack_bytes).min(100) as u8
        });
        let last = self.last_activity_ms();
        TaskHealth {
            id: self.id.raw(),
            name: self.name.clone(),
            stack_bytes: self.stack_bytes,
            stack_high_water,
            stack_usage_percent,
            last_activity_ms: last,
            uptime_ms: now_ms.saturating_sub(self.started_ms),
            iterations: self.iterations.load(Ordering::Relaxed),
            suspended,
            healthy: now_ms.saturating_sub(last) < UNHEALTHY_AFTER_MS,
        }
    }
}

/// Handed to the task body.
#[derive(Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub control: Arc<TaskControl>,
    pub telemetry: Arc<TaskTelemetry>,
}

impl TaskContext {
    pub fn should_exit(&self) -> bool {
        self.control.should_exit()
    }

    pub fn is_suspended(&self) -> bool {
        self.control.is_suspended()
    }

    /// End-of-iteration bookkeeping, then yield for one tick.
    pub fn tick(&self) {
        self.telemetry.touch();
        self.telemetry.sample_stack();
        std::thread::sleep(TASK_TICK);
    }
}

// ───────────────────────────────────────────────────────────────
// Spawning
// ───────────────────────────────────────────────────────────────

/// Spawn a thread pinned to `cfg.core` with the configured priority and
/// stack.
#[cfg(target_os = "espidf")]
pub fn spawn_on_core(
    cfg: &TaskConfig,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, LifecycleError> {
    use esp_idf_svc::sys;

    // FreeRTOS copies the name into the TCB at creation.
    let c_name = std::ffi::CString::new(cfg.name.as_str()).map_err(|_| LifecycleError::TaskSpawnFailed)?;
    unsafe {
        let mut pcfg = sys::esp_create_default_pthread_config();
        pcfg.pin_to_core = cfg.core.map_or(sys::tskNO_AFFINITY as i32, |c| c as i32);
        pcfg.prio = i32::from(cfg.priority);
        pcfg.stack_size = cfg.stack_bytes as _;
        pcfg.thread_name = c_name.as_ptr();
        let ret = sys::esp_pthread_set_cfg(&pcfg);
        if ret != sys::ESP_OK {
            warn!("Task: esp_pthread_set_cfg failed for '{}' ({})", cfg.name, ret);
            return Err(LifecycleError::TaskSpawnFailed);
        }
    }

    info!(
        "Spawning '{}' on {:?} (pri={}, stack={}B)",
        cfg.name, cfg.core, cfg.priority, cfg.stack_bytes
    );

    let handle = std::thread::Builder::new()
        .name(cfg.name.clone())
        .stack_size(cfg.stack_bytes)
        .spawn(f);
    drop(c_name);
    handle.map_err(|e| {
        warn!("Task: spawn of '{}' failed: {}", cfg.name, e);
        LifecycleError::TaskSpawnFailed
    })
}

/// Simulation fallback: ignores core affinity and priority; host threads get
/// a larger floor stack than the MCU configuration asks for.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core(
    cfg: &TaskConfig,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, LifecycleError> {
    info!(
        "Spawning '{}' (sim, no core pinning, stack={}B)",
        cfg.name, cfg.stack_bytes
    );

    std::thread::Builder::new()
        .name(cfg.name.clone())
        .stack_size(cfg.stack_bytes.max(HOST_MIN_STACK))
        .spawn(f)
        .map_err(|e| {
            warn!("Task: spawn of '{}' failed: {}", cfg.name, e);
            LifecycleError::TaskSpawnFailed
        })
}

/// Owner side of a spawned module task. Dropping it stops and joins the
/// thread.
pub struct TaskRunner {
    ctx: TaskContext,
    join: Option<JoinHandle<()>>,
}

impl TaskRunner {
    pub fn spawn(
        cfg: &TaskConfig,
        body: impl FnOnce(TaskContext) + Send + 'static,
    ) -> Result<Self, LifecycleError> {
        let id = TaskId::next();
        let ctx = TaskContext {
            id,
            control: Arc::new(TaskControl::default()),
            telemetry: Arc::new(TaskTelemetry::new(id, cfg)),
        };
        let task_ctx = ctx.clone();
        let join = spawn_on_core(cfg, move || body(task_ctx))?;
        Ok(Self { ctx, join: Some(join) })
    }

    pub fn id(&self) -> TaskId {
        self.ctx.id
    }

    pub fn suspend(&self) {
        self.ctx.control.suspend();
    }

    pub fn resume(&self) {
        self.ctx.control.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.ctx.control.is_suspended()
    }

    /// `true` once the body has returned.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn health(&self) -> TaskHealth {
        self.ctx.telemetry.snapshot(uptime_ms(), self.is_suspended())
    }

    /// Ask the body to return and wait for it.
    pub fn shutdown(&mut self) {
        self.ctx.control.request_exit();
        if let Some(join) = self.join.take() {
            if join.thread().id() == std::thread::current().id() {
                return;
            }
            if join.join().is_err() {
                warn!("Task: '{}' panicked", self.ctx.telemetry.name);
            }
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
