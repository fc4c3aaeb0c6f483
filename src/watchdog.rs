//! System watchdog.
//!
//! Two layers:
//!
//! - the ESP-IDF Task Watchdog Timer (TWDT), configured with the system
//!   timeout and `trigger_panic`, with each subscribed task feeding it from
//!   its own thread;
//! - a software monitor thread that tracks the last feed of the main loop
//!   and of every subscribed task. When any of them is older than the
//!   system timeout it calls [`Watchdog::on_system_timeout`] once, which
//!   logs heap and uptime and then resets through the [`ResetPort`].
//!
//! On host only the software layer exists, which is what the tests drive.
//!
//! `add_task`, `feed_task` and `remove_task` must be called from the
//! subscribed task's own thread: the TWDT identifies tasks by the caller.

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{Value, json};

use crate::adapters::time::{uptime_ms, uptime_secs};
use crate::error::WatchdogError;
use crate::ports::ResetPort;
use crate::task::{TaskConfig, TaskId, spawn_on_core};

pub const DEFAULT_SYSTEM_TIMEOUT_MS: u32 = 10_000;

const MIN_POLL: Duration = Duration::from_millis(5);
const MAX_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct State {
    initialized: bool,
    timeout_ms: u32,
    last_feed_ms: u64,
    tasks: BTreeMap<TaskId, u64>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    reset: Arc<dyn ResetPort>,
    state: Mutex<State>,
    running: AtomicBool,
    fired: AtomicBool,
}

/// Cloneable handle; all clones share one watchdog.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    pub fn new(reset: Arc<dyn ResetPort>) -> Self {
        Self {
            inner: Arc::new(Inner {
                reset,
                state: Mutex::new(State::default()),
                running: AtomicBool::new(false),
                fired: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configure the TWDT with `system_timeout_ms` (panic on trigger).
    pub fn initialize(&self, system_timeout_ms: u32) -> Result<(), WatchdogError> {
        let mut st = self.state();
        if st.initialized {
            return Err(WatchdogError::AlreadyInitialized);
        }

        #[cfg(target_os = "espidf")]
        {
            use esp_idf_svc::sys::*;
            let cfg = esp_task_wdt_config_t {
                timeout_ms: system_timeout_ms,
                idle_core_mask: 0,
                trigger_panic: true,
            };
            let ret = unsafe { esp_task_wdt_reconfigure(&cfg) };
            if ret != ESP_OK {
                // Not yet initialized by the bootloader config.
                let ret = unsafe { esp_task_wdt_init(&cfg) };
                if ret != ESP_OK {
                    warn!("Watchdog: TWDT init failed ({})", ret);
                    return Err(WatchdogError::Platform(ret));
                }
            }
        }

        st.initialized = true;
        st.timeout_ms = system_timeout_ms.max(1);
        st.last_feed_ms = uptime_ms();
        info!(
            "Watchdog: initialized ({} s timeout, panic on trigger)",
            system_timeout_ms / 1000
        );
        Ok(())
    }

    /// Start the software timer.
    pub fn start(&self) -> Result<(), WatchdogError> {
        let mut st = self.state();
        if !st.initialized {
            return Err(WatchdogError::NotInitialized);
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let now = uptime_ms();
        st.last_feed_ms = now;
        for last in st.tasks.values_mut() {
            *last = now;
        }
        let poll = poll_interval(st.timeout_ms);

        let wd = self.clone();
        let cfg = TaskConfig {
            name: "WDT_MONITOR".into(),
            stack_bytes: 3 * 1024,
            priority: 10,
            core: None,
        };
        match spawn_on_core(&cfg, move || wd.monitor(poll)) {
            Ok(join) => {
                st.monitor = Some(join);
                info!("Watchdog: timer started (poll {} ms)", poll.as_millis());
                Ok(())
            }
            Err(_) => {
                self.inner.running.store(false, Ordering::Release);
                Err(WatchdogError::NotInitialized)
            }
        }
    }

    /// Stop the software timer and wait for the monitor thread.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let join = self.state().monitor.take();
        if let Some(join) = join {
            if join.thread().id() != std::thread::current().id() && join.join().is_err() {
                warn!("Watchdog: monitor thread panicked");
            }
            info!("Watchdog: timer stopped");
        }
    }

    /// Main-loop feed: resets the software timer and the TWDT for the
    /// calling task.
    pub fn feed(&self) {
        self.state().last_feed_ms = uptime_ms();
        #[cfg(target_os = "espidf")]
        unsafe {
            esp_idf_svc::sys::esp_task_wdt_reset();
        }
    }

    /// Subscribe the calling task.
    pub fn add_task(&self, id: TaskId) -> Result<(), WatchdogError> {
        let mut st = self.state();
        if !st.initialized {
            return Err(WatchdogError::NotInitialized);
        }

        #[cfg(target_os = "espidf")]
        {
            use esp_idf_svc::sys::*;
            let ret = unsafe { esp_task_wdt_add(core::ptr::null_mut()) };
            if ret != ESP_OK {
                warn!("Watchdog: failed to subscribe task {} ({})", id.raw(), ret);
                return Err(WatchdogError::Platform(ret));
            }
        }

        st.tasks.insert(id, uptime_ms());
        debug!("Watchdog: task {} subscribed", id.raw());
        Ok(())
    }

    /// Unsubscribe the calling task. Unknown ids are ignored.
    pub fn remove_task(&self, id: TaskId) {
        let mut st = self.state();
        if st.tasks.remove(&id).is_some() {
            #[cfg(target_os = "espidf")]
            unsafe {
                esp_idf_svc::sys::esp_task_wdt_delete(core::ptr::null_mut());
            }
            debug!("Watchdog: task {} unsubscribed", id.raw());
        }
    }

    pub fn feed_task(&self, id: TaskId) {
        let mut st = self.state();
        if let Some(last) = st.tasks.get_mut(&id) {
            *last = uptime_ms();
            #[cfg(target_os = "espidf")]
            unsafe {
                esp_idf_svc::sys::esp_task_wdt_reset();
            }
        }
    }

    pub fn is_subscribed(&self, id: TaskId) -> bool {
        self.state().tasks.contains_key(&id)
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Last-line recovery: log heap and uptime, then reset.
    pub fn on_system_timeout(&self) {
        self.inner.fired.store(true, Ordering::Release);
        let reset = &self.inner.reset;
        error!(
            "Watchdog: system timeout! free heap {} B (min {} B), uptime {} s",
            reset.free_heap(),
            reset.min_free_heap(),
            uptime_secs()
        );
        reset.restart();
    }

    pub fn status(&self) -> Value {
        let st = self.state();
        let running = self.inner.running.load(Ordering::Acquire);
        let fired = self.has_fired();
        let healthy = st.initialized && !fired && stale(&st, uptime_ms()).is_none();
        json!({
            "initialized": st.initialized,
            "healthy": healthy,
            "running": running,
            "system_timeout_ms": st.timeout_ms,
            "timer_active": running && st.monitor.is_some(),
            "subscribed_tasks": st.tasks.keys().map(|t| t.raw()).collect::<Vec<_>>(),
            "fired": fired,
        })
    }

    fn monitor(&self, poll: Duration) {
        while self.inner.running.load(Ordering::Acquire) {
            std::thread::sleep(poll);
            let overdue = stale(&self.state(), uptime_ms());
            if let Some(who) = overdue {
                match who {
                    Overdue::System(ms) => error!("Watchdog: main loop silent for {} ms", ms),
                    Overdue::Task(id, ms) => error!("Watchdog: task {} silent for {} ms", id.raw(), ms),
                }
                self.inner.running.store(false, Ordering::Release);
                self.on_system_timeout();
                return;
            }
        }
    }
}

enum Overdue {
    System(u64),
    Task(TaskId, u64),
}

fn stale(st: &State, now: u64) -> Option<Overdue> {
    let limit = u64::from(st.timeout_ms);
    let age = now.saturating_sub(st.last_feed_ms);
    if age > limit {
        return Some(Overdue::System(age));
    }
    st.tasks.iter().find_map(|(id, last)| {
        let age = now.saturating_sub(*last);
        (age > limit).then_some(Overdue::Task(*id, age))
    })
}

fn poll_interval(timeout_ms: u32) -> Duration {
    Duration::from_millis(u64::from(timeout_ms / 20)).clamp(MIN_POLL, MAX_POLL)
}
