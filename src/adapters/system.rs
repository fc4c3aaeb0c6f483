//! Platform reset and heap figures.
//!
//! Implements [`ResetPort`]. On ESP-IDF this is `esp_get_free_heap_size`,
//! `esp_get_minimum_free_heap_size` and `esp_restart`. The host simulation
//! only records that a restart was requested, so the watchdog path can be
//! driven end to end in tests.

use core::sync::atomic::{AtomicU32, Ordering};

use log::error;

use crate::ports::ResetPort;

#[derive(Default)]
pub struct EspSystem {
    restarts: AtomicU32,
}

impl EspSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of restarts requested so far (always 0 on device, which
    /// never returns from `esp_restart`).
    pub fn restart_requests(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }
}

impl ResetPort for EspSystem {
    #[cfg(target_os = "espidf")]
    fn free_heap(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }

    #[cfg(not(target_os = "espidf"))]
    fn free_heap(&self) -> u32 {
        // Typical free heap on an ESP32 with WiFi up.
        180_000
    }

    #[cfg(target_os = "espidf")]
    fn min_free_heap(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_minimum_free_heap_size() }
    }

    #[cfg(not(target_os = "espidf"))]
    fn min_free_heap(&self) -> u32 {
        150_000
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::AcqRel);
        error!("System: restart requested");
        #[cfg(target_os = "espidf")]
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_restart_is_recorded() {
        let sys = EspSystem::new();
        assert_eq!(sys.restart_requests(), 0);
        sys.restart();
        assert_eq!(sys.restart_requests(), 1);
        assert!(sys.free_heap() >= sys.min_free_heap());
    }
}
