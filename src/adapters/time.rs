//! Monotonic uptime clock.
//!
//! Every timestamp in the runtime (backup names, task telemetry, watchdog
//! deadlines) is "milliseconds since boot" from this module, so all
//! components agree on one time base.
//!
//! - **`target_os = "espidf"`**: wraps `esp_timer_get_time()` from the
//!   ESP-IDF high-resolution timer (microsecond precision, monotonic).
//! - **`not(target_os = "espidf")`**: `std::time::Instant` anchored at the
//!   first call in the process.

#[cfg(not(target_os = "espidf"))]
use std::sync::OnceLock;
#[cfg(not(target_os = "espidf"))]
use std::time::Instant;

#[cfg(not(target_os = "espidf"))]
fn boot_instant() -> Instant {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    *BOOT.get_or_init(Instant::now)
}

/// Microseconds since boot.
#[cfg(target_os = "espidf")]
pub fn uptime_us() -> u64 {
    (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64
}

/// Microseconds since boot.
#[cfg(not(target_os = "espidf"))]
pub fn uptime_us() -> u64 {
    boot_instant().elapsed().as_micros() as u64
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    uptime_us() / 1_000
}

/// Seconds since boot.
pub fn uptime_secs() -> u64 {
    uptime_us() / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_monotonic() {
        let a = uptime_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = uptime_us();
        assert!(b > a);
        assert!(uptime_ms() >= a / 1_000);
    }
}
