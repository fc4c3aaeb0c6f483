//! Log-based display adapter.
//!
//! Implements [`DisplayPort`] by writing what would be drawn on the panel
//! to the logger. Boards without a panel (and the host build) use this; a
//! TFT adapter would implement the same trait.

use log::info;

use crate::ports::DisplayPort;

/// Renders boot progress and the log tail as console lines.
pub struct LogDisplay {
    brightness: u8,
}

impl Default for LogDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl LogDisplay {
    pub fn new() -> Self {
        Self { brightness: 255 }
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }
}

fn progress_bar(percent: u8) -> heapless::String<20> {
    let filled = usize::from(percent.min(100)) / 5;
    let mut bar = heapless::String::new();
    for i in 0..20 {
        let _ = bar.push(if i < filled { '#' } else { '.' });
    }
    bar
}

impl DisplayPort for LogDisplay {
    fn draw_boot_step(&mut self, op: &str, percent: u8) {
        info!("LCD | [{}] {:>3}% {}", progress_bar(percent), percent, op);
    }

    fn draw_log(&mut self, lines: &[&str]) {
        for line in lines {
            info!("LCD | {}", line);
        }
    }

    fn set_brightness(&mut self, level: u8) {
        self.brightness = level;
        info!("LCD | brightness={}", level);
    }

    fn clear(&mut self) {
        info!("LCD | clear");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_scales_to_twenty_cells() {
        assert_eq!(progress_bar(0).as_str(), "....................");
        assert_eq!(progress_bar(50).as_str(), "##########..........");
        assert_eq!(progress_bar(250).as_str(), "####################");
    }

    #[test]
    fn brightness_is_tracked() {
        let mut d = LogDisplay::new();
        assert_eq!(d.brightness(), 255);
        d.set_brightness(10);
        assert_eq!(d.brightness(), 10);
    }
}
