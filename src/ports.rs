//! Port traits: the boundary between the runtime core and the platform.
//!
//! The core never touches flash, the panel, the radio or the reset line
//! directly; it talks to these traits and `adapters` supplies the concrete
//! implementations (ESP-IDF on device, simulation on host).
//!
//! ```text
//!   core (registry · bus · manager · config · watchdog)
//!        │
//!   ─────┼──────────── port traits ─────────────────────
//!        │
//!   FileStore   DisplayPort   ConnectivityPort   WebServerPort   ResetPort
//! ```

use core::fmt;
use std::sync::Arc;

use crate::error::StorageError;

// ───────────────────────────────────────────────────────────────
// FileStore
// ───────────────────────────────────────────────────────────────

/// One directory entry as returned by [`FileStore::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Usage figures for the backing partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Path-addressed file storage.
///
/// Paths are absolute within the store (`/config/config.json`).
/// Implementations serialize every operation behind one lock, so callers on
/// different tasks never interleave partial reads and writes.
pub trait FileStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace `path` atomically: either the new content is fully visible
    /// or the previous content is left untouched.
    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    fn remove(&self, path: &str) -> Result<(), StorageError>;

    fn exists(&self, path: &str) -> bool;

    /// Size in bytes, `None` when the file does not exist.
    fn size(&self, path: &str) -> Option<u64>;

    fn create_dir_all(&self, path: &str) -> Result<(), StorageError>;

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError>;

    /// Stream `path` line by line without loading the whole file.
    fn for_each_line(&self, path: &str, f: &mut dyn FnMut(&str)) -> Result<(), StorageError>;

    /// Erase every file and directory.
    fn format(&self) -> Result<(), StorageError>;

    fn usage(&self) -> StoreUsage;
}

pub type SharedStore = Arc<dyn FileStore>;

// ───────────────────────────────────────────────────────────────
// DisplayPort
// ───────────────────────────────────────────────────────────────

/// Rendering surface for the display module. Only `CONTROL_LCD` holds one.
pub trait DisplayPort: Send {
    fn draw_boot_step(&mut self, op: &str, percent: u8);
    fn draw_log(&mut self, lines: &[&str]);
    fn set_brightness(&mut self, level: u8);
    fn clear(&mut self);
}

// ───────────────────────────────────────────────────────────────
// ConnectivityPort
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityError {
    NoCredentials,
    InvalidSsid,
    InvalidPassword,
    ConnectionFailed,
    AlreadyConnected,
}

impl fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCredentials => write!(f, "no WiFi credentials configured"),
            Self::InvalidSsid => write!(f, "SSID invalid (must be 1-32 printable ASCII bytes)"),
            Self::InvalidPassword => {
                write!(f, "password invalid (must be 8-64 bytes for WPA2, or empty for open)")
            }
            Self::ConnectionFailed => write!(f, "WiFi connection failed"),
            Self::AlreadyConnected => write!(f, "already connected to AP"),
        }
    }
}

pub trait ConnectivityPort: Send {
    fn connect(&mut self) -> Result<(), ConnectivityError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn poll(&mut self);
    fn set_credentials(&mut self, ssid: &str, password: &str) -> Result<(), ConnectivityError>;
    fn ssid(&self) -> &str;
    fn rssi(&self) -> Option<i8>;
}

// ───────────────────────────────────────────────────────────────
// WebServerPort
// ───────────────────────────────────────────────────────────────

pub trait WebServerPort: Send {
    fn start(&mut self, port: u16) -> Result<(), crate::error::Error>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

// ───────────────────────────────────────────────────────────────
// ResetPort
// ───────────────────────────────────────────────────────────────

/// Last-line recovery: heap figures for the crash log and the reset line.
pub trait ResetPort: Send + Sync {
    fn free_heap(&self) -> u32;
    fn min_free_heap(&self) -> u32;
    fn restart(&self);
}
