//! Pluggable module runtime for ESP32 controllers.
//!
//! Modules register with a [`manager::ModuleManager`], are initialized and
//! started in priority order, talk over per-module bounded queues
//! ([`bus`]), expose callable functions through the [`registry`], share
//! one versioned JSON document ([`config`]) and are supervised by a
//! [`watchdog`].
//!
//! All ESP-IDF-specific code is guarded by `#[cfg(target_os = "espidf")]`
//! inside each module; the host build runs the same logic on simulated
//! adapters.

#![deny(unused_must_use)]

pub mod adapters;
pub mod bus;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod module;
pub mod modules;
pub mod ports;
pub mod registry;
pub mod task;
pub mod watchdog;

pub use error::{Error, Result};
pub use manager::ModuleManager;
pub use module::{Module, ModuleCore, ModuleState};
pub use registry::Registry;
