//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one subsystem through
//! the public API with mock modules and simulated adapters. All tests run
//! on the host with no hardware required.

#![cfg(not(target_os = "espidf"))]

mod boot_tests;
mod bus_tests;
mod config_tests;
mod mock_modules;
mod watchdog_tests;
