//! Fuzz target: registry variable import
//!
//! Feeds arbitrary text to `Registry::import_json` and verifies:
//! - no input panics
//! - a rejected import adds nothing
//! - whatever was imported survives an export/import round through a
//!   fresh registry
//!
//! cargo fuzz run fuzz_registry_import

#![no_main]

use esp_modular::Registry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };

    let registry = Registry::new();
    let empty = registry.export_json();
    match registry.import_json(text) {
        Ok(_) => {
            let exported = registry.export_json();
            let copy = Registry::new();
            assert!(copy.import_json(&exported).is_ok(), "export not re-importable");
            assert_eq!(copy.export_json(), exported);
        }
        Err(_) => assert_eq!(registry.export_json(), empty, "rejected import left entries"),
    }
});
