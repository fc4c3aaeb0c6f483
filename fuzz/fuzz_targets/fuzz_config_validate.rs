//! Fuzz target: config document loading
//!
//! Writes arbitrary bytes as `/config/config.json` and loads them through
//! the engine, checking that:
//! - no input panics
//! - a failed load leaves the in-memory document untouched
//! - a successful load always yields a valid document at the current version
//!
//! cargo fuzz run fuzz_config_validate

#![no_main]

use std::sync::Arc;

use esp_modular::adapters::storage::MemFileStore;
use esp_modular::config::{CURRENT_VERSION, ConfigEngine, Validator};
use esp_modular::ports::{FileStore, SharedStore};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let store = Arc::new(MemFileStore::new());
    let shared: SharedStore = store.clone();
    let mut engine = ConfigEngine::new(shared);
    if engine.initialize("/config").is_err() {
        return;
    }
    engine.load_defaults();
    let before = engine.hash();

    if store.write_atomic("/config/config.json", data).is_err() {
        return;
    }
    match engine.load() {
        Ok(()) => {
            assert_eq!(engine.version(), CURRENT_VERSION.to_string());
            assert!(Validator::default().validate(engine.current()).is_valid());
        }
        Err(_) => assert_eq!(engine.hash(), before, "failed load replaced the document"),
    }

    // Raw validation of whatever parses must not panic either.
    if let Ok(doc) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = engine.validate(&doc);
        let _ = engine.migrate(&doc, CURRENT_VERSION);
    }
});
