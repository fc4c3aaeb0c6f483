//! Config engine against an in-memory store: persistence, migration on
//! load, validation outcomes and the backup lifecycle.

use esp_modular::config::ValidationResult;
use esp_modular::error::ConfigError;
use esp_modular::ports::FileStore;
use serde_json::{Value, json};

use crate::mock_modules::engine;

fn v1_document() -> Value {
    json!({
        "version": "1.0.0",
        "modules": {
            "CONTROL_FS": { "state": "enabled", "priority": 100, "version": "1.0.0" }
        }
    })
}

#[test]
fn default_document_survives_save_and_reload() {
    let (store, mut cfg) = engine();
    cfg.create_default().unwrap();
    let hash = cfg.hash();
    assert!(!cfg.is_dirty());
    assert!(store.exists("/config/config.json"));

    let (_, mut other) = engine();
    other.load_defaults();
    assert_eq!(other.hash(), hash);

    cfg.set_value("system.name", json!("scratch")).unwrap();
    assert_ne!(cfg.hash(), hash);
    cfg.load().unwrap();
    assert_eq!(cfg.hash(), hash);
    assert_eq!(cfg.hash().len(), 32);
}

#[test]
fn old_document_is_migrated_on_load() {
    let (store, mut cfg) = engine();
    store
        .write_atomic("/config/config.json", v1_document().to_string().as_bytes())
        .unwrap();

    cfg.load().unwrap();
    assert_eq!(cfg.version(), "2.0.0");
    assert!(cfg.get_value("backup_settings").is_some());
    assert!(cfg.get_value("monitoring").is_some());
    assert_eq!(cfg.get_value("system.watchdog.timeout_ms"), Some(json!(10_000)));
    assert_eq!(cfg.get_value("modules.CONTROL_FS.watchdog.enabled"), Some(json!(true)));
    assert_eq!(cfg.get_value("modules.CONTROL_FS.priority"), Some(json!(100)));
    assert!(!cfg.is_dirty());
}

#[test]
fn explicit_migration_keeps_user_values() {
    let (_, cfg) = engine();
    let mut doc = v1_document();
    doc["monitoring"] = json!({ "enabled": false, "health_check_interval": 5_000 });

    let migrated = cfg.migrate(&doc, esp_modular::config::CURRENT_VERSION).unwrap();
    assert_eq!(migrated["version"], "2.0.0");
    assert_eq!(migrated["monitoring"]["enabled"], false);
    assert_eq!(migrated["backup_settings"]["backup_count"], 10);
    assert_eq!(cfg.migrate(&migrated, esp_modular::config::CURRENT_VERSION).unwrap(), migrated);
}

#[test]
fn validation_outcomes() {
    let (_, cfg) = engine();

    let mut future = v1_document();
    future["version"] = json!("9.9.9");
    assert_eq!(cfg.validate(&future), ValidationResult::InvalidVersion);

    let mut headless = v1_document();
    headless.as_object_mut().unwrap().remove("modules");
    assert_eq!(cfg.validate(&headless), ValidationResult::InvalidSchema);

    let mut fruit = v1_document();
    fruit["modules"]["CONTROL_FS"]["state"] = json!("banana");
    assert_eq!(cfg.validate(&fruit), ValidationResult::InvalidValue);

    assert_eq!(cfg.validate(&v1_document()), ValidationResult::Valid);
}

#[test]
fn unreadable_documents_leave_current_untouched() {
    let (store, mut cfg) = engine();
    assert_eq!(cfg.load(), Err(ConfigError::FileNotFound));

    cfg.load_defaults();
    let hash = cfg.hash();
    store.write_atomic("/config/config.json", b"{ not json").unwrap();
    assert_eq!(cfg.load(), Err(ConfigError::ParseError));

    let mut future = v1_document();
    future["version"] = json!("9.9.9");
    store
        .write_atomic("/config/config.json", future.to_string().as_bytes())
        .unwrap();
    assert_eq!(cfg.load(), Err(ConfigError::InvalidVersion));
    assert_eq!(cfg.hash(), hash);
    assert!(cfg.statistics().load_failures >= 3);
}

#[test]
fn each_save_adds_a_backup_of_the_saved_version() {
    let (_, mut cfg) = engine();
    cfg.load_defaults();
    let before = cfg.list_backups().len();

    cfg.save().unwrap();
    let backups = cfg.list_backups();
    assert_eq!(backups.len(), before + 1);
    let newest = backups.last().unwrap();
    assert_eq!(newest.version, "2.0.0");
    assert!(newest.valid);
    assert_eq!(newest.description.as_deref(), Some("auto_backup_before_save"));

    cfg.save().unwrap();
    assert_eq!(cfg.list_backups().len(), before + 2);
}

#[test]
fn restore_brings_back_snapshot_and_rejects_unknown_names() {
    let (_, mut cfg) = engine();
    cfg.load_defaults();
    let record = cfg.create_backup(Some("known good")).unwrap();
    assert!(record.filename.starts_with("backup_"));
    assert!(record.filename.ends_with("_2.0.0_known_good.json"));
    let good = cfg.hash();

    cfg.set_value("system.name", json!("broken")).unwrap();
    cfg.restore(&record.filename).unwrap();
    assert_eq!(cfg.hash(), good);
    assert!(cfg.is_dirty());

    assert_eq!(cfg.restore("backup_0_2.0.0.json"), Err(ConfigError::BackupNotFound));
    assert_eq!(cfg.restore("../config.json"), Err(ConfigError::InvalidPath));
}

#[test]
fn corrupt_backup_is_listed_invalid_and_not_restored() {
    let (store, mut cfg) = engine();
    cfg.load_defaults();
    store
        .write_atomic("/config/backups/backup_5_2.0.0.json", b"garbage")
        .unwrap();
    store.write_atomic("/config/backups/.hidden.json", b"{}").unwrap();

    let listed = cfg.list_backups();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].valid);
    assert_eq!(cfg.restore(&listed[0].filename), Err(ConfigError::ParseError));
}

#[test]
fn prune_keeps_newest_backups() {
    let (_, mut cfg) = engine();
    cfg.load_defaults();
    let names: Vec<_> = (0..4)
        .map(|_| cfg.create_backup(None).unwrap().filename)
        .collect();

    assert_eq!(cfg.prune_backups(2), 2);
    let kept: Vec<_> = cfg.list_backups().into_iter().map(|b| b.filename).collect();
    assert_eq!(kept, names[2..]);
    assert_eq!(cfg.delete_all_backups(), Ok(2));
    assert!(cfg.list_backups().is_empty());
}

#[test]
fn backups_from_an_earlier_boot_are_pruned_first() {
    let (store, mut cfg) = engine();
    cfg.load_defaults();
    let earlier = json!({
        "backup_info": { "timestamp": 999_999, "version": "2.0.0", "description": "" },
        "config": cfg.current(),
    });
    store
        .write_atomic("/config/backups/backup_999999_2.0.0.json", earlier.to_string().as_bytes())
        .unwrap();

    let first = cfg.create_backup(None).unwrap();
    let second = cfg.create_backup(Some("latest")).unwrap();
    assert!(first.sequence > 999_999);
    assert!(second.sequence > first.sequence);
    assert_eq!(
        cfg.statistics().last_backup.as_deref(),
        Some(second.filename.as_str())
    );

    assert_eq!(cfg.prune_backups(1), 2);
    let kept: Vec<_> = cfg.list_backups().into_iter().map(|b| b.filename).collect();
    assert_eq!(kept, [second.filename]);
    assert!(!store.exists("/config/backups/backup_999999_2.0.0.json"));
}

#[test]
fn module_config_helpers_address_the_modules_subtree() {
    let (_, mut cfg) = engine();
    cfg.load_defaults();
    let mut lcd = cfg.load_module_config("CONTROL_LCD").unwrap();
    lcd["priority"] = json!(12);
    cfg.save_module_config("CONTROL_LCD", lcd).unwrap();
    assert_eq!(cfg.get_value("modules.CONTROL_LCD.priority"), Some(json!(12)));

    assert_eq!(
        cfg.save_module_config("bad.name", json!({})),
        Err(ConfigError::InvalidPath)
    );
    assert_eq!(cfg.save_module_config("X", json!(3)), Err(ConfigError::InvalidValue));
}
