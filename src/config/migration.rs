//! Version migration chain.
//!
//! Steps run on a scratch clone; the caller only sees the result when every
//! step succeeded. Each step is idempotent and only adds missing subtrees,
//! so user data is never removed or overwritten. The `version` string is
//! rewritten last.

use log::info;
use serde_json::{Map, Value, json};

use super::version::Version;
use crate::error::ConfigError;

/// Version assumed for documents that carry none.
pub const UNVERSIONED: Version = Version::new(1, 0, 0);

pub struct MigrationStep {
    pub from: Version,
    pub to: Version,
    pub apply: fn(&mut Map<String, Value>),
}

pub const STEPS: [MigrationStep; 3] = [
    MigrationStep {
        from: Version::new(1, 0, 0),
        to: Version::new(1, 1, 0),
        apply: add_backup_settings,
    },
    MigrationStep {
        from: Version::new(1, 1, 0),
        to: Version::new(1, 2, 0),
        apply: add_monitoring,
    },
    MigrationStep {
        from: Version::new(1, 2, 0),
        to: Version::new(2, 0, 0),
        apply: add_watchdog,
    },
];

fn insert_missing(obj: &mut Map<String, Value>, key: &str, value: Value) {
    obj.entry(key.to_string()).or_insert(value);
}

fn add_backup_settings(doc: &mut Map<String, Value>) {
    insert_missing(
        doc,
        "backup_settings",
        json!({ "auto_backup": true, "backup_count": 10, "backup_interval_hours": 24 }),
    );
}

fn add_monitoring(doc: &mut Map<String, Value>) {
    insert_missing(
        doc,
        "monitoring",
        json!({ "enabled": true, "health_check_interval": 30_000, "performance_tracking": true }),
    );
}

fn add_watchdog(doc: &mut Map<String, Value>) {
    if let Some(Value::Object(modules)) = doc.get_mut("modules") {
        for module in modules.values_mut() {
            if let Some(m) = module.as_object_mut() {
                insert_missing(
                    m,
                    "watchdog",
                    json!({ "enabled": true, "timeout_ms": 5_000, "auto_restart": true }),
                );
            }
        }
    }
    let system = doc
        .entry("system".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(system) = system.as_object_mut() {
        insert_missing(
            system,
            "watchdog",
            json!({ "enabled": true, "timeout_ms": 10_000, "reset_on_timeout": true }),
        );
    }
}

/// Version of `doc`: missing means [`UNVERSIONED`], unparseable is an
/// error.
pub fn document_version(doc: &Value) -> Result<Version, ConfigError> {
    match doc.get("version") {
        None => Ok(UNVERSIONED),
        Some(Value::String(s)) => Version::parse(s).ok_or(ConfigError::InvalidVersion),
        Some(_) => Err(ConfigError::InvalidVersion),
    }
}

pub fn needs_migration(doc: &Value, target: Version) -> bool {
    document_version(doc).is_ok_and(|v| v < target)
}

/// Bring `doc` up to `target`. Newer documents are refused.
pub fn migrate(doc: &Value, target: Version) -> Result<Value, ConfigError> {
    let from = document_version(doc)?;
    if from > target {
        return Err(ConfigError::InvalidVersion);
    }
    let mut scratch = doc.clone();
    let obj = scratch.as_object_mut().ok_or(ConfigError::InvalidSchema)?;
    if from == target {
        return Ok(scratch);
    }
    for step in STEPS.iter().filter(|s| from < s.to && s.to <= target) {
        info!("Config: migrating {} -> {}", step.from, step.to);
        (step.apply)(obj);
    }
    obj.insert("version".to_string(), json!(target.to_string()));
    Ok(scratch)
}
