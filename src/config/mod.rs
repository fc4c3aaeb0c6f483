//! Configuration engine.
//!
//! Owns one in-memory JSON document (`current`) mirrored at
//! `<base>/config.json`, with automatic backups under `<base>/backups`.
//!
//! ```text
//!   load:  read ─► parse ─► validate ─► migrate (scratch) ─► re-validate ─► install
//!   save:  validate ─► serialize ─► backup(current) ─► write_atomic
//! ```
//!
//! Failure rules: `current` is replaced only when every load step
//! succeeded; a failed save leaves the previous file on disk untouched.

pub mod backup;
pub mod defaults;
pub mod migration;
pub mod path;
pub mod validation;
pub mod version;

use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Value, json};

use crate::adapters::time::uptime_ms;
use crate::error::{ConfigError, StorageError};
use crate::ports::SharedStore;

pub use backup::BackupRecord;
pub use validation::{ValidationResult, ValidationRule, Validator, ValueType};
pub use version::Version;

pub const CURRENT_VERSION: Version = Version::new(2, 0, 0);
pub const MIN_VERSION: Version = Version::new(1, 0, 0);
/// Compact serialization limit of the in-memory document.
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024;
pub const MAX_FILE_BYTES: u64 = 64 * 1024;

pub const DEFAULT_BASE_PATH: &str = "/config";
pub const CONFIG_FILE: &str = "config.json";
pub const SCHEMA_FILE: &str = "schema.json";
pub const BACKUP_DIR: &str = "backups";
pub const AUTO_BACKUP_DESCRIPTION: &str = "auto_backup_before_save";

/// The engine is shared between the filesystem module and the manager.
pub type SharedConfig = Arc<Mutex<ConfigEngine>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigStatistics {
    pub loads: u32,
    pub load_failures: u32,
    pub saves: u32,
    pub save_failures: u32,
    pub validation_failures: u32,
    pub backup_count: usize,
    pub total_backup_size: u64,
    /// Filename of the newest backup.
    pub last_backup: Option<String>,
    pub config_size: usize,
    pub config_version: String,
    pub hash: String,
    pub dirty: bool,
}

#[derive(Debug, Default)]
struct Counters {
    loads: u32,
    load_failures: u32,
    saves: u32,
    save_failures: u32,
    validation_failures: u32,
}

pub struct ConfigEngine {
    store: SharedStore,
    base: Option<String>,
    current: Value,
    validator: Validator,
    dirty: bool,
    counters: Counters,
}

impl ConfigEngine {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            base: None,
            current: empty_document(),
            validator: Validator::default(),
            dirty: false,
            counters: Counters::default(),
        }
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(Mutex::new(self))
    }

    // ───────────────────────────────────────────────────────────
    // Setup
    // ───────────────────────────────────────────────────────────

    /// Ensure `base_path` and `base_path/backups` exist.
    pub fn initialize(&mut self, base_path: &str) -> Result<(), ConfigError> {
        let base = normalize_base(base_path)?;
        let backups = format!("{base}/{BACKUP_DIR}");
        for dir in [base.as_str(), backups.as_str()] {
            if let Err(e) = self.store.create_dir_all(dir) {
                error!("Config: cannot create '{}': {}", dir, e);
                return Err(ConfigError::SaveFailed);
            }
        }
        self.current = empty_document();
        self.dirty = false;
        info!("Config: initialized at '{}'", base);
        self.base = Some(base);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    fn base(&self) -> Result<&str, ConfigError> {
        self.base.as_deref().ok_or(ConfigError::NotInitialized)
    }

    pub fn config_path(&self) -> Result<String, ConfigError> {
        Ok(format!("{}/{CONFIG_FILE}", self.base()?))
    }

    pub fn backup_dir(&self) -> Result<String, ConfigError> {
        Ok(format!("{}/{BACKUP_DIR}", self.base()?))
    }

    pub fn schema_path(&self) -> Result<String, ConfigError> {
        Ok(format!("{}/{SCHEMA_FILE}", self.base()?))
    }

    // ───────────────────────────────────────────────────────────
    // Load / save
    // ───────────────────────────────────────────────────────────

    pub fn load(&mut self) -> Result<(), ConfigError> {
        let path = self.config_path()?;
        self.load_from(&path)
    }

    pub fn load_from(&mut self, path: &str) -> Result<(), ConfigError> {
        self.base()?;
        match self.read_document(path) {
            Ok(doc) => {
                self.current = doc;
                self.dirty = false;
                self.counters.loads += 1;
                info!("Config: loaded '{}' (version {})", path, self.version());
                Ok(())
            }
            Err(e) => {
                self.counters.load_failures += 1;
                warn!("Config: load of '{}' failed: {}", path, e);
                Err(e)
            }
        }
    }

    fn read_document(&mut self, path: &str) -> Result<Value, ConfigError> {
        let too_big = self.store.size(path).is_some_and(|s| s > MAX_FILE_BYTES);
        if too_big {
            return Err(ConfigError::ParseError);
        }
        let bytes = self.store.read(path).map_err(|e| match e {
            StorageError::NotFound => ConfigError::FileNotFound,
            _ => ConfigError::ParseError,
        })?;
        let doc: Value = serde_json::from_slice(&bytes).map_err(|e| {
            debug!("Config: parse error: {}", e);
            ConfigError::ParseError
        })?;
        self.prepare(doc)
    }

    /// Validate, migrate when older, re-validate.
    fn prepare(&mut self, doc: Value) -> Result<Value, ConfigError> {
        self.check(&doc)?;
        let doc = if migration::needs_migration(&doc, CURRENT_VERSION) {
            let migrated = migration::migrate(&doc, CURRENT_VERSION)?;
            self.check(&migrated)?;
            migrated
        } else {
            doc
        };
        if compact_size(&doc) > MAX_DOCUMENT_BYTES {
            warn!("Config: document exceeds {} bytes", MAX_DOCUMENT_BYTES);
            return Err(ConfigError::InvalidValue);
        }
        Ok(doc)
    }

    fn check(&mut self, doc: &Value) -> Result<(), ConfigError> {
        let result = self.validator.validate(doc);
        if !result.is_valid() {
            self.counters.validation_failures += 1;
            warn!("Config: {}", result);
        }
        result.into_result()
    }

    pub fn save(&mut self) -> Result<(), ConfigError> {
        let path = self.config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&mut self, path: &str) -> Result<(), ConfigError> {
        self.base()?;
        match self.write_current(path) {
            Ok(()) => {
                self.counters.saves += 1;
                self.dirty = false;
                info!("Config: saved '{}'", path);
                Ok(())
            }
            Err(e) => {
                self.counters.save_failures += 1;
                error!("Config: save of '{}' failed: {}", path, e);
                Err(e)
            }
        }
    }

    fn write_current(&mut self, path: &str) -> Result<(), ConfigError> {
        let current = self.current.clone();
        self.check(&current)?;
        if compact_size(&current) > MAX_DOCUMENT_BYTES {
            return Err(ConfigError::SaveFailed);
        }
        let text = serde_json::to_vec_pretty(&current).map_err(|_| ConfigError::SaveFailed)?;
        self.create_backup(Some(AUTO_BACKUP_DESCRIPTION))
            .map_err(|_| ConfigError::SaveFailed)?;
        self.store
            .write_atomic(path, &text)
            .map_err(|_| ConfigError::SaveFailed)
    }

    // ───────────────────────────────────────────────────────────
    // Validation and migration
    // ───────────────────────────────────────────────────────────

    pub fn validate(&self, doc: &Value) -> ValidationResult {
        self.validator.validate(doc)
    }

    pub fn validate_module_config(&self, module: &Value) -> ValidationResult {
        self.validator.validate_module(module)
    }

    pub fn add_validation_rule(&mut self, rule: ValidationRule) {
        self.validator.add_rule(rule);
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Fill rule defaults into `current`. Returns the number of values
    /// written.
    pub fn apply_defaults(&mut self) -> usize {
        let written = self.validator.apply_defaults(&mut self.current);
        if written > 0 {
            self.dirty = true;
        }
        written
    }

    pub fn migrate(&self, doc: &Value, target: Version) -> Result<Value, ConfigError> {
        migration::migrate(doc, target)
    }

    pub fn needs_migration(&self) -> bool {
        migration::needs_migration(&self.current, CURRENT_VERSION)
    }

    /// Migrate `current` to the supported version.
    pub fn migrate_current(&mut self) -> Result<(), ConfigError> {
        if !self.needs_migration() {
            return Ok(());
        }
        let migrated = migration::migrate(&self.current, CURRENT_VERSION)?;
        self.check(&migrated)?;
        self.current = migrated;
        self.dirty = true;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Document access
    // ───────────────────────────────────────────────────────────

    pub fn current(&self) -> &Value {
        &self.current
    }

    /// Copy of the value at `path`.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        path::get(&self.current, path).cloned()
    }

    pub fn set_value(&mut self, path: &str, value: Value) -> Result<(), ConfigError> {
        path::set(&mut self.current, path, value)?;
        self.dirty = true;
        Ok(())
    }

    pub fn remove_value(&mut self, path: &str) -> Option<Value> {
        let removed = path::remove(&mut self.current, path);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn version(&self) -> String {
        self.current
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Compact serialized size in bytes.
    pub fn size(&self) -> usize {
        compact_size(&self.current)
    }

    /// Lower-case hex MD5 of the compact serialization.
    pub fn hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.current).unwrap_or_default();
        format!("{:x}", md5::compute(bytes))
    }

    // ── Module helpers ────────────────────────────────────────

    pub fn load_module_config(&self, name: &str) -> Option<Value> {
        self.current.get("modules")?.get(name).cloned()
    }

    /// Replace `modules.<name>`. Persisting needs a `save()`.
    pub fn save_module_config(&mut self, name: &str, doc: Value) -> Result<(), ConfigError> {
        if !doc.is_object() {
            return Err(ConfigError::InvalidValue);
        }
        if name.is_empty() || name.contains('.') {
            return Err(ConfigError::InvalidPath);
        }
        let modules = self
            .current
            .as_object_mut()
            .ok_or(ConfigError::InvalidSchema)?
            .entry("modules")
            .or_insert_with(|| json!({}));
        let modules = modules.as_object_mut().ok_or(ConfigError::InvalidSchema)?;
        modules.insert(name.to_string(), doc);
        self.dirty = true;
        Ok(())
    }

    // ── Defaults ──────────────────────────────────────────────

    /// Replace `current` with the compiled-in defaults (not persisted).
    pub fn load_defaults(&mut self) {
        self.current = defaults::default_document();
        self.dirty = true;
        info!("Config: default configuration loaded");
    }

    /// Load the defaults and save them.
    pub fn create_default(&mut self) -> Result<(), ConfigError> {
        self.base()?;
        self.load_defaults();
        self.save()
    }

    /// Write the draft-07 description of the rule table.
    pub fn save_schema(&self, path: &str) -> Result<(), ConfigError> {
        let doc = self.validator.schema_document();
        let text = serde_json::to_vec_pretty(&doc).map_err(|_| ConfigError::SaveFailed)?;
        self.store
            .write_atomic(path, &text)
            .map_err(|_| ConfigError::SaveFailed)
    }

    // ───────────────────────────────────────────────────────────
    // Backups
    // ───────────────────────────────────────────────────────────

    /// Snapshot `current` into the backup directory.
    pub fn create_backup(&mut self, description: Option<&str>) -> Result<BackupRecord, ConfigError> {
        let dir = self.backup_dir()?;
        let version = self.version();
        let mut sequence = self
            .list_backups()
            .iter()
            .map(|r| r.sequence)
            .max()
            .map_or(1, |newest| newest + 1);
        let mut name = backup::filename(sequence, &version, description);
        while self.store.exists(&format!("{dir}/{name}")) {
            sequence += 1;
            name = backup::filename(sequence, &version, description);
        }
        let timestamp = uptime_ms();
        let description = description.map(backup::sanitize_description).filter(|d| !d.is_empty());
        let wrapper = backup::wrap(&self.current, sequence, timestamp, &version, description.as_deref());
        let bytes = serde_json::to_vec_pretty(&wrapper).map_err(|_| ConfigError::SaveFailed)?;
        let path = format!("{dir}/{name}");
        self.store.write_atomic(&path, &bytes).map_err(|e| {
            error!("Config: backup '{}' failed: {}", name, e);
            ConfigError::SaveFailed
        })?;
        debug!("Config: backup '{}' created", name);
        Ok(BackupRecord {
            filename: name,
            sequence,
            timestamp,
            version,
            size: bytes.len() as u64,
            valid: true,
            description,
        })
    }

    /// Every visible `*.json` in the backup directory, oldest first.
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        let Ok(dir) = self.backup_dir() else {
            return Vec::new();
        };
        let entries = match self.store.list_dir(&dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("Config: cannot list backups: {}", e);
                return Vec::new();
            }
        };
        let mut records: Vec<BackupRecord> = entries
            .into_iter()
            .filter(|e| !e.is_dir && backup::is_backup_file(&e.name))
            .map(|e| match self.store.read(&format!("{dir}/{}", e.name)) {
                Ok(bytes) => backup::parse_record(&e.name, &bytes),
                Err(_) => backup::parse_record(&e.name, &[]),
            })
            .collect();
        records.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.filename.cmp(&b.filename)));
        records
    }

    /// Replace `current` with a backup's snapshot (migrated if older) once
    /// it validates.
    pub fn restore(&mut self, filename: &str) -> Result<(), ConfigError> {
        let path = self.backup_file(filename)?;
        let bytes = self.store.read(&path).map_err(|e| match e {
            StorageError::NotFound => ConfigError::BackupNotFound,
            _ => ConfigError::ParseError,
        })?;
        let doc: Value = serde_json::from_slice(&bytes).map_err(|_| ConfigError::ParseError)?;
        let config = self.prepare(backup::unwrap_config(doc))?;
        self.current = config;
        self.dirty = true;
        info!("Config: restored from '{}'", filename);
        Ok(())
    }

    pub fn delete_backup(&self, filename: &str) -> Result<(), ConfigError> {
        let path = self.backup_file(filename)?;
        self.store.remove(&path).map_err(|e| match e {
            StorageError::NotFound => ConfigError::BackupNotFound,
            _ => ConfigError::SaveFailed,
        })
    }

    /// Returns how many backups were removed.
    pub fn delete_all_backups(&self) -> Result<usize, ConfigError> {
        let mut removed = 0;
        let mut failed = false;
        for record in self.list_backups() {
            match self.delete_backup(&record.filename) {
                Ok(()) => removed += 1,
                Err(_) => failed = true,
            }
        }
        if failed { Err(ConfigError::SaveFailed) } else { Ok(removed) }
    }

    /// Delete the oldest backups beyond `keep`. Returns how many were
    /// removed.
    pub fn prune_backups(&self, keep: usize) -> usize {
        let records = self.list_backups();
        let excess = records.len().saturating_sub(keep);
        let removed = records
            .iter()
            .take(excess)
            .filter(|r| self.delete_backup(&r.filename).is_ok())
            .count();
        if removed > 0 {
            info!("Config: pruned {} old backup(s)", removed);
        }
        removed
    }

    fn backup_file(&self, filename: &str) -> Result<String, ConfigError> {
        let dir = self.backup_dir()?;
        if filename.is_empty() || filename.contains('/') || filename.starts_with('.') {
            return Err(ConfigError::InvalidPath);
        }
        Ok(format!("{dir}/{filename}"))
    }

    // ───────────────────────────────────────────────────────────
    // Statistics
    // ───────────────────────────────────────────────────────────

    pub fn statistics(&self) -> ConfigStatistics {
        let backups = self.list_backups();
        ConfigStatistics {
            loads: self.counters.loads,
            load_failures: self.counters.load_failures,
            saves: self.counters.saves,
            save_failures: self.counters.save_failures,
            validation_failures: self.counters.validation_failures,
            backup_count: backups.len(),
            total_backup_size: backups.iter().map(|b| b.size).sum(),
            last_backup: backups.last().map(|b| b.filename.clone()),
            config_size: self.size(),
            config_version: self.version(),
            hash: self.hash(),
            dirty: self.dirty,
        }
    }
}

fn empty_document() -> Value {
    json!({ "version": CURRENT_VERSION.to_string(), "modules": {} })
}

fn compact_size(doc: &Value) -> usize {
    serde_json::to_vec(doc).map_or(usize::MAX, |v| v.len())
}

fn normalize_base(base: &str) -> Result<String, ConfigError> {
    let trimmed = base.trim_end_matches('/');
    if !trimmed.starts_with('/') || trimmed.split('/').any(|s| s == "..") {
        return Err(ConfigError::InvalidPath);
    }
    Ok(trimmed.to_string())
}
