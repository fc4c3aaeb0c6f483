//! `CONTROL_FS`: storage owner.
//!
//! Lays out the directory tree, refreshes the bundled files when the
//! firmware version changes, brings up the config engine and writes the
//! log queue to `/logs/*.log`.

use std::sync::PoisonError;

use log::{Level, debug, error, info, warn};
use serde_json::{Value, json};

use crate::adapters::log_sink::{DEBUG_LOG, LogFile, LogLine, LogReceiver, SYSTEM_LOG};
use crate::config::defaults::{FIRMWARE_VERSION, default_files};
use crate::config::{DEFAULT_BASE_PATH, SharedConfig};
use crate::error::{LifecycleError, RegistryError, Result, StorageError};
use crate::module::{CONTROL_FS, Module, ModuleCore};
use crate::ports::SharedStore;
use crate::task::Core;

use super::str_param;

/// Holds the firmware version the bundled files were written for.
pub const INIT_MARKER: &str = "/.init";
pub const DIRECTORIES: [&str; 5] = ["/config", "/logs", "/web", "/data", "/tmp"];
/// Lines written per `update()`.
pub const LOG_BATCH: usize = 32;
const DEFAULT_BACKUP_COUNT: u64 = 10;
const SELF_TEST_FILE: &str = "/tmp/.selftest";

pub struct FsModule {
    core: ModuleCore,
    store: SharedStore,
    config: SharedConfig,
    logs: Option<LogReceiver>,
    system_log: LogFile,
    debug_log: LogFile,
    lines_written: u64,
    rotations: u32,
}

impl FsModule {
    pub fn new(store: SharedStore, config: SharedConfig) -> Self {
        let mut core = ModuleCore::new(CONTROL_FS)
            .with_priority(100)
            .with_autostart(true)
            .with_critical(true)
            .pinned_to(Core::Pro);
        core.task_cfg.stack_bytes = 6144;
        Self {
            core,
            system_log: LogFile::new(store.clone(), SYSTEM_LOG),
            debug_log: LogFile::new(store.clone(), DEBUG_LOG),
            store,
            config,
            logs: None,
            lines_written: 0,
            rotations: 0,
        }
    }

    /// Receiving end of the `FileLogSink` queue.
    #[must_use]
    pub fn with_log_receiver(mut self, logs: LogReceiver) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Re-format the store and write the bundled files when `/.init` does
    /// not match the firmware version. Returns `true` when it did.
    pub fn refresh_bundled_files(&self) -> Result<bool> {
        let marker = self
            .store
            .read(INIT_MARKER)
            .ok()
            .and_then(|b| String::from_utf8(b).ok());
        if marker.as_deref().map(str::trim) == Some(FIRMWARE_VERSION) {
            return Ok(false);
        }
        warn!(
            "FS: init marker {:?} != firmware {}, formatting",
            marker.as_deref().map(str::trim),
            FIRMWARE_VERSION
        );
        self.store.format()?;
        for dir in DIRECTORIES {
            self.store.create_dir_all(dir)?;
        }
        for (path, content) in default_files() {
            self.store.write_atomic(path, content.as_bytes())?;
        }
        self.store.write_atomic(INIT_MARKER, FIRMWARE_VERSION.as_bytes())?;
        info!("FS: bundled files written for {}", FIRMWARE_VERSION);
        Ok(true)
    }

    fn bring_up_config(&self) -> Result<()> {
        let mut engine = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        engine.initialize(DEFAULT_BASE_PATH)?;
        if let Err(e) = engine.load() {
            warn!("FS: config load failed ({}), falling back to defaults", e);
            engine.load_defaults();
            if let Err(e) = engine.save() {
                error!("FS: could not persist default config: {}", e);
            }
        }
        let keep = engine
            .get_value("backup_settings.backup_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_BACKUP_COUNT);
        let pruned = engine.prune_backups(keep as usize);
        if pruned > 0 {
            info!("FS: pruned {} old backups", pruned);
        }
        Ok(())
    }

    fn write_line(&mut self, line: &LogLine) {
        let file = if line.level <= Level::Info {
            &self.system_log
        } else {
            &self.debug_log
        };
        // No log on failure: it would feed the queue being drained.
        if file.append_line(&line.text).is_ok() {
            self.lines_written += 1;
        }
    }

    /// Write up to `max` queued lines, then rotate oversized files.
    pub fn drain_logs(&mut self, max: usize) -> usize {
        let batch: Vec<LogLine> = match &self.logs {
            Some(rx) => rx.try_iter().take(max).collect(),
            None => return 0,
        };
        for line in &batch {
            self.write_line(line);
        }
        for file in [&self.system_log, &self.debug_log] {
            if matches!(file.rotate_if_needed(), Ok(true)) {
                self.rotations += 1;
            }
        }
        batch.len()
    }

    fn info(&self) -> core::result::Result<Value, StorageError> {
        let root = self.store.list_dir("/")?;
        Ok(json!({
            "usage": self.store.usage(),
            "entries": root.iter().map(|e| json!({ "name": e.name, "size": e.size, "dir": e.is_dir })).collect::<Vec<_>>(),
            "system_log_bytes": self.system_log.size(),
            "debug_log_bytes": self.debug_log.size(),
        }))
    }

    fn config_call(&self, name: &str, params: &Value) -> core::result::Result<Value, RegistryError> {
        let mut engine = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        match name {
            "config_get" => {
                let path = str_param(params, "path").ok_or(RegistryError::CallFailed)?;
                engine.get_value(path).ok_or(RegistryError::NotFound)
            }
            "config_set" => {
                let path = str_param(params, "path").ok_or(RegistryError::CallFailed)?;
                let value = params.get("value").cloned().ok_or(RegistryError::CallFailed)?;
                engine.set_value(path, value).map_err(|e| {
                    warn!("FS: config_set '{}' failed: {}", path, e);
                    RegistryError::CallFailed
                })?;
                Ok(json!(true))
            }
            "config_save" => {
                engine.save().map_err(|e| {
                    warn!("FS: config_save failed: {}", e);
                    RegistryError::CallFailed
                })?;
                Ok(json!({ "hash": engine.hash(), "size": engine.size() }))
            }
            "backup_create" => {
                let desc = params.get("description").and_then(Value::as_str);
                let record = engine.create_backup(desc).map_err(|e| {
                    warn!("FS: backup_create failed: {}", e);
                    RegistryError::CallFailed
                })?;
                Ok(json!(record))
            }
            "backup_list" => Ok(json!(engine.list_backups())),
            _ => Err(RegistryError::NotFound),
        }
    }
}

impl Module for FsModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<()> {
        for dir in DIRECTORIES {
            self.store.create_dir_all(dir)?;
        }
        self.refresh_bundled_files()?;
        self.bring_up_config()?;
        let usage = self.store.usage();
        info!(
            "FS: ready ({} of {} bytes used)",
            usage.used_bytes, usage.total_bytes
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.logs.is_none() {
            debug!("FS: no log queue attached");
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let flushed = self.drain_logs(usize::MAX);
        debug!("FS: flushed {} log lines on stop", flushed);
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.drain_logs(LOG_BATCH);
        Ok(())
    }

    fn test(&mut self) -> Result<()> {
        let pattern = b"selftest";
        self.store.write_atomic(SELF_TEST_FILE, pattern)?;
        let back = self.store.read(SELF_TEST_FILE)?;
        self.store.remove(SELF_TEST_FILE)?;
        if back != pattern {
            return Err(LifecycleError::Unhealthy.into());
        }
        Ok(())
    }

    fn status(&self) -> Value {
        self.core.status_with(json!({
            "usage": self.store.usage(),
            "log_lines_written": self.lines_written,
            "log_rotations": self.rotations,
        }))
    }

    fn call_function_by_name(&mut self, name: &str, params: &Value) -> core::result::Result<Value, RegistryError> {
        match name {
            "fs_info" => self.info().map_err(|e| {
                warn!("FS: fs_info failed: {}", e);
                RegistryError::CallFailed
            }),
            _ => self.config_call(name, params),
        }
    }
}
