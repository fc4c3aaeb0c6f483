//! File storage adapters.
//!
//! Implements [`FileStore`] twice:
//!
//! - [`StdFileStore`]: `std::fs` rooted at a mount point. On ESP-IDF the
//!   SPIFFS partition is registered with the VFS ([`mount_spiffs`]) so the
//!   same code path runs on device and on the host (against a temp dir).
//! - [`MemFileStore`]: in-memory simulation backend with an optional byte
//!   quota, so disk-full paths can be exercised in tests.
//!
//! Both take a single mutex around every operation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};

use crate::error::StorageError;
use crate::ports::{DirEntry, FileStore, StoreUsage};

const TMP_SUFFIX: &str = ".tmp";

/// Reject anything that could climb out of the store root.
fn check_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(StorageError::InvalidPath);
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(StorageError::InvalidPath);
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────
// StdFileStore
// ───────────────────────────────────────────────────────────────

pub struct StdFileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl StdFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("StdFileStore: rooted at {}", root.display());
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        check_path(path)?;
        Ok(self.root.join(path.trim_start_matches('/')))
    }

    fn dir_size(path: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(path) else {
            return 0;
        };
        entries
            .flatten()
            .map(|e| match e.metadata() {
                Ok(m) if m.is_dir() => Self::dir_size(&e.path()),
                Ok(m) => m.len(),
                Err(_) => 0,
            })
            .sum()
    }
}

impl FileStore for StdFileStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        let _g = self.guard();
        Ok(fs::read(full)?)
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let mut tmp = full.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let _g = self.guard();
        let written = fs::File::create(&tmp).and_then(|mut f| {
            f.write_all(data)?;
            f.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &full) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let _g = self.guard();
        let mut f = fs::OpenOptions::new().create(true).append(true).open(full)?;
        f.write_all(data)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let _g = self.guard();
        if full.is_dir() {
            fs::remove_dir(full)?;
        } else {
            fs::remove_file(full)?;
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let Ok(full) = self.resolve(path) else {
            return false;
        };
        let _g = self.guard();
        full.exists()
    }

    fn size(&self, path: &str) -> Option<u64> {
        let full = self.resolve(path).ok()?;
        let _g = self.guard();
        fs::metadata(full).ok().filter(|m| m.is_file()).map(|m| m.len())
    }

    fn create_dir_all(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let _g = self.guard();
        fs::create_dir_all(full)?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let full = self.resolve(path)?;
        let _g = self.guard();
        let mut out = Vec::new();
        for entry in fs::read_dir(full)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                is_dir: meta.is_dir(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn for_each_line(&self, path: &str, f: &mut dyn FnMut(&str)) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let _g = self.guard();
        let mut reader = BufReader::new(fs::File::open(full)?);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            f(line.trim_end_matches(['\n', '\r']));
        }
        Ok(())
    }

    fn format(&self) -> Result<(), StorageError> {
        let _g = self.guard();
        warn!("StdFileStore: formatting {}", self.root.display());
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn usage(&self) -> StoreUsage {
        let mut total: usize = 0;
        let mut used: usize = 0;
        // SAFETY: null label selects the first registered SPIFFS partition.
        let ret = unsafe { esp_idf_svc::sys::esp_spiffs_info(core::ptr::null(), &mut total, &mut used) };
        if ret != esp_idf_svc::sys::ESP_OK {
            warn!("StdFileStore: esp_spiffs_info returned {}", ret);
        }
        StoreUsage {
            total_bytes: total as u64,
            used_bytes: used as u64,
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn usage(&self) -> StoreUsage {
        let _g = self.guard();
        let used = Self::dir_size(&self.root);
        StoreUsage {
            total_bytes: 0,
            used_bytes: used,
        }
    }
}

/// Register the SPIFFS partition with the VFS at `mount_point`.
#[cfg(target_os = "espidf")]
pub fn mount_spiffs(mount_point: &'static core::ffi::CStr) -> Result<(), StorageError> {
    use esp_idf_svc::sys::*;

    let conf = esp_vfs_spiffs_conf_t {
        base_path: mount_point.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 8,
        format_if_mount_failed: true,
    };
    // SAFETY: `conf` outlives the call; the mount point string is 'static.
    let ret = unsafe { esp_vfs_spiffs_register(&conf) };
    if ret != ESP_OK {
        log::error!("SPIFFS: mount failed ({})", ret);
        return Err(StorageError::Io);
    }
    info!("SPIFFS: mounted at {:?}", mount_point);
    Ok(())
}

// ───────────────────────────────────────────────────────────────
// MemFileStore (simulation)
// ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemInner {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl MemInner {
    fn used(&self) -> u64 {
        self.files.values().map(|v| v.len() as u64).sum()
    }

    fn dir_exists(&self, path: &str) -> bool {
        path == "/" || self.dirs.contains(path)
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn normalize(path: &str) -> Result<String, StorageError> {
    check_path(path)?;
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".into() } else { trimmed.into() })
}

/// In-memory store. `quota` caps the total bytes held across all files.
pub struct MemFileStore {
    inner: Mutex<MemInner>,
    quota: Mutex<Option<u64>>,
}

impl Default for MemFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFileStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner::default()),
            quota: Mutex::new(None),
        }
    }

    pub fn with_quota(bytes: u64) -> Self {
        let store = Self::new();
        store.set_quota(Some(bytes));
        store
    }

    pub fn set_quota(&self, bytes: Option<u64>) {
        *self.quota.lock().unwrap_or_else(PoisonError::into_inner) = bytes;
    }

    fn guard(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn quota(&self) -> Option<u64> {
        *self.quota.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_quota(&self, inner: &MemInner, path: &str, new_len: u64) -> Result<(), StorageError> {
        if let Some(limit) = self.quota() {
            let old = inner.files.get(path).map_or(0, |v| v.len() as u64);
            if inner.used() - old + new_len > limit {
                return Err(StorageError::Full);
            }
        }
        Ok(())
    }
}

impl FileStore for MemFileStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let path = normalize(path)?;
        self.guard().files.get(&path).cloned().ok_or(StorageError::NotFound)
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = normalize(path)?;
        let mut inner = self.guard();
        if !inner.dir_exists(parent_of(&path)) {
            return Err(StorageError::NotFound);
        }
        self.check_quota(&inner, &path, data.len() as u64)?;
        inner.files.insert(path, data.to_vec());
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = normalize(path)?;
        let mut inner = self.guard();
        if !inner.dir_exists(parent_of(&path)) {
            return Err(StorageError::NotFound);
        }
        let old = inner.files.get(&path).map_or(0, |v| v.len() as u64);
        self.check_quota(&inner, &path, old + data.len() as u64)?;
        inner.files.entry(path).or_default().extend_from_slice(data);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize(path)?;
        let mut inner = self.guard();
        if inner.files.remove(&path).is_some() {
            return Ok(());
        }
        let prefix = format!("{path}/");
        let has_children = inner.files.keys().any(|k| k.starts_with(&prefix))
            || inner.dirs.iter().any(|d| d.starts_with(&prefix));
        if has_children {
            return Err(StorageError::Io);
        }
        if inner.dirs.remove(&path) {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    fn exists(&self, path: &str) -> bool {
        let Ok(path) = normalize(path) else {
            return false;
        };
        let inner = self.guard();
        inner.files.contains_key(&path) || inner.dir_exists(&path)
    }

    fn size(&self, path: &str) -> Option<u64> {
        let path = normalize(path).ok()?;
        self.guard().files.get(&path).map(|v| v.len() as u64)
    }

    fn create_dir_all(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize(path)?;
        let mut inner = self.guard();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if inner.files.contains_key(&current) {
                return Err(StorageError::InvalidPath);
            }
            inner.dirs.insert(current.clone());
        }
        Ok(())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let path = normalize(path)?;
        let inner = self.guard();
        if !inner.dir_exists(&path) {
            return Err(StorageError::NotFound);
        }
        let mut out: Vec<DirEntry> = inner
            .files
            .iter()
            .filter(|(k, _)| parent_of(k) == path)
            .map(|(k, v)| DirEntry {
                name: k[k.rfind('/').map_or(0, |i| i + 1)..].to_string(),
                size: v.len() as u64,
                is_dir: false,
            })
            .collect();
        out.extend(
            inner
                .dirs
                .iter()
                .filter(|d| parent_of(d) == path && d.as_str() != path)
                .map(|d| DirEntry {
                    name: d[d.rfind('/').map_or(0, |i| i + 1)..].to_string(),
                    size: 0,
                    is_dir: true,
                }),
        );
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn for_each_line(&self, path: &str, f: &mut dyn FnMut(&str)) -> Result<(), StorageError> {
        let path = normalize(path)?;
        let inner = self.guard();
        let data = inner.files.get(&path).ok_or(StorageError::NotFound)?;
        for line in data.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(line);
            f(line.trim_end_matches('\r'));
        }
        Ok(())
    }

    fn format(&self) -> Result<(), StorageError> {
        let mut inner = self.guard();
        inner.files.clear();
        inner.dirs.clear();
        Ok(())
    }

    fn usage(&self) -> StoreUsage {
        let inner = self.guard();
        StoreUsage {
            total_bytes: self.quota().unwrap_or(0),
            used_bytes: inner.used(),
        }
    }
}
