//! File-backed log sink.
//!
//! [`FileLogSink`] is a `log::Log` implementation that forwards every record
//! to the console logger and queues a formatted line for the filesystem
//! module. The filesystem task drains that queue into [`LogFile`]s, so no
//! caller ever blocks on flash I/O to log.
//!
//! ```text
//!   log::info!(..) ──► FileLogSink ──► console (EspLogger)
//!                          │
//!                          └─ try_send ──► [bounded queue] ──► CONTROL_FS ──► /logs/system.log
//! ```
//!
//! Rotation streams the file through a ring of the last `keep_lines` lines
//! and rewrites it atomically. Memory is bounded by the line count, not by
//! the file size.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_channel::{Receiver, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::adapters::time::uptime_ms;
use crate::error::StorageError;
use crate::ports::SharedStore;

pub const SYSTEM_LOG: &str = "/logs/system.log";
pub const DEBUG_LOG: &str = "/logs/debug.log";
pub const LOG_MAX_BYTES: u64 = 1024 * 1024;
pub const LOG_KEEP_LINES: usize = 1000;
const MAX_LINE_BYTES: usize = 256;

/// One formatted record waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

pub type LogReceiver = Receiver<LogLine>;

/// Severity tag used in the log files.
pub fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug | Level::Trace => "DEBUG",
    }
}

fn truncate_at_char(s: &mut String, max: usize) {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
}

// ───────────────────────────────────────────────────────────────
// FileLogSink
// ───────────────────────────────────────────────────────────────

pub struct FileLogSink {
    console: Option<Box<dyn Log>>,
    tx: Sender<LogLine>,
    level: LevelFilter,
    dropped: AtomicU32,
}

impl FileLogSink {
    /// Build a sink plus the receiving end the filesystem module drains.
    pub fn new(console: Option<Box<dyn Log>>, level: LevelFilter, capacity: usize) -> (Self, LogReceiver) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                console,
                tx,
                level,
                dropped: AtomicU32::new(0),
            },
            rx,
        )
    }

    /// Install as the global logger.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.level);
        log::set_boxed_logger(Box::new(self))
    }

    /// Lines discarded because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Log for FileLogSink {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(console) = &self.console {
            console.log(record);
        }

        let mut text = String::with_capacity(96);
        let _ = write!(
            text,
            "[{}][{}][{}] {}",
            uptime_ms(),
            level_tag(record.level()),
            record.target(),
            record.args()
        );
        truncate_at_char(&mut text, MAX_LINE_BYTES);
        let line = LogLine {
            level: record.level(),
            text,
        };
        if self.tx.try_send(line).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {
        if let Some(console) = &self.console {
            console.flush();
        }
    }
}

// ───────────────────────────────────────────────────────────────
// LogFile
// ───────────────────────────────────────────────────────────────

/// Append-only text log with size-triggered rotation.
pub struct LogFile {
    store: SharedStore,
    path: String,
    max_bytes: u64,
    keep_lines: usize,
}

impl LogFile {
    pub fn new(store: SharedStore, path: &str) -> Self {
        Self::with_limits(store, path, LOG_MAX_BYTES, LOG_KEEP_LINES)
    }

    pub fn with_limits(store: SharedStore, path: &str, max_bytes: u64, keep_lines: usize) -> Self {
        Self {
            store,
            path: path.to_string(),
            max_bytes,
            keep_lines: keep_lines.max(1),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn append_line(&self, line: &str) -> Result<(), StorageError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        truncate_at_char(&mut buf, MAX_LINE_BYTES);
        buf.push('\n');
        self.store.append(&self.path, buf.as_bytes())
    }

    pub fn size(&self) -> u64 {
        self.store.size(&self.path).unwrap_or(0)
    }

    pub fn needs_rotation(&self) -> bool {
        self.size() > self.max_bytes
    }

    /// Keep only the newest `keep_lines` lines. Returns how many survived.
    pub fn rotate(&self) -> Result<usize, StorageError> {
        let ring = self.collect_tail(self.keep_lines)?;
        let mut out = String::with_capacity(ring.iter().map(|l| l.len() + 1).sum());
        for line in &ring {
            out.push_str(line);
            out.push('\n');
        }
        self.store.write_atomic(&self.path, out.as_bytes())?;
        log::debug!("LogFile: rotated {} ({} lines kept)", self.path, ring.len());
        Ok(ring.len())
    }

    pub fn rotate_if_needed(&self) -> Result<bool, StorageError> {
        if self.needs_rotation() {
            self.rotate()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// The newest `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<String>, StorageError> {
        Ok(self.collect_tail(n)?.into_iter().collect())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.store.write_atomic(&self.path, b"")
    }

    fn collect_tail(&self, n: usize) -> Result<VecDeque<String>, StorageError> {
        let mut ring: VecDeque<String> = VecDeque::with_capacity(n.min(LOG_KEEP_LINES));
        if n == 0 {
            return Ok(ring);
        }
        self.store.for_each_line(&self.path, &mut |line| {
            if ring.len() == n {
                ring.pop_front();
            }
            let mut owned = line.to_string();
            truncate_at_char(&mut owned, MAX_LINE_BYTES);
            ring.push_back(owned);
        })?;
        Ok(ring)
    }
}
