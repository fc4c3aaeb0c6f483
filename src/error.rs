//! Unified error types for the module runtime.
//!
//! One `Copy` enum per core layer (registry, lifecycle, bus, config,
//! storage, watchdog), each convertible into the crate-wide [`Error`] so the
//! lifecycle manager and the boot sequence handle failures uniformly.

use core::fmt;

use crate::module::ModuleState;

// ---------------------------------------------------------------------------
// Top-level runtime error
// ---------------------------------------------------------------------------

/// Every fallible operation in the runtime funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Registry(RegistryError),
    Lifecycle(LifecycleError),
    Bus(BusError),
    Config(ConfigError),
    Storage(StorageError),
    Watchdog(WatchdogError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "registry: {e}"),
            Self::Lifecycle(e) => write!(f, "lifecycle: {e}"),
            Self::Bus(e) => write!(f, "bus: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Watchdog(e) => write!(f, "watchdog: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// A module with the same name is already registered.
    AlreadyRegistered,
    /// No entry under the requested key.
    NotFound,
    /// The entry exists but its call kind cannot be executed (eval).
    Unsupported,
    /// The handler ran and reported failure.
    CallFailed,
    /// An import document did not have the expected shape.
    Malformed,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered => write!(f, "already registered"),
            Self::NotFound => write!(f, "not found"),
            Self::Unsupported => write!(f, "call kind not supported"),
            Self::CallFailed => write!(f, "function call failed"),
            Self::Malformed => write!(f, "malformed registry document"),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    InitFailed,
    StartFailed,
    StopFailed,
    /// The module reported itself unhealthy (self-test or telemetry).
    Unhealthy,
    /// The state machine does not allow this edge.
    InvalidTransition { from: ModuleState, to: ModuleState },
    /// The RTOS refused to create the module task.
    TaskSpawnFailed,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed => write!(f, "init failed"),
            Self::StartFailed => write!(f, "start failed"),
            Self::StopFailed => write!(f, "stop failed"),
            Self::Unhealthy => write!(f, "module unhealthy"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition {} -> {}", from.as_str(), to.as_str())
            }
            Self::TaskSpawnFailed => write!(f, "task spawn failed"),
        }
    }
}

impl From<LifecycleError> for Error {
    fn from(e: LifecycleError) -> Self {
        Self::Lifecycle(e)
    }
}

// ---------------------------------------------------------------------------
// Message bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Capacity reached and the send timeout elapsed.
    QueueFull,
    /// Nothing arrived before the receive timeout.
    QueueEmpty,
    /// The destination has no queue (never created or already torn down).
    QueueNotCreated,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::QueueEmpty => write!(f, "queue empty"),
            Self::QueueNotCreated => write!(f, "queue not created"),
        }
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// The first six variants mirror the validation taxonomy; the rest cover
/// engine operations around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    FileNotFound,
    ParseError,
    InvalidVersion,
    InvalidSchema,
    MissingRequired,
    InvalidValue,
    /// Serialization or write failed; the previous file is untouched.
    SaveFailed,
    /// `initialize()` has not been called.
    NotInitialized,
    BackupNotFound,
    /// A path segment resolved to a non-object.
    InvalidPath,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileNotFound => write!(f, "configuration file not found"),
            Self::ParseError => write!(f, "configuration parse error"),
            Self::InvalidVersion => write!(f, "unsupported configuration version"),
            Self::InvalidSchema => write!(f, "configuration schema invalid"),
            Self::MissingRequired => write!(f, "required field missing"),
            Self::InvalidValue => write!(f, "invalid field value"),
            Self::SaveFailed => write!(f, "save failed"),
            Self::NotInitialized => write!(f, "config engine not initialized"),
            Self::BackupNotFound => write!(f, "backup not found"),
            Self::InvalidPath => write!(f, "invalid path"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    /// Partition (or simulated quota) exhausted.
    Full,
    Io,
    InvalidPath,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "file not found"),
            Self::Full => write!(f, "storage full"),
            Self::Io => write!(f, "I/O error"),
            Self::InvalidPath => write!(f, "invalid path"),
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::StorageFull => Self::Full,
            std::io::ErrorKind::InvalidInput => Self::InvalidPath,
            _ => Self::Io,
        }
    }
}

// ---------------------------------------------------------------------------
// Watchdog errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogError {
    NotInitialized,
    AlreadyInitialized,
    /// Fatal: the reset path has been taken.
    TimeoutExpired,
    /// An ESP-IDF call returned a non-OK `esp_err_t`.
    Platform(i32),
}

impl fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "watchdog not initialized"),
            Self::AlreadyInitialized => write!(f, "watchdog already initialized"),
            Self::TimeoutExpired => write!(f, "watchdog timeout expired"),
            Self::Platform(code) => write!(f, "esp_err_t {code}"),
        }
    }
}

impl From<WatchdogError> for Error {
    fn from(e: WatchdogError) -> Self {
        Self::Watchdog(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Runtime-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
