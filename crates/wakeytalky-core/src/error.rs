//! Core error types for wakeytalky-core.
//!
//! Every failure in the alarm core is recoverable at the call site; nothing in
//! here is meant to bring the host process down.

use std::path::PathBuf;
use thiserror::Error;

use crate::ring::RingState;

/// Core error type for wakeytalky-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad alarm input (time of day, weekdays, snooze interval)
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Business-rule rejections and unknown ids
    #[error("Alarm error: {0}")]
    Alarm(#[from] AlarmError),

    /// Storage I/O failures
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Collaborator (notification, voice) failures
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl CoreError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Persistence(e) => e.is_retryable(),
            CoreError::Platform(_) => true,
            _ => false,
        }
    }
}

/// Invalid alarm schedule data. Non-retryable; the user has to fix the input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid schedule field '{field}': {message}")]
    InvalidSchedule { field: String, message: String },
}

impl ScheduleError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ScheduleError::InvalidSchedule {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Errors raised by the ring state machine and the challenge gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlarmError {
    /// Expected rejection: the snooze ceiling is reached
    #[error("Snooze limit reached ({max} snoozes allowed)")]
    SnoozeLimitExceeded { max: u32 },

    /// The alarm was configured without snooze
    #[error("Snooze is disabled for this alarm")]
    SnoozeDisabled,

    #[error("Unknown task '{0}' in challenge snapshot")]
    UnknownTask(String),

    #[error("Unknown alarm instance '{0}'")]
    UnknownInstance(String),

    #[error("Unknown alarm '{0}'")]
    UnknownAlarm(String),

    #[error("Cannot {action} while {from}")]
    InvalidTransition { from: RingState, action: &'static str },
}

/// Storage failures. Transient unless it is a serialization bug.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode/decode alarm state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Storage operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Storage worker failed: {0}")]
    Join(String),

    #[error("Storage lock poisoned")]
    Lock,

    /// Another process saved since this one last read the store
    #[error("Alarm state changed on disk (expected revision {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },

    #[error("Save failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<PersistenceError>,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, PersistenceError::Serialize(_) | PersistenceError::Conflict { .. })
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Failures reported by external collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator call timed out after {ms}ms")]
    Timeout { ms: u64 },
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
