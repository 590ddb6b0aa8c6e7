//! Error types for CIMCACHE operations

use crate::{ConnectionId, ObjectKey};
use std::time::Duration;
use thiserror::Error;

/// Misuse of a cache API or a structurally invalid state transition.
///
/// These are programmer errors. They are raised synchronously at the call
/// site and never swallowed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("Entry for {key} is already a weak reference")]
    AlreadyWeak { key: ObjectKey },

    #[error("Entry for {key} still holds a live proxy and cannot be resurrected")]
    NotCollected { key: ObjectKey },

    #[error("Invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("Invalid object key: {reason}")]
    InvalidKey { reason: String },
}

/// Failures reported by (or while talking to) the remote management service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote object not found: {path}")]
    NotFound { path: String },

    #[error("Connection to {connection} failed: {reason}")]
    ConnectionFailed {
        connection: ConnectionId,
        reason: String,
    },

    #[error("Call to {connection} failed: {reason}")]
    CallFailed {
        connection: ConnectionId,
        reason: String,
    },

    #[error("Class {class_name} has no member {member}")]
    ClassDefinitionMismatch { class_name: String, member: String },

    #[error("No connection registered for {connection}")]
    UnknownConnection { connection: ConnectionId },
}

/// A remote instance could not be mapped onto an object key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("Cannot map instance of class '{class_name}': {reason}")]
    UnmappedInstance { class_name: String, reason: String },
}

/// Asynchronous task failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task failed: lost connection to {connection}")]
    Disconnected { connection: ConnectionId },

    #[error("Task failed: management service on {connection} is not running")]
    ServiceNotRunning { connection: ConnectionId },

    #[error("Timed out after {timeout:?} waiting for task completion")]
    WaitTimedOut { timeout: Duration },

    #[error("Task failed with code {code}: {message}")]
    Failed { code: i64, message: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Internal storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Master error type for all CIMCACHE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CimCacheError {
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CimCacheError {
    /// Whether this error means the remote service cannot be reached.
    ///
    /// The liveness prober treats these as grounds to fail every outstanding
    /// task on the connection.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            CimCacheError::Remote(RemoteError::ConnectionFailed { .. })
                | CimCacheError::Remote(RemoteError::CallFailed { .. })
                | CimCacheError::Task(TaskError::Disconnected { .. })
                | CimCacheError::Task(TaskError::ServiceNotRunning { .. })
        )
    }

    /// Whether this error is a programmer error.
    pub fn is_usage(&self) -> bool {
        matches!(self, CimCacheError::Usage(_))
    }
}

/// Result type alias for CIMCACHE operations.
pub type CimCacheResult<T> = Result<T, CimCacheError>;

/// Result type alias for operations that can only fail through misuse.
pub type UsageResult<T> = Result<T, UsageError>;

// =============================================================================
// TESTS
// =============================================================================
