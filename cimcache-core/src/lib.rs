//! CIMCACHE Core - Value Types
//!
//! Identity, descriptor, value and error types shared by the cache substrate.
//! Pure data: no I/O, no runtime, no locks.

pub mod association;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod identity;
pub mod value;

pub use association::{Association, AssociationKind};
pub use config::{
    CacheConfig, DEFAULT_EVENT_POLL_INTERVAL, DEFAULT_INACTIVITY_THRESHOLD, DEFAULT_PROBE_INTERVAL,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_SWEEP_PERIOD,
};
pub use error::{
    CimCacheError, CimCacheResult, ConfigError, MappingError, RemoteError, StorageError, TaskError,
    UsageError, UsageResult,
};
pub use event::{EventKey, InstanceEvent, InstanceEventType};
pub use health::ServiceState;
pub use identity::{ConnectionId, ObjectKey, ObjectKeyBuilder, TaskId};
pub use value::{PropertyValue, RemoteInstance};
