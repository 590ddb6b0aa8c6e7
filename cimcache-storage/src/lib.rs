//! CIMCACHE Storage - Proxy Cache and Liveness Substrate
//!
//! Client-side caching between generated object views and a remote
//! management service:
//!
//! - [`ProxyRepository`]: identity map from [`ObjectKey`](cimcache_core::ObjectKey)
//!   to [`Proxy`], with strong/weak demotion and a background sweep.
//! - [`PropertyCache`] and [`AssociationCacheManager`]: per-object caches
//!   with threshold-based refresh and connection flush epochs.
//! - [`InstanceEventManager`]: shared change-event monitors.
//! - [`TaskConnectionTesters`]: per-connection liveness probing that fails
//!   outstanding tasks when a connection dies.
//! - [`ObjectCache`]: the facade tying them together.
//!
//! The remote side is reached only through the traits in [`remote`].

pub mod cache;
pub mod connection;
pub mod events;
pub mod facade;
pub mod liveness;
pub mod mock;
pub mod proxy;
pub mod remote;
pub mod repository;

pub use cache::{
    AssociationCache, AssociationCacheManager, CacheBase, PropertyCache, RefreshMode, Refreshable,
};
pub use connection::Connection;
pub use events::{EventListener, InstanceEventManager, InstanceEventMonitor, ListenerId};
pub use facade::ObjectCache;
pub use liveness::{
    PendingTask, ProbeOutcome, RemoteTask, TaskConnectionTester, TaskConnectionTesters, TaskStatus,
};
pub use mock::MockRemoteService;
pub use proxy::{Proxy, ProxyEvent};
pub use remote::{InstanceResolver, LivenessProbe, RelationshipResolver, RemoteService};
pub use repository::{ProxyRepository, RepositoryStats, SweepReport};
