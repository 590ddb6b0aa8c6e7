//! Property and association caches.
//!
//! Both cache kinds share the [`CacheBase`] freshness policy and refresh
//! through the [`Refreshable`] trait. Callers pass a staleness threshold on
//! every update; the cache decides whether a remote round trip is needed.

pub mod association;
pub mod base;
pub mod property;

pub use association::{AssociationCache, AssociationCacheManager};
pub use base::{CacheBase, Refreshable};
pub use property::{
    PropertyCache, RefreshMode, SYSTEM_CLASS, SYSTEM_NAMESPACE, SYSTEM_PATH, SYSTEM_SERVER,
};
