//! Remote collaborator traits.
//!
//! The cache never talks to the management service directly. Everything it
//! needs from the remote side goes through these traits, which a transport
//! adapter implements (and [`crate::MockRemoteService`] implements for tests).

use async_trait::async_trait;
use cimcache_core::{Association, CimCacheResult, ObjectKey, PropertyValue, RemoteInstance, ServiceState};
use std::time::Duration;

/// Fetches and writes single remote objects.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    /// Fetch every property of the object identified by `key`.
    async fn fetch_instance(&self, key: &ObjectKey) -> CimCacheResult<RemoteInstance>;

    /// Fetch the named properties (plus the key properties) of `key`.
    async fn fetch_partial(
        &self,
        key: &ObjectKey,
        properties: &[String],
    ) -> CimCacheResult<RemoteInstance>;

    /// Write modified property values back to the remote object.
    async fn modify_instance(
        &self,
        key: &ObjectKey,
        values: &[(String, PropertyValue)],
    ) -> CimCacheResult<()>;
}

/// Enumerates objects related to a source object.
#[async_trait]
pub trait RelationshipResolver: Send + Sync {
    async fn enumerate_related(
        &self,
        key: &ObjectKey,
        association: &Association,
    ) -> CimCacheResult<Vec<RemoteInstance>>;
}

/// Reads the run state of the remote management service.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Read the service state. Implementations should give up after
    /// `timeout`; callers also bound the call themselves.
    async fn read_service_state(&self, timeout: Duration) -> CimCacheResult<ServiceState>;
}

/// Everything a connection needs from the remote side.
pub trait RemoteService: InstanceResolver + RelationshipResolver + LivenessProbe {}

impl<T> RemoteService for T where T: InstanceResolver + RelationshipResolver + LivenessProbe {}
