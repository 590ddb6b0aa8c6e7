//! Connection handle with its flush epoch.

use crate::remote::{LivenessProbe, RemoteService};
use cimcache_core::ConnectionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One live connection to a remote management service.
///
/// Besides the service handle, a connection carries a flush epoch. Every
/// cache records the epoch it observed when its refresh started; a cache
/// whose recorded epoch is older than the connection's current one is stale
/// regardless of its time threshold.
pub struct Connection {
    id: ConnectionId,
    service: Arc<dyn RemoteService>,
    flush_epoch: AtomicU64,
}

impl Connection {
    pub fn new(id: ConnectionId, service: Arc<dyn RemoteService>) -> Self {
        Self {
            id,
            service,
            flush_epoch: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn service(&self) -> &Arc<dyn RemoteService> {
        &self.service
    }

    /// The service as a liveness probe, for the task connection testers.
    pub fn probe(&self) -> Arc<dyn LivenessProbe> {
        Arc::new(ServiceProbe(self.service.clone()))
    }

    /// Current flush epoch.
    pub fn flush_epoch(&self) -> u64 {
        self.flush_epoch.load(Ordering::Acquire)
    }

    /// Mark every cache on this connection stale.
    ///
    /// Returns the new epoch.
    pub fn flush_all_caches(&self) -> u64 {
        let epoch = self.flush_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(connection = %self.id, epoch, "Flushed all caches");
        epoch
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("flush_epoch", &self.flush_epoch())
            .finish()
    }
}

/// Narrows a full service handle to its liveness probe.
struct ServiceProbe(Arc<dyn RemoteService>);

#[async_trait::async_trait]
impl LivenessProbe for ServiceProbe {
    async fn read_service_state(
        &self,
        timeout: std::time::Duration,
    ) -> cimcache_core::CimCacheResult<cimcache_core::ServiceState> {
        self.0.read_service_state(timeout).await
    }
}
