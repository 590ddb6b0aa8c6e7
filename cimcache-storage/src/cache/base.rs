//! Time-threshold freshness shared by property and association caches.
//!
//! A cache is stale when any of the following holds:
//!
//! - it has never completed a full refresh,
//! - it was invalidated explicitly,
//! - the time since its last refresh is at least the caller's threshold,
//! - its last refresh lies in the future (clock skew),
//! - the connection's flush epoch advanced after the refresh started.
//!
//! The threshold is supplied per call, not stored. A zero threshold always
//! reports stale.

use crate::connection::Connection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cimcache_core::CimCacheResult;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct FreshnessState {
    initialized: bool,
    last_refresh: Option<DateTime<Utc>>,
    epoch: u64,
}

/// Freshness bookkeeping for one cache.
#[derive(Debug)]
pub struct CacheBase {
    connection: Arc<Connection>,
    state: Mutex<FreshnessState>,
}

impl CacheBase {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            state: Mutex::new(FreshnessState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FreshnessState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Cache freshness lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.state().last_refresh
    }

    pub fn needs_update(&self, threshold: Duration) -> bool {
        self.needs_update_at(threshold, Utc::now())
    }

    /// [`needs_update`](Self::needs_update) evaluated at an explicit instant.
    pub fn needs_update_at(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let state = self.state();
        if !state.initialized {
            return true;
        }
        let Some(last_refresh) = state.last_refresh else {
            return true;
        };
        if state.epoch < self.connection.flush_epoch() {
            return true;
        }

        let elapsed = now.signed_duration_since(last_refresh);
        if elapsed < chrono::Duration::zero() {
            return true;
        }
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => elapsed >= threshold,
            // Thresholds beyond chrono's range never expire.
            Err(_) => false,
        }
    }

    /// Mark the cache stale. The cached data stays readable.
    pub fn invalidate(&self) {
        self.state().last_refresh = None;
    }

    /// Epoch to hand to [`refresh_completed`](Self::refresh_completed).
    /// Read before the remote call so a flush during the call still counts.
    pub fn refresh_started(&self) -> u64 {
        self.connection.flush_epoch()
    }

    pub fn refresh_completed(&self, epoch: u64) {
        let mut state = self.state();
        state.initialized = true;
        state.last_refresh = Some(Utc::now());
        state.epoch = epoch;
    }
}

/// A cache that refreshes itself from the remote service under a
/// [`CacheBase`] freshness policy.
#[async_trait]
pub trait Refreshable: Send + Sync {
    fn base(&self) -> &CacheBase;

    /// Unconditionally refresh from the remote service. Returns whether the
    /// cached data changed.
    async fn perform_update(&self) -> CimCacheResult<bool>;

    fn needs_update(&self, threshold: Duration) -> bool {
        self.base().needs_update(threshold)
    }

    /// Refresh only if [`needs_update`](Self::needs_update).
    async fn update(&self, threshold: Duration) -> CimCacheResult<bool> {
        if !self.needs_update(threshold) {
            return Ok(false);
        }
        self.perform_update().await
    }

    fn invalidate(&self) {
        self.base().invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockRemoteService;
    use cimcache_core::ConnectionId;

    fn base() -> CacheBase {
        let id = ConnectionId::new("host01");
        let service = Arc::new(MockRemoteService::new(id.clone()));
        CacheBase::new(Arc::new(Connection::new(id, service)))
    }

    #[test]
    fn test_stale_until_first_refresh() {
        let base = base();
        assert!(base.needs_update(Duration::from_secs(3600)));
        let epoch = base.refresh_started();
        base.refresh_completed(epoch);
        assert!(!base.needs_update(Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_threshold_is_always_stale() {
        let base = base();
        base.refresh_completed(base.refresh_started());
        assert!(base.needs_update(Duration::ZERO));
    }

    #[test]
    fn test_threshold_elapses() {
        let base = base();
        base.refresh_completed(base.refresh_started());
        let refreshed = base.last_refresh().unwrap();
        let threshold = Duration::from_secs(60);
        assert!(!base.needs_update_at(threshold, refreshed + chrono::Duration::seconds(59)));
        assert!(base.needs_update_at(threshold, refreshed + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_clock_skew_is_stale() {
        let base = base();
        base.refresh_completed(base.refresh_started());
        let refreshed = base.last_refresh().unwrap();
        assert!(base.needs_update_at(
            Duration::from_secs(3600),
            refreshed - chrono::Duration::seconds(5)
        ));
    }

    #[test]
    fn test_flush_epoch_stales_cache() {
        let base = base();
        base.refresh_completed(base.refresh_started());
        assert!(!base.needs_update(Duration::from_secs(3600)));
        base.connection().flush_all_caches();
        assert!(base.needs_update(Duration::from_secs(3600)));
    }

    #[test]
    fn test_flush_during_refresh_stales_cache() {
        let base = base();
        let epoch = base.refresh_started();
        base.connection().flush_all_caches();
        base.refresh_completed(epoch);
        assert!(base.needs_update(Duration::from_secs(3600)));
    }

    #[test]
    fn test_invalidate_keeps_initialized() {
        let base = base();
        base.refresh_completed(base.refresh_started());
        base.invalidate();
        assert!(base.is_initialized());
        assert!(base.needs_update(Duration::from_secs(3600)));
    }
}
