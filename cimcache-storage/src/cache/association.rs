//! Association caches and their per-object registry.

use super::base::{CacheBase, Refreshable};
use crate::connection::Connection;
use async_trait::async_trait;
use cimcache_core::{
    Association, AssociationKind, CimCacheResult, ObjectKey, StorageError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Related objects of one source object through one association.
pub struct AssociationCache {
    source: ObjectKey,
    association: Association,
    base: CacheBase,
    related: Mutex<Vec<ObjectKey>>,
}

impl AssociationCache {
    pub fn new(source: ObjectKey, association: Association, connection: Arc<Connection>) -> Self {
        Self {
            source,
            association,
            base: CacheBase::new(connection),
            related: Mutex::new(Vec::new()),
        }
    }

    pub fn source(&self) -> &ObjectKey {
        &self.source
    }

    pub fn association(&self) -> &Association {
        &self.association
    }

    fn related_guard(&self) -> CimCacheResult<MutexGuard<'_, Vec<ObjectKey>>> {
        self.related
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Keys of the related objects as of the last refresh.
    pub fn related(&self) -> CimCacheResult<Vec<ObjectKey>> {
        Ok(self.related_guard()?.clone())
    }

    /// Namespace the related objects live in.
    fn target_namespace(&self) -> &str {
        match self.association.kind() {
            AssociationKind::Query { namespace, .. } => namespace,
            AssociationKind::Relationship { .. } => self.source.namespace(),
        }
    }
}

#[async_trait]
impl Refreshable for AssociationCache {
    fn base(&self) -> &CacheBase {
        &self.base
    }

    async fn perform_update(&self) -> CimCacheResult<bool> {
        let epoch = self.base.refresh_started();
        let connection = self.base.connection().clone();
        let instances = connection
            .service()
            .enumerate_related(&self.source, &self.association)
            .await?;

        let namespace = self.target_namespace();
        let mut keys = Vec::with_capacity(instances.len());
        for instance in &instances {
            match instance.to_object_key(connection.id(), namespace) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::warn!(
                        source = %self.source,
                        association = %self.association,
                        class = %instance.class_name(),
                        error = %e,
                        "Skipping related instance that cannot be mapped"
                    );
                }
            }
        }

        let changed = {
            let mut related = self.related_guard()?;
            let changed = related.len() != keys.len() || {
                let previous: HashSet<&ObjectKey> = related.iter().collect();
                keys.iter().any(|key| !previous.contains(key))
            };
            *related = keys;
            changed
        };
        self.base.refresh_completed(epoch);

        tracing::debug!(
            source = %self.source,
            association = %self.association,
            changed,
            "Refreshed association cache"
        );
        Ok(changed)
    }
}

impl std::fmt::Debug for AssociationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationCache")
            .field("source", &self.source)
            .field("association", &self.association)
            .finish()
    }
}

/// Registry of the association caches of one proxy.
///
/// At most one cache exists per distinct association value. The registry
/// lock only covers structural changes; refreshes run against a snapshot
/// taken under the lock.
#[derive(Debug, Default)]
pub struct AssociationCacheManager {
    caches: Mutex<HashMap<Association, Arc<AssociationCache>>>,
}

impl AssociationCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn caches(&self) -> CimCacheResult<MutexGuard<'_, HashMap<Association, Arc<AssociationCache>>>> {
        self.caches
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    pub fn get_cache(&self, association: &Association) -> CimCacheResult<Option<Arc<AssociationCache>>> {
        Ok(self.caches()?.get(association).cloned())
    }

    /// Related keys for `association`, or `None` if no cache exists yet.
    pub fn try_get_related(&self, association: &Association) -> CimCacheResult<Option<Vec<ObjectKey>>> {
        match self.get_cache(association)? {
            Some(cache) => Ok(Some(cache.related()?)),
            None => Ok(None),
        }
    }

    /// Register `cache` for `association`.
    ///
    /// If an equal association is already registered, the existing cache is
    /// kept and returned and `cache` is dropped.
    pub fn add_cache(
        &self,
        association: Association,
        cache: Arc<AssociationCache>,
    ) -> CimCacheResult<Arc<AssociationCache>> {
        let mut caches = self.caches()?;
        Ok(caches.entry(association).or_insert(cache).clone())
    }

    pub fn len(&self) -> usize {
        self.caches().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> CimCacheResult<Vec<Arc<AssociationCache>>> {
        Ok(self.caches()?.values().cloned().collect())
    }

    /// Stale every cache except those marked `do_not_update`.
    pub fn invalidate_all(&self) -> CimCacheResult<usize> {
        let mut invalidated = 0;
        for cache in self.snapshot()? {
            if cache.association().do_not_update() {
                continue;
            }
            cache.invalidate();
            invalidated += 1;
        }
        Ok(invalidated)
    }

    /// Refresh every cache that needs it, skipping `exclude` and every
    /// `do_not_update` association. Returns how many caches changed.
    ///
    /// A failing cache is logged and does not stop the others from
    /// refreshing. If any cache failed, the first error is returned once
    /// every cache has been tried.
    pub async fn update_all(&self, threshold: Duration, exclude: &[Association]) -> CimCacheResult<usize> {
        let mut changed = 0;
        let mut first_error = None;
        for cache in self.snapshot()? {
            let association = cache.association();
            if association.do_not_update() || exclude.contains(association) {
                continue;
            }
            match cache.update(threshold).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        source = %cache.source(),
                        association = %association,
                        error = %e,
                        "Failed to refresh association cache"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    /// Refresh one association's cache if it needs it.
    ///
    /// Associations marked `do_not_update` are never refreshed here.
    pub async fn update_one(&self, association: &Association, threshold: Duration) -> CimCacheResult<bool> {
        if association.do_not_update() {
            return Ok(false);
        }
        match self.get_cache(association)? {
            Some(cache) if !cache.association().do_not_update() => cache.update(threshold).await,
            _ => Ok(false),
        }
    }
}
