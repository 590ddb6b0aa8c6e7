//! The caller-facing entry point.
//!
//! [`ObjectCache`] owns the connections, the proxy repository, the event
//! manager and the task connection testers, and exposes the operations
//! generated views use: proxy lookup, cache invalidation and refresh, and
//! task registration.

use crate::connection::Connection;
use crate::events::InstanceEventManager;
use crate::liveness::{RemoteTask, TaskConnectionTesters};
use crate::proxy::Proxy;
use crate::remote::RemoteService;
use crate::repository::ProxyRepository;
use cimcache_core::{
    Association, CacheConfig, CimCacheResult, ConnectionId, ObjectKey, RemoteError, RemoteInstance,
    StorageError, TaskId,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub struct ObjectCache {
    config: CacheConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    repository: Arc<ProxyRepository>,
    events: InstanceEventManager,
    testers: TaskConnectionTesters,
}

impl ObjectCache {
    /// Create a cache without background sweeping.
    pub fn new(config: CacheConfig) -> CimCacheResult<Self> {
        config.validate()?;
        Ok(Self {
            repository: Arc::new(ProxyRepository::new(&config)),
            events: InstanceEventManager::new(config.event_poll_interval),
            testers: TaskConnectionTesters::new(&config),
            connections: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Create a cache and start the repository sweep on the current tokio
    /// runtime.
    pub fn start(config: CacheConfig) -> CimCacheResult<Self> {
        let cache = Self::new(config)?;
        cache.repository.start_sweeper()?;
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<ProxyRepository> {
        &self.repository
    }

    pub fn events(&self) -> &InstanceEventManager {
        &self.events
    }

    pub fn testers(&self) -> &TaskConnectionTesters {
        &self.testers
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Register a connection. An existing connection with the same id is
    /// returned unchanged.
    pub fn add_connection(
        &self,
        id: ConnectionId,
        service: Arc<dyn RemoteService>,
    ) -> CimCacheResult<Arc<Connection>> {
        let mut connections = self
            .connections
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let connection = connections
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Connection::new(id, service)))
            .clone();
        tracing::info!(connection = %connection.id(), "Connection added");
        Ok(connection)
    }

    pub fn connection(&self, id: &ConnectionId) -> CimCacheResult<Arc<Connection>> {
        self.connections
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| {
                RemoteError::UnknownConnection {
                    connection: id.clone(),
                }
                .into()
            })
    }

    /// Remove a connection and everything cached for it.
    ///
    /// Tears down its event monitors, unregisters its proxies and fails its
    /// outstanding tasks.
    pub fn remove_connection(&self, id: &ConnectionId) -> CimCacheResult<bool> {
        let removed = self
            .connections
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(id);
        let Some(connection) = removed else {
            return Ok(false);
        };

        connection.flush_all_caches();
        let monitors = self.events.teardown_all(Some(id));
        let mut proxies = 0;
        for proxy in self.repository.get_all_for_connection(id)? {
            if self.repository.unregister(proxy.key())? {
                proxies += 1;
            }
        }
        let failed = self.testers.remove_connection(id)?;

        tracing::info!(
            connection = %id,
            monitors,
            proxies,
            failed_tasks = failed,
            "Connection removed"
        );
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------------

    /// The canonical proxy for `key`, created if absent. Nothing is fetched
    /// until a property or association is read.
    pub fn get_or_create_proxy(&self, key: &ObjectKey) -> CimCacheResult<Arc<Proxy>> {
        if let Some(proxy) = self.repository.try_get(key)? {
            return Ok(proxy);
        }
        let connection = self.connection(key.connection())?;
        let proxy = Arc::new(Proxy::new(key.clone(), connection)?);
        let (canonical, _) = self.repository.register(proxy)?;
        Ok(canonical)
    }

    /// The canonical proxy for an already fetched instance.
    ///
    /// A newly created proxy is primed with the instance; an existing one
    /// has the instance applied to its property cache.
    pub fn get_or_create_proxy_from_instance(
        &self,
        connection: &ConnectionId,
        namespace: &str,
        instance: &RemoteInstance,
    ) -> CimCacheResult<Arc<Proxy>> {
        let connection = self.connection(connection)?;
        let key = instance.to_object_key(connection.id(), namespace)?;

        if let Some(existing) = self.repository.try_get(&key)? {
            existing.apply_remote_instance(instance)?;
            return Ok(existing);
        }

        let proxy = Arc::new(Proxy::with_instance(key, connection, instance)?);
        let (canonical, inserted) = self.repository.register(proxy)?;
        if !inserted {
            canonical.apply_remote_instance(instance)?;
        }
        Ok(canonical)
    }

    /// Fetch `key` now and return its proxy, primed with the result.
    ///
    /// When the service resolves the key to an instance of a different
    /// class (a subclass, typically) the proxy is keyed by the returned
    /// instance instead.
    pub async fn fetch_proxy(&self, key: &ObjectKey) -> CimCacheResult<Arc<Proxy>> {
        let connection = self.connection(key.connection())?;
        let instance = connection.service().fetch_instance(key).await?;

        if !key.is_class_named(instance.class_name()) {
            tracing::warn!(
                requested = %key,
                class = %instance.class_name(),
                "Fetched instance has a different class, rekeying proxy"
            );
        } else if let Some(existing) = self.repository.try_get(key)? {
            existing.apply_remote_instance(&instance)?;
            return Ok(existing);
        }

        self.get_or_create_proxy_from_instance(key.connection(), key.namespace(), &instance)
    }

    pub fn try_get_proxy(&self, key: &ObjectKey) -> CimCacheResult<Option<Arc<Proxy>>> {
        self.repository.try_get(key)
    }

    /// Proxies of the objects related to `proxy` through `association`.
    pub async fn related_proxies(
        &self,
        proxy: &Proxy,
        association: &Association,
        threshold: Duration,
    ) -> CimCacheResult<Vec<Arc<Proxy>>> {
        let keys = proxy.related_keys(association, threshold).await?;
        keys.iter().map(|key| self.get_or_create_proxy(key)).collect()
    }

    pub fn invalidate_property_cache(&self, proxy: &Proxy) {
        proxy.invalidate_properties();
    }

    pub async fn update_property_cache(&self, proxy: &Proxy, threshold: Duration) -> CimCacheResult<bool> {
        proxy.update_properties(threshold).await
    }

    pub fn invalidate_association_cache(&self, proxy: &Proxy) -> CimCacheResult<usize> {
        proxy.invalidate_associations()
    }

    pub async fn update_association_cache(
        &self,
        proxy: &Proxy,
        threshold: Duration,
        exclude: &[Association],
    ) -> CimCacheResult<usize> {
        proxy.update_associations(threshold, exclude).await
    }

    /// Subscribe `proxy` to modification events.
    pub fn watch_modifications(&self, proxy: &Arc<Proxy>) -> CimCacheResult<()> {
        proxy.watch_modifications(&self.events)
    }

    /// Subscribe `proxy` to deletion events.
    pub fn watch_deletion(&self, proxy: &Arc<Proxy>) -> CimCacheResult<()> {
        proxy.watch_deletion(&self.events, &self.repository)
    }

    /// Set the extra filter conditions of `proxy`'s event subscriptions.
    pub fn set_event_conditions(&self, proxy: &Proxy, conditions: Vec<String>) -> CimCacheResult<bool> {
        proxy.set_event_conditions(conditions, &self.events)
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    /// Track an outstanding task so it fails promptly if `connection` dies.
    pub fn register_task(&self, connection: &ConnectionId, task: Arc<dyn RemoteTask>) -> CimCacheResult<()> {
        let connection = self.connection(connection)?;
        self.testers
            .register_task(connection.id(), connection.probe(), task)
    }

    pub fn unregister_task(&self, connection: &ConnectionId, task: TaskId) -> CimCacheResult<bool> {
        self.testers.unregister_task(connection, task)
    }

    /// Stop background work and fail outstanding tasks.
    pub fn shutdown(&self) -> CimCacheResult<()> {
        self.repository.shutdown();
        let failed = self.testers.teardown_all()?;
        let monitors = self.events.teardown_all(None);
        tracing::info!(failed_tasks = failed, monitors, "Object cache shut down");
        Ok(())
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("repository", &self.repository)
            .field("events", &self.events)
            .field("testers", &self.testers)
            .finish()
    }
}
