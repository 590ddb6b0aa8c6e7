//! Proxies: the cached representative of one remote object.

use crate::cache::{AssociationCache, AssociationCacheManager, PropertyCache, Refreshable};
use crate::connection::Connection;
use crate::events::{EventListener, InstanceEventManager, InstanceEventMonitor, ListenerId};
use crate::repository::ProxyRepository;
use cimcache_core::{
    Association, CimCacheResult, EventKey, InstanceEvent, InstanceEventType, ObjectKey,
    PropertyValue, RemoteError, RemoteInstance, StorageError, UsageError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of each proxy's notification channel.
const NOTIFICATION_CAPACITY: usize = 64;

/// Notification published by a proxy to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// At least one cached property value changed.
    PropertyCacheUpdated { key: ObjectKey },
    /// The remote object was deleted.
    Deleted { key: ObjectKey },
}

struct Registration {
    monitor: Arc<InstanceEventMonitor>,
    id: ListenerId,
    listener: EventListener,
}

impl Registration {
    fn is_live(&self) -> bool {
        !self.monitor.is_torn_down()
    }
}

#[derive(Default)]
struct EventWatch {
    count: usize,
    registration: Option<Registration>,
}

/// Cached representative of one remote object.
///
/// Owns the object's property cache and association caches. The repository
/// entry is the logical owner; views hold clones of the `Arc`.
pub struct Proxy {
    key: ObjectKey,
    connection: Arc<Connection>,
    properties: PropertyCache,
    associations: AssociationCacheManager,
    notifications: broadcast::Sender<ProxyEvent>,
    deleted: AtomicBool,
    event_conditions: Mutex<Vec<String>>,
    modification_watch: Mutex<EventWatch>,
    deletion_watch: Mutex<EventWatch>,
}

impl Proxy {
    /// A proxy whose caches load lazily on first use.
    pub fn new(key: ObjectKey, connection: Arc<Connection>) -> CimCacheResult<Self> {
        if key.connection() != connection.id() {
            return Err(UsageError::InvalidArgument {
                name: "connection".to_string(),
                reason: format!("key {} does not belong to connection {}", key, connection.id()),
            }
            .into());
        }
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            properties: PropertyCache::new(key.clone(), connection.clone()),
            associations: AssociationCacheManager::new(),
            key,
            connection,
            notifications,
            deleted: AtomicBool::new(false),
            event_conditions: Mutex::new(Vec::new()),
            modification_watch: Mutex::new(EventWatch::default()),
            deletion_watch: Mutex::new(EventWatch::default()),
        })
    }

    /// A proxy primed with an already fetched instance.
    pub fn with_instance(
        key: ObjectKey,
        connection: Arc<Connection>,
        instance: &RemoteInstance,
    ) -> CimCacheResult<Self> {
        let proxy = Self::new(key, connection)?;
        proxy.properties.apply_instance(instance)?;
        Ok(proxy)
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn properties(&self) -> &PropertyCache {
        &self.properties
    }

    pub fn associations(&self) -> &AssociationCacheManager {
        &self.associations
    }

    /// Class of the remote object: the fetched class when known, else the
    /// class named by the key.
    pub fn class_name(&self) -> String {
        self.properties
            .class_name()
            .unwrap_or_else(|| self.key.class_name().to_string())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.notifications.subscribe()
    }

    fn notify(&self, event: ProxyEvent) {
        // No receivers is fine.
        let _ = self.notifications.send(event);
    }

    fn notify_updated(&self) {
        self.notify(ProxyEvent::PropertyCacheUpdated {
            key: self.key.clone(),
        });
    }

    /// Mark the remote object deleted. Returns `false` if it already was.
    pub fn mark_deleted(&self) -> bool {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(key = %self.key, "Proxy marked deleted");
        self.notify(ProxyEvent::Deleted {
            key: self.key.clone(),
        });
        true
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    /// Read one property, loading the cache on first use.
    ///
    /// A name the object does not have is a class definition mismatch.
    pub async fn get_property(&self, name: &str) -> CimCacheResult<PropertyValue> {
        match self.properties.try_get(name).await? {
            Some(value) => Ok(value),
            None => Err(RemoteError::ClassDefinitionMismatch {
                class_name: self.class_name(),
                member: name.to_string(),
            }
            .into()),
        }
    }

    pub fn invalidate_properties(&self) {
        self.properties.invalidate();
    }

    /// Refresh the property cache if it is older than `threshold`.
    pub async fn update_properties(&self, threshold: Duration) -> CimCacheResult<bool> {
        let changed = self.properties.update(threshold).await?;
        if changed {
            self.notify_updated();
        }
        Ok(changed)
    }

    /// Apply a post-change instance delivered by an event.
    pub fn apply_remote_instance(&self, instance: &RemoteInstance) -> CimCacheResult<bool> {
        let changed = self.properties.apply_instance(instance)?;
        if changed {
            self.notify_updated();
        }
        Ok(changed)
    }

    /// Write property values to the remote object, then cache them.
    pub async fn put_properties(&self, values: Vec<(String, PropertyValue)>) -> CimCacheResult<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.connection
            .service()
            .modify_instance(&self.key, &values)
            .await?;
        let changed = self.properties.apply_values(&values)?;
        if changed {
            self.notify_updated();
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------------
    // Associations
    // ------------------------------------------------------------------------

    /// Keys of the objects related through `association`.
    ///
    /// The first request for an association creates and fills its cache.
    /// Later requests refresh it when older than `threshold`, except for
    /// `do_not_update` associations, which keep their first result.
    pub async fn related_keys(
        &self,
        association: &Association,
        threshold: Duration,
    ) -> CimCacheResult<Vec<ObjectKey>> {
        if let Some(cache) = self.associations.get_cache(association)? {
            if !cache.association().do_not_update() || !cache.base().is_initialized() {
                cache.update(threshold).await?;
            }
            return cache.related();
        }

        let cache = Arc::new(AssociationCache::new(
            self.key.clone(),
            association.clone(),
            self.connection.clone(),
        ));
        cache.update(Duration::ZERO).await?;
        let canonical = self.associations.add_cache(association.clone(), cache)?;
        canonical.related()
    }

    pub fn invalidate_associations(&self) -> CimCacheResult<usize> {
        self.associations.invalidate_all()
    }

    pub async fn update_associations(
        &self,
        threshold: Duration,
        exclude: &[Association],
    ) -> CimCacheResult<usize> {
        self.associations.update_all(threshold, exclude).await
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Extra filter conditions applied to this proxy's event subscriptions.
    pub fn event_conditions(&self) -> Vec<String> {
        match self.event_conditions.lock() {
            Ok(conditions) => conditions.clone(),
            Err(poisoned) => {
                tracing::warn!(key = %self.key, "Event conditions lock poisoned, recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Replace the extra filter conditions of this proxy's event
    /// subscriptions. Returns whether they changed.
    ///
    /// Live subscriptions move to the monitor matching the new conditions;
    /// their reference counts carry over.
    pub fn set_event_conditions(
        &self,
        conditions: Vec<String>,
        events: &InstanceEventManager,
    ) -> CimCacheResult<bool> {
        let mut current = self
            .event_conditions
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        if *current == conditions {
            return Ok(false);
        }
        for (slot, event_type) in [
            (&self.modification_watch, InstanceEventType::Modified),
            (&self.deletion_watch, InstanceEventType::Deleted),
        ] {
            let mut watch = slot.lock().map_err(|_| StorageError::LockPoisoned)?;
            let Some(registration) = watch.registration.take() else {
                continue;
            };
            registration.monitor.remove_listener(registration.id)?;
            if !registration.is_live() {
                continue;
            }
            let key = EventKey::for_object(&self.key, event_type, &conditions);
            watch.registration = Some(self.register(events, key, registration.listener)?);
        }
        *current = conditions;
        tracing::debug!(key = %self.key, conditions = ?current.as_slice(), "Changed event conditions");
        Ok(true)
    }

    fn register(
        &self,
        events: &InstanceEventManager,
        key: EventKey,
        listener: EventListener,
    ) -> CimCacheResult<Registration> {
        let monitor = events.get_or_create_monitor(key);
        let id = monitor.add_listener(self.key.clone(), listener.clone())?;
        tracing::debug!(key = %self.key, monitor = %monitor.key(), "Subscribed to instance events");
        Ok(Registration {
            monitor,
            id,
            listener,
        })
    }

    fn watch(
        &self,
        slot: &Mutex<EventWatch>,
        events: &InstanceEventManager,
        event_type: InstanceEventType,
        listener: impl FnOnce() -> EventListener,
    ) -> CimCacheResult<()> {
        // Conditions before the slot, same as set_event_conditions.
        let conditions = self
            .event_conditions
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut watch = slot.lock().map_err(|_| StorageError::LockPoisoned)?;
        if !watch.registration.as_ref().is_some_and(Registration::is_live) {
            let key = EventKey::for_object(&self.key, event_type, &conditions);
            watch.registration = Some(self.register(events, key, listener())?);
        }
        watch.count += 1;
        Ok(())
    }

    fn unwatch(&self, slot: &Mutex<EventWatch>) -> CimCacheResult<()> {
        let mut watch = slot.lock().map_err(|_| StorageError::LockPoisoned)?;
        if watch.count == 0 {
            return Ok(());
        }
        watch.count -= 1;
        if watch.count == 0 {
            if let Some(registration) = watch.registration.take() {
                registration.monitor.remove_listener(registration.id)?;
                tracing::debug!(key = %self.key, monitor = %registration.monitor.key(), "Unsubscribed from instance events");
            }
        }
        Ok(())
    }

    /// Keep the property cache current from modification events.
    ///
    /// Reference-counted: only the first call subscribes, and only the
    /// matching last [`unwatch_modifications`](Self::unwatch_modifications)
    /// unsubscribes.
    pub fn watch_modifications(self: &Arc<Self>, events: &InstanceEventManager) -> CimCacheResult<()> {
        let proxy = Arc::downgrade(self);
        self.watch(&self.modification_watch, events, InstanceEventType::Modified, || {
            Arc::new(move |event: &InstanceEvent| {
                let Some(proxy) = proxy.upgrade() else {
                    return;
                };
                let result = match &event.instance {
                    Some(instance) => proxy.apply_remote_instance(instance).map(|_| ()),
                    None => {
                        proxy.invalidate_properties();
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(key = %proxy.key, error = %e, "Failed to apply modification event");
                }
            })
        })
    }

    pub fn unwatch_modifications(&self) -> CimCacheResult<()> {
        self.unwatch(&self.modification_watch)
    }

    /// Track deletion of the remote object.
    ///
    /// On a deletion event the proxy is marked deleted, removed from
    /// `repository` and observers receive [`ProxyEvent::Deleted`].
    pub fn watch_deletion(
        self: &Arc<Self>,
        events: &InstanceEventManager,
        repository: &Arc<ProxyRepository>,
    ) -> CimCacheResult<()> {
        let proxy = Arc::downgrade(self);
        let repository = Arc::downgrade(repository);
        self.watch(&self.deletion_watch, events, InstanceEventType::Deleted, || {
            Arc::new(move |_event: &InstanceEvent| {
                let Some(proxy) = proxy.upgrade() else {
                    return;
                };
                if !proxy.mark_deleted() {
                    return;
                }
                if let Some(repository) = repository.upgrade() {
                    if let Err(e) = repository.unregister(proxy.key()) {
                        tracing::warn!(key = %proxy.key, error = %e, "Failed to unregister deleted proxy");
                    }
                }
            })
        })
    }

    pub fn unwatch_deletion(&self) -> CimCacheResult<()> {
        self.unwatch(&self.deletion_watch)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("key", &self.key)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockRemoteService;
    use cimcache_core::{CimCacheError, ConnectionId};

    struct Fixture {
        mock: Arc<MockRemoteService>,
        connection: Arc<Connection>,
        key: ObjectKey,
    }

    fn fixture() -> Fixture {
        let id = ConnectionId::new("host01");
        let mock = Arc::new(MockRemoteService::new(id.clone()));
        let key = ObjectKey::builder(id.clone(), "root\\virtualization\\v2", "Msvm_ComputerSystem")
            .key_property("Name", "vm-1")
            .build()
            .unwrap();
        mock.insert_instance(
            &key,
            RemoteInstance::new("Msvm_ComputerSystem")
                .with_key("Name", "vm-1")
                .with_property("ElementName", "web"),
        );
        let connection = Arc::new(Connection::new(id, mock.clone()));
        Fixture {
            mock,
            connection,
            key,
        }
    }

    fn event(key: &ObjectKey, event_type: InstanceEventType, instance: Option<RemoteInstance>) -> InstanceEvent {
        InstanceEvent {
            event_type,
            target: key.clone(),
            instance,
        }
    }

    #[test]
    fn test_foreign_connection_is_rejected() {
        let f = fixture();
        let other = Arc::new(Connection::new(ConnectionId::new("host02"), f.mock.clone()));
        let err = Proxy::new(f.key.clone(), other).unwrap_err();
        assert!(err.is_usage());
    }

    #[tokio::test]
    async fn test_unknown_property_is_class_mismatch() {
        let f = fixture();
        let proxy = Proxy::new(f.key.clone(), f.connection.clone()).unwrap();
        assert_eq!(proxy.get_property("ElementName").await.unwrap(), PropertyValue::from("web"));
        let err = proxy.get_property("Bogus").await.unwrap_err();
        assert!(matches!(
            err,
            CimCacheError::Remote(RemoteError::ClassDefinitionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_put_properties_writes_through() {
        let f = fixture();
        let proxy = Proxy::new(f.key.clone(), f.connection.clone()).unwrap();
        let mut rx = proxy.subscribe();
        let changed = proxy
            .put_properties(vec![("ElementName".to_string(), PropertyValue::from("db"))])
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(f.mock.modify_calls(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            ProxyEvent::PropertyCacheUpdated { key: f.key.clone() }
        );
        assert_eq!(
            proxy.properties().peek("elementname").unwrap(),
            Some(PropertyValue::from("db"))
        );
    }

    #[tokio::test]
    async fn test_related_keys_populates_once() {
        let f = fixture();
        let proxy = Proxy::new(f.key.clone(), f.connection.clone()).unwrap();
        let association = Association::relationship("Msvm_SystemDevice");
        f.mock.set_related(
            &f.key,
            &association,
            vec![RemoteInstance::new("Msvm_Processor").with_key("DeviceID", "cpu0")],
        );

        let first = proxy
            .related_keys(&association, Duration::from_secs(60))
            .await
            .unwrap();
        let second = proxy
            .related_keys(&Association::relationship("msvm_systemdevice"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(f.mock.related_calls(), 1);
        assert_eq!(proxy.associations().len(), 1);
    }

    #[test]
    fn test_modification_events_are_ref_counted() {
        let f = fixture();
        let events = InstanceEventManager::new(Duration::from_secs(2));
        let proxy = Arc::new(Proxy::new(f.key.clone(), f.connection.clone()).unwrap());

        proxy.watch_modifications(&events).unwrap();
        proxy.watch_modifications(&events).unwrap();
        let monitor = events
            .monitor(&EventKey::for_object(&f.key, InstanceEventType::Modified, &[]))
            .unwrap();
        assert_eq!(monitor.listener_count(), 1);

        let updated = RemoteInstance::new("Msvm_ComputerSystem")
            .with_key("Name", "vm-1")
            .with_property("ElementName", "renamed");
        monitor
            .dispatch(&event(&f.key, InstanceEventType::Modified, Some(updated)))
            .unwrap();
        assert_eq!(
            proxy.properties().peek("ElementName").unwrap(),
            Some(PropertyValue::from("renamed"))
        );

        proxy.unwatch_modifications().unwrap();
        assert_eq!(monitor.listener_count(), 1);
        proxy.unwatch_modifications().unwrap();
        assert_eq!(monitor.listener_count(), 0);
    }

    #[test]
    fn test_different_conditions_use_different_monitors() {
        let f = fixture();
        let events = InstanceEventManager::new(Duration::from_secs(2));
        let other_key = ObjectKey::builder(f.key.connection().clone(), f.key.namespace(), f.key.class_name())
            .key_property("Name", "vm-2")
            .build()
            .unwrap();
        let first = Arc::new(Proxy::new(f.key.clone(), f.connection.clone()).unwrap());
        let second = Arc::new(Proxy::new(other_key.clone(), f.connection.clone()).unwrap());

        let enabled = vec!["TargetInstance.EnabledState = 2".to_string()];
        assert!(first.set_event_conditions(enabled.clone(), &events).unwrap());
        assert!(!first.set_event_conditions(enabled.clone(), &events).unwrap());
        assert_eq!(first.event_conditions(), enabled);
        first.watch_modifications(&events).unwrap();
        second.watch_modifications(&events).unwrap();

        assert_eq!(events.monitor_count(), 2);
        let filtered = events
            .monitor(&EventKey::for_object(&f.key, InstanceEventType::Modified, &enabled))
            .unwrap();
        let plain = events
            .monitor(&EventKey::for_object(&other_key, InstanceEventType::Modified, &[]))
            .unwrap();
        assert!(!Arc::ptr_eq(&filtered, &plain));
        assert_eq!(filtered.listener_count(), 1);
        assert_eq!(plain.listener_count(), 1);
    }

    #[test]
    fn test_changing_conditions_moves_live_watch() {
        let f = fixture();
        let events = InstanceEventManager::new(Duration::from_secs(2));
        let proxy = Arc::new(Proxy::new(f.key.clone(), f.connection.clone()).unwrap());
        proxy.watch_modifications(&events).unwrap();
        proxy.watch_modifications(&events).unwrap();
        let plain = events
            .monitor(&EventKey::for_object(&f.key, InstanceEventType::Modified, &[]))
            .unwrap();

        let conditions = vec!["TargetInstance.HealthState <> 5".to_string()];
        assert!(proxy.set_event_conditions(conditions.clone(), &events).unwrap());
        let filtered = events
            .monitor(&EventKey::for_object(&f.key, InstanceEventType::Modified, &conditions))
            .unwrap();
        assert_eq!(plain.listener_count(), 0);
        assert_eq!(filtered.listener_count(), 1);

        // The moved listener still updates the cache.
        let updated = RemoteInstance::new("Msvm_ComputerSystem")
            .with_key("Name", "vm-1")
            .with_property("ElementName", "filtered");
        filtered
            .dispatch(&event(&f.key, InstanceEventType::Modified, Some(updated)))
            .unwrap();
        assert_eq!(
            proxy.properties().peek("ElementName").unwrap(),
            Some(PropertyValue::from("filtered"))
        );

        // Both earlier watches still need their unwatch.
        proxy.unwatch_modifications().unwrap();
        assert_eq!(filtered.listener_count(), 1);
        proxy.unwatch_modifications().unwrap();
        assert_eq!(filtered.listener_count(), 0);
    }

    #[test]
    fn test_deletion_event_unregisters() {
        let f = fixture();
        let events = InstanceEventManager::new(Duration::from_secs(2));
        let repository = Arc::new(ProxyRepository::new(&cimcache_core::CacheConfig::default()));
        let proxy = Arc::new(Proxy::new(f.key.clone(), f.connection.clone()).unwrap());
        repository.register(proxy.clone()).unwrap();
        let mut rx = proxy.subscribe();

        proxy.watch_deletion(&events, &repository).unwrap();
        events
            .publish(
                &EventKey::for_object(&f.key, InstanceEventType::Deleted, &[]),
                &event(&f.key, InstanceEventType::Deleted, None),
            )
            .unwrap();

        assert!(proxy.is_deleted());
        assert!(repository.try_get(&f.key).unwrap().is_none());
        assert_eq!(rx.try_recv().unwrap(), ProxyEvent::Deleted { key: f.key.clone() });
    }
}
