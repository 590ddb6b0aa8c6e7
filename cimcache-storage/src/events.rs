//! Shared instance-event monitors.
//!
//! Subscriptions with equal criteria share one [`InstanceEventMonitor`].
//! A monitor fans every event out to the listeners registered for the
//! event's target object. The transport adapter feeds monitors through
//! [`InstanceEventManager::publish`].

use cimcache_core::{
    CimCacheResult, ConnectionId, EventKey, InstanceEvent, ObjectKey, StorageError,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Callback invoked for every event on the object it was registered for.
pub type EventListener = Arc<dyn Fn(&InstanceEvent) + Send + Sync>;

/// Handle returned by [`InstanceEventMonitor::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerTable = HashMap<ObjectKey, Vec<(ListenerId, EventListener)>>;

/// One underlying event subscription.
pub struct InstanceEventMonitor {
    key: EventKey,
    poll_interval: Duration,
    listeners: Mutex<ListenerTable>,
    next_listener: AtomicU64,
    torn_down: AtomicBool,
}

impl InstanceEventMonitor {
    fn new(key: EventKey, poll_interval: Duration) -> Self {
        Self {
            key,
            poll_interval,
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &EventKey {
        &self.key
    }

    /// Polling interval the transport should request for this subscription.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    fn listeners(&self) -> CimCacheResult<MutexGuard<'_, ListenerTable>> {
        self.listeners
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    pub fn add_listener(&self, target: ObjectKey, listener: EventListener) -> CimCacheResult<ListenerId> {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners()?
            .entry(target)
            .or_default()
            .push((id, listener));
        Ok(id)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> CimCacheResult<bool> {
        let mut listeners = self.listeners()?;
        let mut removed = false;
        listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(listener_id, _)| *listener_id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        Ok(removed)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners()
            .map(|l| l.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Deliver `event` to the listeners of its target.
    ///
    /// Listeners run outside the monitor lock, so they may add or remove
    /// listeners themselves. Returns how many listeners were called.
    pub fn dispatch(&self, event: &InstanceEvent) -> CimCacheResult<usize> {
        if self.is_torn_down() {
            return Ok(0);
        }
        let targets: Vec<EventListener> = match self.listeners()?.get(&event.target) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return Ok(0),
        };
        for listener in &targets {
            listener(event);
        }
        Ok(targets.len())
    }

    fn tear_down(&self) {
        self.torn_down.store(true, Ordering::Release);
        if let Ok(mut listeners) = self.listeners() {
            listeners.clear();
        }
        tracing::debug!(monitor = %self.key, "Tore down event monitor");
    }
}

impl std::fmt::Debug for InstanceEventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEventMonitor")
            .field("key", &self.key)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

/// Deduplicating registry of event monitors.
#[derive(Debug)]
pub struct InstanceEventManager {
    monitors: DashMap<EventKey, Arc<InstanceEventMonitor>>,
    poll_interval: Duration,
}

impl InstanceEventManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            monitors: DashMap::new(),
            poll_interval,
        }
    }

    /// The monitor for `key`, created on first use.
    ///
    /// A monitor that was torn down is replaced by a fresh one.
    pub fn get_or_create_monitor(&self, key: EventKey) -> Arc<InstanceEventMonitor> {
        let mut slot = self
            .monitors
            .entry(key.clone())
            .or_insert_with(|| self.create(key.clone()));
        if slot.is_torn_down() {
            *slot = self.create(key);
        }
        slot.value().clone()
    }

    fn create(&self, key: EventKey) -> Arc<InstanceEventMonitor> {
        tracing::debug!(monitor = %key, "Created event monitor");
        Arc::new(InstanceEventMonitor::new(key, self.poll_interval))
    }

    pub fn monitor(&self, key: &EventKey) -> Option<Arc<InstanceEventMonitor>> {
        self.monitors.get(key).map(|m| m.value().clone())
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Route an event arriving on the subscription for `key`.
    pub fn publish(&self, key: &EventKey, event: &InstanceEvent) -> CimCacheResult<usize> {
        // Clone out of the map so listeners never run under a shard lock.
        match self.monitor(key) {
            Some(monitor) => monitor.dispatch(event),
            None => Ok(0),
        }
    }

    /// Remove and tear down the monitors of one connection, or all of them.
    pub fn teardown_all(&self, connection: Option<&ConnectionId>) -> usize {
        let mut removed = Vec::new();
        self.monitors.retain(|key, monitor| {
            let matches = connection.map_or(true, |c| key.connection() == c);
            if matches {
                removed.push(monitor.clone());
            }
            !matches
        });
        for monitor in &removed {
            monitor.tear_down();
        }
        removed.len()
    }
}
