//! Identity map from object keys to proxies.
//!
//! Each key maps to at most one live [`Proxy`]. Entries start strong. A
//! periodic sweep demotes strong entries that have not been accessed within
//! the inactivity threshold to weak references, and purges weak entries
//! whose proxy has been dropped by every view. Accessing a weak entry whose
//! proxy is still alive promotes it back to strong.
//!
//! One lock guards the map and every entry transition.

use crate::proxy::Proxy;
use cimcache_core::{
    CacheConfig, CimCacheResult, ConnectionId, ObjectKey, StorageError, UsageError, UsageResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

// ============================================================================
// ENTRIES
// ============================================================================

enum EntryRef {
    Strong(Arc<Proxy>),
    Weak(Weak<Proxy>),
}

struct ProxyEntry {
    reference: EntryRef,
    last_access: Instant,
}

impl ProxyEntry {
    fn strong(proxy: Arc<Proxy>) -> Self {
        Self {
            reference: EntryRef::Strong(proxy),
            last_access: Instant::now(),
        }
    }

    fn is_strong(&self) -> bool {
        matches!(self.reference, EntryRef::Strong(_))
    }

    /// Only a weak entry can be collected.
    fn is_collected(&self) -> bool {
        match &self.reference {
            EntryRef::Strong(_) => false,
            EntryRef::Weak(weak) => weak.strong_count() == 0,
        }
    }

    fn peek(&self) -> Option<Arc<Proxy>> {
        match &self.reference {
            EntryRef::Strong(proxy) => Some(proxy.clone()),
            EntryRef::Weak(weak) => weak.upgrade(),
        }
    }

    /// Resolve the proxy, touching the entry and promoting a live weak
    /// reference back to strong.
    fn access(&mut self) -> Option<Arc<Proxy>> {
        self.last_access = Instant::now();
        let proxy = self.peek()?;
        if !self.is_strong() {
            self.reference = EntryRef::Strong(proxy.clone());
        }
        Some(proxy)
    }

    fn demote(&mut self, key: &ObjectKey) -> UsageResult<()> {
        let proxy = match &self.reference {
            EntryRef::Strong(proxy) => proxy,
            EntryRef::Weak(_) => return Err(UsageError::AlreadyWeak { key: key.clone() }),
        };
        self.reference = EntryRef::Weak(Arc::downgrade(proxy));
        Ok(())
    }

    fn resurrect(&mut self, key: &ObjectKey, proxy: Arc<Proxy>) -> UsageResult<()> {
        if !self.is_collected() {
            return Err(UsageError::NotCollected { key: key.clone() });
        }
        self.reference = EntryRef::Strong(proxy);
        self.last_access = Instant::now();
        Ok(())
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Snapshot of repository state for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    /// Entries currently in the map.
    pub entries: usize,
    /// Entries holding a strong reference.
    pub strong: usize,
    /// Entries holding a weak reference, collected or not.
    pub weak: usize,
    /// Strong entries demoted by sweeps since creation.
    pub demoted_total: u64,
    /// Collected entries purged by sweeps since creation.
    pub purged_total: u64,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub demoted: usize,
    pub purged: usize,
}

// ============================================================================
// REPOSITORY
// ============================================================================

struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ProxyRepository {
    entries: Mutex<HashMap<ObjectKey, ProxyEntry>>,
    inactivity_threshold: Duration,
    sweep_period: Duration,
    demoted_total: AtomicU64,
    purged_total: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ProxyRepository {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            inactivity_threshold: config.inactivity_threshold,
            sweep_period: config.sweep_period,
            demoted_total: AtomicU64::new(0),
            purged_total: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    fn entries(&self) -> CimCacheResult<MutexGuard<'_, HashMap<ObjectKey, ProxyEntry>>> {
        self.entries
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Register `proxy` under its key.
    ///
    /// Returns the canonical proxy and whether `proxy` became it. If a live
    /// proxy is already registered it is returned and `proxy` is discarded.
    /// An entry whose proxy was collected is resurrected in place with
    /// `proxy`.
    pub fn register(&self, proxy: Arc<Proxy>) -> CimCacheResult<(Arc<Proxy>, bool)> {
        let mut entries = self.entries()?;
        let key = proxy.key().clone();

        match entries.get_mut(&key) {
            None => {
                entries.insert(key, ProxyEntry::strong(proxy.clone()));
                Ok((proxy, true))
            }
            Some(entry) => match entry.access() {
                Some(existing) => Ok((existing, false)),
                None => {
                    entry.resurrect(&key, proxy.clone())?;
                    tracing::debug!(key = %key, "Resurrected collected proxy entry");
                    Ok((proxy, true))
                }
            },
        }
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn unregister(&self, key: &ObjectKey) -> CimCacheResult<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    /// The live proxy for `key`, if any. Touches the entry.
    pub fn try_get(&self, key: &ObjectKey) -> CimCacheResult<Option<Arc<Proxy>>> {
        Ok(self.entries()?.get_mut(key).and_then(ProxyEntry::access))
    }

    /// Every live proxy on `connection` whose class is `class_name`
    /// (case-insensitive).
    ///
    /// Each returned proxy counts as accessed, the same as through
    /// [`try_get`](Self::try_get): its idle clock restarts and a weak entry
    /// is promoted back to strong.
    pub fn get_all(&self, connection: &ConnectionId, class_name: &str) -> CimCacheResult<Vec<Arc<Proxy>>> {
        let mut entries = self.entries()?;
        Ok(entries
            .iter_mut()
            .filter(|(key, _)| key.connection() == connection && key.is_class_named(class_name))
            .filter_map(|(_, entry)| entry.access())
            .collect())
    }

    /// Every live proxy on `connection`.
    ///
    /// Used for connection teardown, so unlike [`get_all`](Self::get_all)
    /// it leaves the entries untouched.
    pub fn get_all_for_connection(&self, connection: &ConnectionId) -> CimCacheResult<Vec<Arc<Proxy>>> {
        let entries = self.entries()?;
        Ok(entries
            .iter()
            .filter(|(key, _)| key.connection() == connection)
            .filter_map(|(_, entry)| entry.peek())
            .collect())
    }

    /// Demote the entry for `key` to a weak reference.
    pub fn demote(&self, key: &ObjectKey) -> CimCacheResult<()> {
        let mut entries = self.entries()?;
        match entries.get_mut(key) {
            Some(entry) => Ok(entry.demote(key)?),
            None => Err(UsageError::InvalidArgument {
                name: "key".to_string(),
                reason: format!("{} is not registered", key),
            }
            .into()),
        }
    }

    /// Whether the entry for `key` currently holds a strong reference.
    pub fn is_strong(&self, key: &ObjectKey) -> CimCacheResult<Option<bool>> {
        Ok(self.entries()?.get(key).map(ProxyEntry::is_strong))
    }

    /// Drop every entry.
    pub fn clear(&self) -> CimCacheResult<usize> {
        let mut entries = self.entries()?;
        let count = entries.len();
        entries.clear();
        tracing::debug!(entries = count, "Cleared proxy repository");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CimCacheResult<RepositoryStats> {
        let entries = self.entries()?;
        let strong = entries.values().filter(|e| e.is_strong()).count();
        Ok(RepositoryStats {
            entries: entries.len(),
            strong,
            weak: entries.len() - strong,
            demoted_total: self.demoted_total.load(Ordering::Relaxed),
            purged_total: self.purged_total.load(Ordering::Relaxed),
        })
    }

    /// Demote idle strong entries and purge collected weak ones.
    pub fn sweep(&self) -> CimCacheResult<SweepReport> {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> CimCacheResult<SweepReport> {
        let mut entries = self.entries()?;
        let mut report = SweepReport::default();

        entries.retain(|key, entry| {
            if entry.is_strong() {
                if now.saturating_duration_since(entry.last_access) > self.inactivity_threshold
                    && entry.demote(key).is_ok()
                {
                    report.demoted += 1;
                }
                true
            } else if entry.is_collected() {
                report.purged += 1;
                false
            } else {
                true
            }
        });

        self.demoted_total
            .fetch_add(report.demoted as u64, Ordering::Relaxed);
        self.purged_total
            .fetch_add(report.purged as u64, Ordering::Relaxed);
        tracing::debug!(
            demoted = report.demoted,
            purged = report.purged,
            remaining = entries.len(),
            "Proxy repository sweep completed"
        );
        Ok(report)
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The sweeper holds only a weak reference to the repository and stops
    /// when the repository is dropped or [`shutdown`](Self::shutdown) is
    /// called. Starting twice is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) -> CimCacheResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| UsageError::InvalidArgument {
            name: "runtime".to_string(),
            reason: "the repository sweeper requires a tokio runtime".to_string(),
        })?;
        let mut sweeper = self.sweeper.lock().map_err(|_| StorageError::LockPoisoned)?;
        if sweeper.is_some() {
            return Ok(());
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let repository = Arc::downgrade(self);
        let period = self.sweep_period;

        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(sweep_period_secs = period.as_secs(), "Proxy repository sweeper started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(repository) = repository.upgrade() else {
                            break;
                        };
                        if let Err(e) = repository.sweep() {
                            tracing::error!(error = %e, "Proxy repository sweep failed");
                        }
                    }
                }
            }

            tracing::info!("Proxy repository sweeper stopped");
        });

        *sweeper = Some(Sweeper { shutdown, handle });
        Ok(())
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|s| s.as_ref().is_some_and(|s| !s.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the periodic sweep.
    pub fn shutdown(&self) {
        let sweeper = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(true);
        }
    }
}

impl Drop for ProxyRepository {
    fn drop(&mut self) {
        let sweeper = match self.sweeper.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.handle.abort();
        }
    }
}

impl std::fmt::Debug for ProxyRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRepository")
            .field("entries", &self.len())
            .field("inactivity_threshold", &self.inactivity_threshold)
            .field("sweep_period", &self.sweep_period)
            .finish()
    }
}
