//! Per-object property cache.
//!
//! Holds the last known value of every property fetched for one remote
//! object. Names are case-insensitive. The map is guarded by a private lock
//! that is never held across a remote call, so two concurrent refreshes may
//! both go to the service; the last one to finish wins.

use super::base::{CacheBase, Refreshable};
use crate::connection::Connection;
use async_trait::async_trait;
use cimcache_core::{CimCacheResult, ObjectKey, PropertyValue, RemoteInstance, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// System property holding the object's class name.
pub const SYSTEM_CLASS: &str = "__CLASS";
/// System property holding the server the object lives on.
pub const SYSTEM_SERVER: &str = "__SERVER";
/// System property holding the object's namespace.
pub const SYSTEM_NAMESPACE: &str = "__NAMESPACE";
/// System property holding the object's full path.
pub const SYSTEM_PATH: &str = "__PATH";

/// How much of the object a refresh fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshMode {
    /// Every property. Marks the cache initialized and fresh.
    Full,
    /// The named properties only. Leaves the freshness state alone.
    Partial(Vec<String>),
    /// The key properties only. Leaves the freshness state alone.
    KeysOnly,
}

#[derive(Debug, Clone)]
struct CachedProperty {
    name: String,
    value: PropertyValue,
}

#[derive(Debug, Default)]
struct PropertyState {
    values: HashMap<String, CachedProperty>,
    class_name: Option<String>,
}

pub struct PropertyCache {
    key: ObjectKey,
    base: CacheBase,
    state: Mutex<PropertyState>,
}

impl PropertyCache {
    pub fn new(key: ObjectKey, connection: Arc<Connection>) -> Self {
        Self {
            key,
            base: CacheBase::new(connection),
            state: Mutex::new(PropertyState::default()),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    fn state(&self) -> CimCacheResult<MutexGuard<'_, PropertyState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Answer the system properties from the key alone.
    fn system_property(&self, name: &str) -> Option<PropertyValue> {
        if name.eq_ignore_ascii_case(SYSTEM_CLASS) {
            Some(PropertyValue::from(self.key.class_name()))
        } else if name.eq_ignore_ascii_case(SYSTEM_SERVER) {
            Some(PropertyValue::from(self.key.connection().as_str()))
        } else if name.eq_ignore_ascii_case(SYSTEM_NAMESPACE) {
            Some(PropertyValue::from(self.key.namespace()))
        } else if name.eq_ignore_ascii_case(SYSTEM_PATH) {
            Some(PropertyValue::from(self.key.path()))
        } else {
            None
        }
    }

    fn lookup(&self, name: &str) -> CimCacheResult<Option<PropertyValue>> {
        Ok(self
            .state()?
            .values
            .get(&name.to_ascii_lowercase())
            .map(|p| p.value.clone()))
    }

    /// Look up a property.
    ///
    /// A miss on a cache that was never fully loaded triggers one full
    /// refresh and a second lookup. `Ok(None)` means the object really has
    /// no such property.
    pub async fn try_get(&self, name: &str) -> CimCacheResult<Option<PropertyValue>> {
        if let Some(value) = self.system_property(name) {
            return Ok(Some(value));
        }
        if let Some(value) = self.lookup(name)? {
            return Ok(Some(value));
        }
        if self.base.is_initialized() {
            return Ok(None);
        }

        self.refresh(RefreshMode::Full).await?;
        self.lookup(name)
    }

    /// Cached value without touching the remote service.
    pub fn peek(&self, name: &str) -> CimCacheResult<Option<PropertyValue>> {
        match self.system_property(name) {
            Some(value) => Ok(Some(value)),
            None => self.lookup(name),
        }
    }

    /// Snapshot of every cached property, with original-case names.
    pub fn snapshot(&self) -> CimCacheResult<Vec<(String, PropertyValue)>> {
        let state = self.state()?;
        let mut values: Vec<(String, PropertyValue)> = state
            .values
            .values()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        values.sort_by(|a, b| a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()));
        Ok(values)
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class name of the first instance applied to this cache.
    pub fn class_name(&self) -> Option<String> {
        self.state().ok().and_then(|s| s.class_name.clone())
    }

    /// Fetch from the remote service and apply the result.
    ///
    /// Returns whether any cached value changed.
    pub async fn refresh(&self, mode: RefreshMode) -> CimCacheResult<bool> {
        let epoch = self.base.refresh_started();
        let service = self.base.connection().service().clone();

        let changed = match &mode {
            RefreshMode::Full => {
                let instance = service.fetch_instance(&self.key).await?;
                let changed = self.apply(&instance, |_| true)?;
                self.base.refresh_completed(epoch);
                changed
            }
            RefreshMode::Partial(names) => {
                let instance = service.fetch_partial(&self.key, names).await?;
                self.apply(&instance, |name| {
                    names.iter().any(|n| n.eq_ignore_ascii_case(name))
                })?
            }
            RefreshMode::KeysOnly => {
                let names: Vec<String> = self
                    .key
                    .key_properties()
                    .iter()
                    .map(|(name, _)| name.clone())
                    .collect();
                let instance = service.fetch_partial(&self.key, &names).await?;
                self.apply(&instance, |name| instance.is_key(name))?
            }
        };

        tracing::debug!(
            key = %self.key,
            mode = ?mode,
            changed,
            "Refreshed property cache"
        );
        Ok(changed)
    }

    /// Apply a complete post-change instance, e.g. from a modification
    /// event. Marks the cache fresh.
    pub fn apply_instance(&self, instance: &RemoteInstance) -> CimCacheResult<bool> {
        let epoch = self.base.refresh_started();
        let changed = self.apply(instance, |_| true)?;
        self.base.refresh_completed(epoch);
        Ok(changed)
    }

    /// Apply values written locally. Freshness is unchanged.
    pub fn apply_values(&self, values: &[(String, PropertyValue)]) -> CimCacheResult<bool> {
        let mut state = self.state()?;
        let mut changed = false;
        for (name, value) in values {
            changed |= Self::store(&mut state, name, value);
        }
        Ok(changed)
    }

    fn apply(
        &self,
        instance: &RemoteInstance,
        include: impl Fn(&str) -> bool,
    ) -> CimCacheResult<bool> {
        let mut state = self.state()?;
        if state.class_name.is_none() && !instance.class_name().is_empty() {
            state.class_name = Some(instance.class_name().to_string());
        }

        let mut changed = false;
        for (name, value) in instance.properties() {
            if include(name) {
                changed |= Self::store(&mut state, name, value);
            }
        }
        Ok(changed)
    }

    fn store(state: &mut PropertyState, name: &str, value: &PropertyValue) -> bool {
        let slot = name.to_ascii_lowercase();
        match state.values.get_mut(&slot) {
            Some(cached) if !value.differs_from(&cached.value) => false,
            Some(cached) => {
                cached.value = value.clone();
                true
            }
            None => {
                state.values.insert(
                    slot,
                    CachedProperty {
                        name: name.to_string(),
                        value: value.clone(),
                    },
                );
                true
            }
        }
    }
}

#[async_trait]
impl Refreshable for PropertyCache {
    fn base(&self) -> &CacheBase {
        &self.base
    }

    async fn perform_update(&self) -> CimCacheResult<bool> {
        self.refresh(RefreshMode::Full).await
    }
}

impl std::fmt::Debug for PropertyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyCache")
            .field("key", &self.key)
            .field("len", &self.len())
            .finish()
    }
}
