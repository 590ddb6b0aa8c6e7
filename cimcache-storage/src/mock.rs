//! In-memory remote service for tests.
//!
//! Holds scripted instances and related sets, a scriptable liveness answer
//! and call counters so tests can assert how often the cache went remote.

use crate::remote::{InstanceResolver, LivenessProbe, RelationshipResolver};
use async_trait::async_trait;
use cimcache_core::{
    Association, CimCacheError, CimCacheResult, ConnectionId, ObjectKey, PropertyValue,
    RemoteError, RemoteInstance, ServiceState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
enum ProbeBehavior {
    Answer(ServiceState),
    Fail(CimCacheError),
    Hang,
}

#[derive(Debug)]
struct MockState {
    instances: HashMap<ObjectKey, RemoteInstance>,
    related: HashMap<(ObjectKey, Association), Vec<RemoteInstance>>,
    related_failures: HashMap<(ObjectKey, Association), CimCacheError>,
    probe: ProbeBehavior,
    unreachable: bool,
}

/// Mock remote service backed by in-memory maps.
#[derive(Debug)]
pub struct MockRemoteService {
    connection: ConnectionId,
    state: Mutex<MockState>,
    fetch_calls: AtomicUsize,
    partial_calls: AtomicUsize,
    related_calls: AtomicUsize,
    modify_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl MockRemoteService {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            state: Mutex::new(MockState {
                instances: HashMap::new(),
                related: HashMap::new(),
                related_failures: HashMap::new(),
                probe: ProbeBehavior::Answer(ServiceState::Running),
                unreachable: false,
            }),
            fetch_calls: AtomicUsize::new(0),
            partial_calls: AtomicUsize::new(0),
            related_calls: AtomicUsize::new(0),
            modify_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn insert_instance(&self, key: &ObjectKey, instance: RemoteInstance) {
        self.state().instances.insert(key.clone(), instance);
    }

    pub fn remove_instance(&self, key: &ObjectKey) -> Option<RemoteInstance> {
        self.state().instances.remove(key)
    }

    /// Change one property of a stored instance.
    pub fn set_property(&self, key: &ObjectKey, name: &str, value: impl Into<PropertyValue>) {
        let mut state = self.state();
        if let Some(instance) = state.instances.remove(key) {
            state
                .instances
                .insert(key.clone(), instance.with_property(name, value));
        }
    }

    pub fn set_related(&self, key: &ObjectKey, association: &Association, related: Vec<RemoteInstance>) {
        self.state()
            .related
            .insert((key.clone(), association.clone()), related);
    }

    /// Make enumeration of one association fail with `error`.
    pub fn fail_related(&self, key: &ObjectKey, association: &Association, error: CimCacheError) {
        self.state()
            .related_failures
            .insert((key.clone(), association.clone()), error);
    }

    pub fn set_service_state(&self, state: ServiceState) {
        self.state().probe = ProbeBehavior::Answer(state);
    }

    pub fn fail_probe(&self, error: CimCacheError) {
        self.state().probe = ProbeBehavior::Fail(error);
    }

    /// Make liveness reads never answer.
    pub fn hang_probe(&self) {
        self.state().probe = ProbeBehavior::Hang;
    }

    /// Make every object call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn partial_calls(&self) -> usize {
        self.partial_calls.load(Ordering::SeqCst)
    }

    pub fn related_calls(&self) -> usize {
        self.related_calls.load(Ordering::SeqCst)
    }

    pub fn modify_calls(&self) -> usize {
        self.modify_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self, state: &MockState) -> CimCacheResult<()> {
        if state.unreachable {
            return Err(RemoteError::ConnectionFailed {
                connection: self.connection.clone(),
                reason: "mock service unreachable".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn lookup(&self, key: &ObjectKey) -> CimCacheResult<RemoteInstance> {
        let state = self.state();
        self.check_reachable(&state)?;
        state.instances.get(key).cloned().ok_or_else(|| {
            RemoteError::NotFound {
                path: key.path().to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl InstanceResolver for MockRemoteService {
    async fn fetch_instance(&self, key: &ObjectKey) -> CimCacheResult<RemoteInstance> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(key)
    }

    async fn fetch_partial(
        &self,
        key: &ObjectKey,
        properties: &[String],
    ) -> CimCacheResult<RemoteInstance> {
        self.partial_calls.fetch_add(1, Ordering::SeqCst);
        let full = self.lookup(key)?;

        let mut partial = RemoteInstance::new(full.class_name());
        for (name, value) in full.properties() {
            if full.is_key(name) {
                partial = partial.with_key(name, value.clone());
            } else if properties.iter().any(|p| p.eq_ignore_ascii_case(name)) {
                partial = partial.with_property(name, value.clone());
            }
        }
        Ok(partial)
    }

    async fn modify_instance(
        &self,
        key: &ObjectKey,
        values: &[(String, PropertyValue)],
    ) -> CimCacheResult<()> {
        self.modify_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        self.check_reachable(&state)?;
        let Some(mut instance) = state.instances.remove(key) else {
            return Err(RemoteError::NotFound {
                path: key.path().to_string(),
            }
            .into());
        };
        for (name, value) in values {
            instance = instance.with_property(name.as_str(), value.clone());
        }
        state.instances.insert(key.clone(), instance);
        Ok(())
    }
}

#[async_trait]
impl RelationshipResolver for MockRemoteService {
    async fn enumerate_related(
        &self,
        key: &ObjectKey,
        association: &Association,
    ) -> CimCacheResult<Vec<RemoteInstance>> {
        self.related_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        self.check_reachable(&state)?;
        let slot = (key.clone(), association.clone());
        if let Some(error) = state.related_failures.get(&slot) {
            return Err(error.clone());
        }
        Ok(state.related.get(&slot).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl LivenessProbe for MockRemoteService {
    async fn read_service_state(&self, _timeout: Duration) -> CimCacheResult<ServiceState> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.state().probe.clone();
        match behavior {
            ProbeBehavior::Answer(state) => Ok(state),
            ProbeBehavior::Fail(error) => Err(error),
            ProbeBehavior::Hang => std::future::pending().await,
        }
    }
}
