//! CIMCACHE Test Utilities
//!
//! Centralized test infrastructure for the CIMCACHE workspace:
//! - Proptest generators for keys, values and associations
//! - Fixtures for a mock-backed object cache
//! - Custom assertions for error classification
//! - Tracing initialisation for tests

// Re-export the mock service from its source crate
pub use cimcache_storage::MockRemoteService;

// Re-export core types for convenience
pub use cimcache_core::{
    Association, AssociationKind, CacheConfig, CimCacheError, CimCacheResult, ConnectionId,
    InstanceEventType, ObjectKey, PropertyValue, RemoteError, RemoteInstance, ServiceState,
    TaskError, UsageError,
};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a fmt subscriber for tests. Honors `RUST_LOG`; defaults to
/// `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating CIMCACHE value types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    /// Host names as they appear in connection strings.
    pub fn arb_host() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9-]{0,14}"
    }

    pub fn arb_connection_id() -> impl Strategy<Value = ConnectionId> {
        arb_host().prop_map(ConnectionId::new)
    }

    /// Class or property identifiers.
    pub fn arb_identifier() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9_]{0,20}"
    }

    pub fn arb_namespace() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9]{0,8}", 1..4).prop_map(|parts| parts.join("\\"))
    }

    /// Key property values, including characters the path format escapes.
    pub fn arb_key_value() -> impl Strategy<Value = String> {
        "[ -~]{1,24}"
    }

    pub fn arb_object_key() -> impl Strategy<Value = ObjectKey> {
        (
            arb_connection_id(),
            arb_namespace(),
            arb_identifier(),
            prop::collection::btree_map(arb_identifier(), arb_key_value(), 1..4),
        )
            .prop_filter_map("key properties must be distinct ignoring case", |(c, ns, class, keys)| {
                let mut seen = std::collections::HashSet::new();
                if !keys.keys().all(|k| seen.insert(k.to_ascii_lowercase())) {
                    return None;
                }
                let mut builder = ObjectKey::builder(c, ns, class);
                for (name, value) in keys {
                    builder = builder.key_property(name, value);
                }
                builder.build().ok()
            })
    }

    /// Scalar property values.
    pub fn arb_scalar_value() -> impl Strategy<Value = PropertyValue> {
        prop_oneof![
            Just(PropertyValue::Null),
            any::<bool>().prop_map(PropertyValue::Bool),
            any::<i64>().prop_map(PropertyValue::SInt),
            any::<u64>().prop_map(PropertyValue::UInt),
            any::<f64>().prop_map(PropertyValue::Real),
            "[ -~]{0,32}".prop_map(PropertyValue::String),
            (0i64..4_102_444_800).prop_map(|secs| {
                PropertyValue::DateTime(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
            }),
            any::<u32>().prop_map(|ms| PropertyValue::Interval(std::time::Duration::from_millis(ms as u64))),
        ]
    }

    /// Scalar values and (possibly nested) arrays of them.
    pub fn arb_property_value() -> impl Strategy<Value = PropertyValue> {
        arb_scalar_value().prop_recursive(2, 24, 6, |inner| {
            prop::collection::vec(inner, 0..6).prop_map(PropertyValue::Array)
        })
    }

    pub fn arb_association() -> impl Strategy<Value = Association> {
        prop_oneof![
            (arb_identifier(), prop::option::of(arb_identifier()), prop::option::of(arb_identifier()))
                .prop_map(|(name, result_class, role)| {
                    let mut association = Association::relationship(name);
                    if let Some(class) = result_class {
                        association = association.with_result_class(class);
                    }
                    if let Some(role) = role {
                        association = association.with_role(role);
                    }
                    association
                }),
            ("SELECT \\* FROM [A-Za-z_]{1,16}", arb_namespace())
                .prop_map(|(query, namespace)| Association::query(query, namespace)),
        ]
    }

    /// Flip the case of every ASCII letter.
    pub fn flip_case(s: &str) -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_uppercase() {
                    c.to_ascii_lowercase()
                } else {
                    c.to_ascii_uppercase()
                }
            })
            .collect()
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use cimcache_storage::ObjectCache;
    use std::sync::Arc;
    use std::time::Duration;

    pub const HOST: &str = "hyperv01";
    pub const VIRT_NAMESPACE: &str = "root\\virtualization\\v2";
    pub const VM_CLASS: &str = "Msvm_ComputerSystem";

    pub fn connection_id() -> ConnectionId {
        ConnectionId::new(HOST)
    }

    /// Config with short timers, for paused-clock tests.
    pub fn fast_config() -> CacheConfig {
        CacheConfig::default()
            .with_sweep(Duration::from_secs(60), Duration::from_secs(90))
            .with_probe_interval(Duration::from_millis(5000))
            .with_probe_timeout(Duration::from_millis(2000))
    }

    pub fn vm_key(name: &str) -> ObjectKey {
        ObjectKey::builder(connection_id(), VIRT_NAMESPACE, VM_CLASS)
            .key_property("CreationClassName", VM_CLASS)
            .key_property("Name", name)
            .build()
            .expect("fixture key is valid")
    }

    pub fn vm_instance(name: &str) -> RemoteInstance {
        RemoteInstance::new(VM_CLASS)
            .with_key("CreationClassName", VM_CLASS)
            .with_key("Name", name)
            .with_property("ElementName", format!("vm {}", name))
            .with_property("EnabledState", 2u16)
    }

    pub fn disk_instance(id: &str) -> RemoteInstance {
        RemoteInstance::new("Msvm_StorageAllocationSettingData")
            .with_key("InstanceID", id)
            .with_property("HostResource", vec![format!("C:\\disks\\{}.vhdx", id)])
    }

    /// Mock service on [`HOST`] with `vms` stored.
    pub fn mock_service(vms: &[&str]) -> Arc<MockRemoteService> {
        let mock = Arc::new(MockRemoteService::new(connection_id()));
        for name in vms {
            mock.insert_instance(&vm_key(name), vm_instance(name));
        }
        mock
    }

    /// Object cache with one mock-backed connection.
    pub fn object_cache(config: CacheConfig, vms: &[&str]) -> (ObjectCache, Arc<MockRemoteService>) {
        let mock = mock_service(vms);
        let cache = ObjectCache::new(config).expect("fixture config is valid");
        cache
            .add_connection(connection_id(), mock.clone())
            .expect("connection registers");
        (cache, mock)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for CIMCACHE error classification.

    use super::*;

    /// Assert that a CimCacheResult is a usage error.
    #[track_caller]
    pub fn assert_usage_error<T: std::fmt::Debug>(result: &CimCacheResult<T>) {
        match result {
            Err(CimCacheError::Usage(_)) => {}
            other => panic!("Expected Usage error, got: {:?}", other),
        }
    }

    /// Assert that a CimCacheResult is a connectivity failure.
    #[track_caller]
    pub fn assert_connectivity_error<T: std::fmt::Debug>(result: &CimCacheResult<T>) {
        match result {
            Err(e) if e.is_connectivity() => {}
            other => panic!("Expected connectivity error, got: {:?}", other),
        }
    }

    /// Assert that a CimCacheResult is a disconnect of `connection`.
    #[track_caller]
    pub fn assert_disconnected<T: std::fmt::Debug>(result: &CimCacheResult<T>, connection: &ConnectionId) {
        match result {
            Err(CimCacheError::Task(TaskError::Disconnected { connection: c })) if c == connection => {}
            other => panic!("Expected disconnect of {}, got: {:?}", connection, other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
