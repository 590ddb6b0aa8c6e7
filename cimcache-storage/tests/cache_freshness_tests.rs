//! Integration tests for property and association cache freshness.
//!
//! Covers threshold expiry and connection flushes, refresh failures, array
//! change detection, `do_not_update` associations and association cache
//! sharing across call sites.

use cimcache_storage::{ProxyEvent, Refreshable};
use cimcache_test_utils::{
    assertions, fixtures, init_test_tracing, Association, CimCacheError, PropertyValue,
    RemoteError, RemoteInstance,
};
use std::sync::Arc;
use std::time::Duration;

const THRESHOLD: Duration = Duration::from_secs(60);

fn settings_association() -> Association {
    Association::relationship("Msvm_SettingsDefineState")
        .with_result_class("Msvm_VirtualSystemSettingData")
        .with_role("ManagedElement")
}

// ============================================================================
// TTL AND FLUSH
// ============================================================================

#[tokio::test]
async fn test_needs_update_follows_threshold_and_flush() {
    init_test_tracing();
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let proxy = cache.get_or_create_proxy(&fixtures::vm_key("vm-1")).unwrap();

    // Uninitialized right after construction.
    assert!(proxy.properties().needs_update(THRESHOLD));

    assert!(cache.update_property_cache(&proxy, THRESHOLD).await.unwrap());
    assert!(!proxy.properties().needs_update(THRESHOLD));
    assert_eq!(mock.fetch_calls(), 1);

    // Still fresh: no remote call.
    assert!(!cache.update_property_cache(&proxy, THRESHOLD).await.unwrap());
    assert_eq!(mock.fetch_calls(), 1);

    // A zero threshold is always stale.
    assert!(proxy.properties().needs_update(Duration::ZERO));

    proxy.connection().flush_all_caches();
    assert!(proxy.properties().needs_update(THRESHOLD));
    cache.update_property_cache(&proxy, THRESHOLD).await.unwrap();
    assert_eq!(mock.fetch_calls(), 2);
    assert!(!proxy.properties().needs_update(THRESHOLD));
}

#[tokio::test]
async fn test_invalidate_keeps_values_readable() {
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let proxy = cache.get_or_create_proxy(&fixtures::vm_key("vm-1")).unwrap();

    assert_eq!(
        proxy.get_property("ElementName").await.unwrap(),
        PropertyValue::from("vm vm-1")
    );
    cache.invalidate_property_cache(&proxy);
    assert!(proxy.properties().needs_update(THRESHOLD));
    assert_eq!(
        proxy.properties().peek("ElementName").unwrap(),
        Some(PropertyValue::from("vm vm-1"))
    );
    assert_eq!(mock.fetch_calls(), 1);
}

// ============================================================================
// ARRAY CHANGE DETECTION
// ============================================================================

#[tokio::test]
async fn test_equal_array_replacement_is_not_a_change() {
    let (cache, _mock) = fixtures::object_cache(fixtures::fast_config(), &[]);
    let key = fixtures::vm_key("vm-arr");
    let addresses = || vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];

    let proxy = cache
        .get_or_create_proxy_from_instance(
            &fixtures::connection_id(),
            fixtures::VIRT_NAMESPACE,
            &fixtures::vm_instance("vm-arr").with_property("Addresses", addresses()),
        )
        .unwrap();
    assert!(Arc::ptr_eq(&proxy, &cache.try_get_proxy(&key).unwrap().unwrap()));
    let mut updates = proxy.subscribe();

    let same = fixtures::vm_instance("vm-arr").with_property("Addresses", addresses());
    assert!(!proxy.apply_remote_instance(&same).unwrap());
    assert!(updates.try_recv().is_err());

    let mut changed_addresses = addresses();
    changed_addresses[1] = "10.0.0.3".to_string();
    let changed = fixtures::vm_instance("vm-arr").with_property("Addresses", changed_addresses);
    assert!(proxy.apply_remote_instance(&changed).unwrap());
    assert_eq!(
        updates.try_recv().unwrap(),
        ProxyEvent::PropertyCacheUpdated { key }
    );
}

// ============================================================================
// DO-NOT-UPDATE ASSOCIATIONS
// ============================================================================

#[tokio::test]
async fn test_do_not_update_association_keeps_first_result() {
    init_test_tracing();
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let key = fixtures::vm_key("vm-1");
    let pinned = settings_association().excluded_from_refresh();
    let live = Association::relationship("Msvm_SystemDevice");

    mock.set_related(&key, &pinned, vec![fixtures::disk_instance("a")]);
    mock.set_related(&key, &live, vec![fixtures::disk_instance("b")]);

    let proxy = cache.get_or_create_proxy(&key).unwrap();
    assert_eq!(proxy.related_keys(&pinned, THRESHOLD).await.unwrap().len(), 1);
    assert_eq!(proxy.related_keys(&live, THRESHOLD).await.unwrap().len(), 1);
    assert_eq!(mock.related_calls(), 2);

    mock.set_related(
        &key,
        &pinned,
        vec![fixtures::disk_instance("a"), fixtures::disk_instance("c")],
    );

    // Bulk invalidation skips it.
    assert_eq!(cache.invalidate_association_cache(&proxy).unwrap(), 1);
    let pinned_cache = proxy.associations().get_cache(&pinned).unwrap().unwrap();
    assert!(!pinned_cache.needs_update(THRESHOLD));

    // Bulk refresh skips it.
    assert_eq!(
        cache
            .update_association_cache(&proxy, Duration::ZERO, &[])
            .await
            .unwrap(),
        0
    );
    assert_eq!(mock.related_calls(), 3);

    // So does a direct refresh, and a plain read.
    assert!(!proxy
        .associations()
        .update_one(&pinned, Duration::ZERO)
        .await
        .unwrap());
    assert_eq!(proxy.related_keys(&pinned, Duration::ZERO).await.unwrap().len(), 1);
    assert_eq!(mock.related_calls(), 3);
}

#[tokio::test]
async fn test_update_all_honours_exclusions() {
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let key = fixtures::vm_key("vm-1");
    let settings = settings_association();
    let devices = Association::relationship("Msvm_SystemDevice");

    let proxy = cache.get_or_create_proxy(&key).unwrap();
    proxy.related_keys(&settings, THRESHOLD).await.unwrap();
    proxy.related_keys(&devices, THRESHOLD).await.unwrap();
    assert_eq!(mock.related_calls(), 2);

    mock.set_related(&key, &settings, vec![fixtures::disk_instance("s")]);
    mock.set_related(&key, &devices, vec![fixtures::disk_instance("d")]);

    let changed = cache
        .update_association_cache(&proxy, Duration::ZERO, &[devices.clone()])
        .await
        .unwrap();
    assert_eq!(changed, 1);
    assert_eq!(mock.related_calls(), 3);
    assert_eq!(proxy.associations().try_get_related(&devices).unwrap(), Some(vec![]));
}

#[tokio::test]
async fn test_failing_association_does_not_block_the_others() {
    init_test_tracing();
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let key = fixtures::vm_key("vm-1");
    let settings = settings_association();
    let devices = Association::relationship("Msvm_SystemDevice");

    let proxy = cache.get_or_create_proxy(&key).unwrap();
    proxy.related_keys(&settings, THRESHOLD).await.unwrap();
    proxy.related_keys(&devices, THRESHOLD).await.unwrap();
    assert_eq!(mock.related_calls(), 2);

    // The settings association now fails remotely while devices went stale.
    mock.fail_related(
        &key,
        &settings,
        RemoteError::CallFailed {
            connection: fixtures::connection_id(),
            reason: "WBEM_E_ACCESS_DENIED".to_string(),
        }
        .into(),
    );
    mock.set_related(&key, &devices, vec![fixtures::disk_instance("d")]);

    let result = cache
        .update_association_cache(&proxy, Duration::ZERO, &[])
        .await;
    assertions::assert_connectivity_error(&result);
    assert_eq!(mock.related_calls(), 4);

    let refreshed = proxy.associations().try_get_related(&devices).unwrap().unwrap();
    assert_eq!(refreshed.len(), 1);
    assert_eq!(refreshed[0].key_property("InstanceID"), Some("d"));
    let devices_cache = proxy.associations().get_cache(&devices).unwrap().unwrap();
    assert!(!devices_cache.needs_update(THRESHOLD));

    // The failed cache keeps serving its previous result.
    assert_eq!(proxy.associations().try_get_related(&settings).unwrap(), Some(vec![]));
}

#[tokio::test]
async fn test_unreachable_service_fails_refresh_but_keeps_cached_values() {
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let key = fixtures::vm_key("vm-1");
    let proxy = cache.get_or_create_proxy(&key).unwrap();
    assert!(cache.update_property_cache(&proxy, THRESHOLD).await.unwrap());

    mock.set_unreachable(true);
    let result = cache.update_property_cache(&proxy, Duration::ZERO).await;
    assertions::assert_connectivity_error(&result);
    assert_eq!(
        proxy.properties().peek("ElementName").unwrap(),
        Some(PropertyValue::from("vm vm-1"))
    );

    mock.set_unreachable(false);
    assert!(!cache.update_property_cache(&proxy, Duration::ZERO).await.unwrap());
}

#[tokio::test]
async fn test_removed_remote_instance_reports_not_found() {
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let key = fixtures::vm_key("vm-1");
    assert!(mock.remove_instance(&key).is_some());
    assert!(mock.remove_instance(&key).is_none());

    let proxy = cache.get_or_create_proxy(&key).unwrap();
    let err = cache
        .update_property_cache(&proxy, THRESHOLD)
        .await
        .unwrap_err();
    assert!(matches!(err, CimCacheError::Remote(RemoteError::NotFound { .. })));
    assert!(proxy.properties().needs_update(THRESHOLD));
}

#[tokio::test]
async fn test_unmappable_related_instances_are_skipped() {
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let key = fixtures::vm_key("vm-1");
    let devices = Association::relationship("Msvm_SystemDevice");

    // An instance without key properties cannot be mapped to a key.
    mock.set_related(
        &key,
        &devices,
        vec![
            fixtures::disk_instance("ok"),
            RemoteInstance::new("Msvm_Unkeyed").with_property("Caption", "orphan"),
        ],
    );

    let proxy = cache.get_or_create_proxy(&key).unwrap();
    let related = proxy.related_keys(&devices, THRESHOLD).await.unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].key_property("InstanceID"), Some("ok"));
}

// ============================================================================
// END-TO-END: SHARED ASSOCIATION CACHE
// ============================================================================

#[tokio::test]
async fn test_equal_associations_share_one_cache() {
    init_test_tracing();
    let (cache, mock) = fixtures::object_cache(fixtures::fast_config(), &["vm-1"]);
    let key = fixtures::vm_key("vm-1");
    mock.set_related(&key, &settings_association(), vec![fixtures::disk_instance("s")]);

    // Three call sites, each building its own descriptor.
    let call_sites: Vec<Association> = (0..3).map(|_| settings_association()).collect();
    let mut views = Vec::new();
    for association in &call_sites {
        let proxy = cache.get_or_create_proxy(&key).unwrap();
        let related = cache
            .related_proxies(&proxy, association, THRESHOLD)
            .await
            .unwrap();
        assert_eq!(related.len(), 1);
        views.push(proxy);
    }

    let proxy = &views[0];
    assert!(views.iter().all(|v| Arc::ptr_eq(v, proxy)));
    assert_eq!(proxy.associations().len(), 1);
    assert_eq!(mock.related_calls(), 1);

    let caches: Vec<_> = call_sites
        .iter()
        .map(|a| proxy.associations().get_cache(a).unwrap().unwrap())
        .collect();
    assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
    assert!(caches.iter().all(|c| !c.needs_update(THRESHOLD)));

    assert_eq!(cache.invalidate_association_cache(proxy).unwrap(), 1);
    assert!(caches.iter().all(|c| c.needs_update(THRESHOLD)));

    // The related objects are proxies in the same repository.
    let disk_key = proxy
        .associations()
        .try_get_related(&call_sites[2])
        .unwrap()
        .unwrap()
        .remove(0);
    assert!(cache.try_get_proxy(&disk_key).unwrap().is_some());
}
