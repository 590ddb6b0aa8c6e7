//! Property-Based Tests for Proxy Repository Identity
//!
//! For any object key, every registration path yields one canonical proxy:
//! - concurrent registrations agree on the winner
//! - a collected weak entry is resurrected in place
//! - idle entries are demoted by the sweep and promoted again on access

use cimcache_storage::{Connection, Proxy, ProxyRepository};
use cimcache_test_utils::{fixtures, generators, init_test_tracing, MockRemoteService, ObjectKey};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::time::Duration;

// ============================================================================
// HELPERS
// ============================================================================

fn connection_for(key: &ObjectKey) -> Arc<Connection> {
    let mock = Arc::new(MockRemoteService::new(key.connection().clone()));
    Arc::new(Connection::new(key.connection().clone(), mock))
}

fn proxy(key: &ObjectKey, connection: &Arc<Connection>) -> Arc<Proxy> {
    Arc::new(Proxy::new(key.clone(), connection.clone()).expect("key belongs to connection"))
}

// ============================================================================
// IDENTITY
// ============================================================================

#[test]
fn test_concurrent_register_yields_one_canonical_proxy() {
    init_test_tracing();
    const THREADS: usize = 16;

    let key = fixtures::vm_key("contended");
    let connection = connection_for(&key);
    let repository = ProxyRepository::new(&fixtures::fast_config());
    let barrier = Barrier::new(THREADS);

    let results: Vec<(Arc<Proxy>, bool)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let candidate = proxy(&key, &connection);
                let repository = &repository;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    repository.register(candidate).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = results.iter().filter(|(_, inserted)| *inserted).count();
    assert_eq!(winners, 1);
    let canonical = &results[0].0;
    assert!(results.iter().all(|(p, _)| Arc::ptr_eq(p, canonical)));
    assert_eq!(repository.len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_register_is_identity_preserving(key in generators::arb_object_key()) {
        let connection = connection_for(&key);
        let repository = ProxyRepository::new(&fixtures::fast_config());

        let (first, inserted) = repository.register(proxy(&key, &connection)).unwrap();
        prop_assert!(inserted);
        let (second, inserted) = repository.register(proxy(&key, &connection)).unwrap();
        prop_assert!(!inserted);
        prop_assert!(Arc::ptr_eq(&first, &second));

        let found = repository.try_get(&key).unwrap().unwrap();
        prop_assert!(Arc::ptr_eq(&first, &found));
        prop_assert_eq!(repository.len(), 1);
    }
}

// ============================================================================
// RESURRECTION
// ============================================================================

#[test]
fn test_collected_entry_is_resurrected_in_place() {
    let key = fixtures::vm_key("ghost");
    let connection = connection_for(&key);
    let repository = ProxyRepository::new(&fixtures::fast_config());

    let (original, _) = repository.register(proxy(&key, &connection)).unwrap();
    repository.demote(&key).unwrap();
    assert_eq!(repository.is_strong(&key).unwrap(), Some(false));
    drop(original);

    // The slot is still present but its proxy is gone.
    assert_eq!(repository.len(), 1);
    assert!(repository.try_get(&key).unwrap().is_none());

    let replacement = proxy(&key, &connection);
    let (canonical, inserted) = repository.register(replacement.clone()).unwrap();
    assert!(inserted);
    assert!(Arc::ptr_eq(&canonical, &replacement));
    assert_eq!(repository.len(), 1);
    assert_eq!(repository.is_strong(&key).unwrap(), Some(true));
}

#[test]
fn test_demoting_a_weak_entry_is_a_usage_error() {
    let key = fixtures::vm_key("weak");
    let connection = connection_for(&key);
    let repository = ProxyRepository::new(&fixtures::fast_config());

    let (_held, _) = repository.register(proxy(&key, &connection)).unwrap();
    repository.demote(&key).unwrap();
    cimcache_test_utils::assertions::assert_usage_error(&repository.demote(&key));
}

// ============================================================================
// SWEEP
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_background_sweep_demotes_then_purges() {
    init_test_tracing();
    let key = fixtures::vm_key("idle");
    let connection = connection_for(&key);
    let repository = Arc::new(ProxyRepository::new(&fixtures::fast_config()));
    repository.start_sweeper().unwrap();

    let (held, _) = repository.register(proxy(&key, &connection)).unwrap();

    // First tick at 60s: not idle long enough yet.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(repository.is_strong(&key).unwrap(), Some(true));

    // Second tick at 120s: idle for more than 90s.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(repository.is_strong(&key).unwrap(), Some(false));

    // A view still holds it, so access promotes it back.
    let promoted = repository.try_get(&key).unwrap().unwrap();
    assert!(Arc::ptr_eq(&held, &promoted));
    assert_eq!(repository.is_strong(&key).unwrap(), Some(true));

    drop(promoted);
    drop(held);

    // Demoted at the 240s tick, purged at 300s.
    tokio::time::sleep(Duration::from_secs(180)).await;
    assert!(repository.is_empty());
    let stats = repository.stats().unwrap();
    assert_eq!(stats.demoted_total, 2);
    assert_eq!(stats.purged_total, 1);

    repository.shutdown();
}
