/// Session pool tests
///
/// Leasing, limits, closing and background upkeep against the in-memory service
/// Run with: cargo test --test session_pool_tests

use rustspan::rpc::memory::{MemoryDatabase, Method};
use rustspan::{DbError, PoolConfig, SessionKind, SessionPool};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn service() -> Arc<MemoryDatabase> {
    Arc::new(MemoryDatabase::new(
        "projects/test/instances/local/databases/pool".parse().unwrap(),
    ))
}

#[tokio::test]
async fn test_lease_is_exclusive_under_concurrency() {
    let rpc = service();
    let pool = Arc::new(
        SessionPool::open(rpc.clone(), PoolConfig::new().min_sessions(1).max_sessions(3))
            .await
            .unwrap(),
    );
    let in_use: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = vec![];
    for task_id in 0..20 {
        let pool = Arc::clone(&pool);
        let in_use = Arc::clone(&in_use);
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
                let name = lease.name().to_string();
                assert!(
                    in_use.lock().unwrap().insert(name.clone()),
                    "task {} got session {} while it was leased",
                    task_id,
                    name
                );
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_use.lock().unwrap().remove(&name);
                drop(lease);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.stats();
    assert!(stats.total_sessions <= 3);
    assert_eq!(stats.leased_sessions, 0);
    assert!(rpc.call_count(Method::CreateSession) <= 3);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let pool = SessionPool::open(
        service(),
        PoolConfig::new()
            .min_sessions(0)
            .max_sessions(1)
            .acquire_timeout(Duration::from_millis(10)),
    )
    .await
    .unwrap();

    let held = pool.acquire(SessionKind::Dedicated).await.unwrap();
    let err = pool.acquire(SessionKind::Dedicated).await.unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted(_)));

    drop(held);
    let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
    assert_eq!(pool.stats().total_sessions, 1);
    drop(lease);
}

#[tokio::test]
async fn test_waiters_are_served_when_a_lease_returns() {
    let pool = Arc::new(
        SessionPool::open(service(), PoolConfig::new().min_sessions(1).max_sessions(1))
            .await
            .unwrap(),
    );
    let held = pool.acquire(SessionKind::Dedicated).await.unwrap();
    let first = held.name().clone();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
            lease.name().clone()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(held);
    assert_eq!(waiter.await.unwrap(), first);
}

#[tokio::test]
async fn test_close_fails_queued_acquires() {
    let rpc = service();
    let pool = Arc::new(
        SessionPool::open(
            rpc.clone(),
            PoolConfig::new().min_sessions(1).max_sessions(1).wait_forever(),
        )
        .await
        .unwrap(),
    );
    let held = pool.acquire(SessionKind::Dedicated).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(SessionKind::Dedicated).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = pool.close().await;
    assert!(stats.closed);
    assert_eq!(stats.leased_sessions, 1);
    assert!(matches!(waiter.await.unwrap(), Err(DbError::PoolClosed)));

    // The outstanding session is deleted once its lease comes back.
    drop(held);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rpc.session_count(), 0);
    assert_eq!(pool.stats().total_sessions, 0);
}

#[tokio::test]
async fn test_maintenance_evicts_stale_idle_sessions() {
    let rpc = service();
    let pool = SessionPool::open(
        rpc.clone(),
        PoolConfig::new()
            .min_sessions(1)
            .max_sessions(5)
            .max_idle(0)
            .idle_timeout(Duration::ZERO),
    )
    .await
    .unwrap();

    let leases: Vec<_> = {
        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(pool.acquire(SessionKind::Dedicated).await.unwrap());
        }
        leases
    };
    drop(leases);
    assert_eq!(pool.stats().idle_sessions, 4);

    pool.run_maintenance().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = pool.stats();
    assert_eq!(stats.total_sessions, 1, "never shrinks below min_sessions");
    assert_eq!(rpc.session_count(), 1);
}

#[tokio::test]
async fn test_keep_alive_replaces_dead_sessions() {
    let rpc = service();
    let pool = SessionPool::open(
        rpc.clone(),
        PoolConfig::new()
            .min_sessions(2)
            .max_sessions(4)
            .keep_alive_interval(Duration::ZERO),
    )
    .await
    .unwrap();
    assert_eq!(rpc.call_count(Method::CreateSession), 2);

    let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
    let dead = lease.name().clone();
    drop(lease);
    rpc.expire_session(&dead);

    pool.run_maintenance().await;

    assert_eq!(rpc.call_count(Method::ExecuteStreamingSql), 2);
    assert_eq!(rpc.call_count(Method::CreateSession), 3);
    let stats = pool.stats();
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.idle_sessions, 2);

    let first = pool.acquire(SessionKind::Dedicated).await.unwrap();
    let second = pool.acquire(SessionKind::Dedicated).await.unwrap();
    assert_ne!(first.name(), &dead);
    assert_ne!(second.name(), &dead);
    assert_ne!(first.name(), second.name());
}

#[tokio::test]
async fn test_multiplexed_refresh_swaps_handle() {
    let rpc = service();
    let pool = SessionPool::open(
        rpc.clone(),
        PoolConfig::new()
            .min_sessions(0)
            .multiplexed_refresh(Duration::ZERO),
    )
    .await
    .unwrap();

    let old = pool.acquire(SessionKind::Multiplexed).await.unwrap();
    let old_name = old.name().clone();

    pool.run_maintenance().await;

    let fresh = pool.acquire(SessionKind::Multiplexed).await.unwrap();
    assert_ne!(fresh.name(), &old_name);
    assert_eq!(old.name(), &old_name, "existing holders keep their handle");
    assert_eq!(rpc.call_count(Method::CreateSession), 2);
    assert_eq!(pool.stats().total_sessions, 0);
}

#[tokio::test]
async fn test_invalidated_session_is_not_reused() {
    let rpc = service();
    let pool = SessionPool::open(rpc.clone(), PoolConfig::new().min_sessions(1).max_sessions(1))
        .await
        .unwrap();

    let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
    let broken = lease.name().clone();
    rpc.expire_session(&broken);
    pool.invalidate(lease, "session expired");

    let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
    assert_ne!(lease.name(), &broken);
    assert_eq!(pool.stats().total_sessions, 1);
}

#[tokio::test]
async fn test_open_fails_when_database_is_missing() {
    let rpc = service();
    rpc.set_database_missing(true);

    let err = SessionPool::open(rpc.clone(), PoolConfig::new().min_sessions(2))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DatabaseNotFound(_)));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let err = SessionPool::open(service(), PoolConfig::new().min_sessions(5).max_sessions(2))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidConfig(_)));
}
