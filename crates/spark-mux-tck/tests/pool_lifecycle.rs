//! 连接池的引用计数、驱逐与空闲回收，对端为真实分发器。

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use spark_mux::{PoolSettings, ProtocolId};
use spark_mux_pool::ConnPool;
use spark_mux_tck::{
    harness::{DispatcherSpec, pool_settings},
    mock::serv_mock,
};

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_first_access_dials_once() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .start()
        .await?;
    let pool = Arc::new(ConnPool::new(pool_settings(), None, None));

    let mut tasks = Vec::new();
    for n in 0..16_i64 {
        let pool = Arc::clone(&pool);
        let addr = running.addr;
        tasks.push(tokio::spawn(async move {
            let mut out = 0_i64;
            let outcome = pool
                .call(addr, "REG", "mock.ServMock", &n, Some(&mut out))
                .await;
            outcome.map(|()| out == n)
        }));
    }
    for task in tasks {
        assert!(task.await??);
    }
    assert_eq!(pool.stats().dials, 1);
    assert_eq!(pool.len(), 1);

    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_and_release_in_either_order_close_once() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .start()
        .await?;
    let pool = ConnPool::new(pool_settings(), None, None);
    let reg = ProtocolId::registered();

    // 先驱逐、后归还。
    let hold = pool.acquire(running.addr, &reg).await?;
    let first = Arc::clone(hold.conn());
    assert!(pool.shutdown(&first));
    assert!(!first.is_closed());
    assert!(hold.release());
    assert!(first.is_closed());

    // 先归还、后驱逐。
    let hold = pool.acquire(running.addr, &reg).await?;
    let second = Arc::clone(hold.conn());
    assert!(!Arc::ptr_eq(&first, &second), "a fresh connection is dialed");
    assert!(!hold.release());
    assert!(!second.is_closed());
    assert!(pool.shutdown(&second));
    assert!(second.is_closed());

    // 已被驱逐的连接不会误删池中的新连接。
    let third = Arc::clone(pool.acquire(running.addr, &reg).await?.conn());
    assert!(!pool.shutdown(&first));
    assert_eq!(pool.len(), 1);
    assert!(!third.is_closed());
    assert_eq!(pool.stats().dials, 3);

    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_reaper_spares_recently_used_connections() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .start()
        .await?;
    let settings = PoolSettings {
        idle_timeout_ms: 300,
        reap_interval_ms: 50,
        ..pool_settings()
    };
    let pool = ConnPool::new(settings, None, None);
    let mut out = 0_i64;

    // 使用间隔始终短于空闲阈值。
    for n in 0..6_i64 {
        pool.call(running.addr, "REG", "mock.ServMock", &n, Some(&mut out))
            .await?;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    assert_eq!(pool.stats().dials, 1);
    assert_eq!(pool.stats().evictions, 0);

    let conn = Arc::clone(
        pool.acquire(running.addr, &ProtocolId::registered())
            .await?
            .conn(),
    );
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(pool.is_empty());
    assert!(conn.is_closed());

    pool.call(running.addr, "REG", "mock.ServMock", &7, Some(&mut out))
        .await?;
    assert_eq!(out, 7);
    assert_eq!(pool.stats().dials, 2);

    pool.close().await;
    running.stop().await;
    Ok(())
}
