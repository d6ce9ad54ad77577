//! `REG` 协议上的端到端调用：分发器 + 调用引擎 + 连接池。

use std::sync::Arc;

use anyhow::Result;
use spark_mux::{ErrorClass, MuxVersion};
use spark_mux_pool::{ConnPool, PoolError};
use spark_mux_rpc::{LineDelimitedJson, RpcError};
use spark_mux_tck::{
    harness::{DispatcherSpec, pool_settings, pool_settings_for},
    mock::{failing_mock, serv_mock},
};

#[tokio::test(flavor = "multi_thread")]
async fn serv_mock_round_trips_and_bogus_is_rejected() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .with_service("fock", serv_mock())
        .with_service("sock", serv_mock())
        .start()
        .await?;
    let pool = ConnPool::new(pool_settings(), None, None);

    let err = pool
        .call::<_, i64>(running.addr, "REG", "mock.ServMock", &42, None)
        .await
        .expect_err("reply target is required");
    assert!(matches!(err, PoolError::MissingReplyTarget));
    assert_eq!(pool.stats().dials, 0);

    let mut out = 0_i64;
    let mut input = 42_i64;
    let err = pool
        .call(running.addr, "BOGUS", "mock.ServMock", &input, Some(&mut out))
        .await
        .expect_err("BOGUS is not registered");
    assert!(
        matches!(err, PoolError::ProtocolRejected { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(err.code(), "spark.mux.pool.protocol_rejected");

    pool.call(running.addr, "REG", "mock.ServMock", &input, Some(&mut out))
        .await?;
    assert_eq!(out, 42);

    input *= input;
    pool.call(running.addr, "REG", "fock.ServMock", &input, Some(&mut out))
        .await?;
    assert_eq!(out, input);

    input *= input;
    pool.call(running.addr, "REG", "sock.ServMock", &input, Some(&mut out))
        .await?;
    assert_eq!(out, input);

    // BOGUS 一次，REG 一次；后续调用复用同一条连接。
    let stats = pool.stats();
    assert_eq!(stats.dials, 2);
    assert_eq!(stats.live, 1);

    pool.close().await;
    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fixed_byte_version_reaches_the_same_services() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .start()
        .await?;
    let pool = ConnPool::new(pool_settings_for(MuxVersion::V1), None, None);

    let mut out = 0_i64;
    pool.call(running.addr, "REG", "mock.ServMock", &7, Some(&mut out))
        .await?;
    assert_eq!(out, 7);

    let err = pool
        .call(running.addr, "BOGUS", "mock.ServMock", &7, Some(&mut out))
        .await
        .expect_err("V1 cannot carry BOGUS");
    assert!(
        matches!(err, PoolError::Handshake { .. }),
        "unexpected error: {err}"
    );
    // 握手在拨号阶段失败，不影响已池化的 REG 连接。
    assert_eq!(pool.len(), 1);
    pool.call(running.addr, "REG", "mock.ServMock", &8, Some(&mut out))
        .await?;
    assert_eq!(out, 8);
    assert_eq!(pool.stats().dials, 1);

    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_failures_evict_the_connection() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", failing_mock())
        .start()
        .await?;
    let pool = ConnPool::new(pool_settings(), None, None);

    let mut unit = ();
    let err = pool
        .call(running.addr, "REG", "mock.Fail", &(), Some(&mut unit))
        .await
        .expect_err("Fail always fails");
    assert!(matches!(
        err,
        PoolError::Call {
            source: RpcError::Remote(_),
            ..
        }
    ));
    assert!(pool.is_empty());

    let mut out = 0_i64;
    let err = pool
        .call(running.addr, "REG", "nosuch.ServMock", &1, Some(&mut out))
        .await
        .expect_err("unknown service");
    assert!(matches!(err, PoolError::Call { .. }));

    pool.call(running.addr, "REG", "mock.ServMock", &3, Some(&mut out))
        .await?;
    assert_eq!(out, 3);
    assert_eq!(pool.stats().dials, 3);
    assert_eq!(pool.stats().evictions, 2);

    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn go_calls_keep_their_hold_until_the_reply() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .start()
        .await?;
    let pool = ConnPool::new(pool_settings(), None, None);

    let mut calls = Vec::new();
    for n in 0..4_i64 {
        calls.push((n, pool.go::<_, i64>(running.addr, "REG", "mock.ServMock", &n).await));
    }
    let conn = calls
        .first()
        .and_then(|(_, (_, hold))| hold.as_ref())
        .map(|hold| Arc::clone(hold.conn()))
        .expect("first call issued");
    assert_eq!(conn.ref_count(), 5);

    for (n, (pending, hold)) in calls {
        assert_eq!(pending.wait().await?, n);
        drop(hold);
    }
    assert_eq!(conn.ref_count(), 1);
    assert_eq!(pool.stats().dials, 1);

    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_dispatcher_refuses_new_dials() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .start()
        .await?;
    let addr = running.addr;
    running.stop().await;
    drop(running);

    let pool = ConnPool::new(pool_settings(), None, None);
    let mut out = 0_i64;
    let err = pool
        .call(addr, "REG", "mock.ServMock", &1, Some(&mut out))
        .await
        .expect_err("listener closed");
    assert!(err.is_no_client(), "unexpected error: {err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn line_delimited_codec_carries_calls_end_to_end() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .with_codec(Arc::new(LineDelimitedJson))
        .start()
        .await?;
    let pool = ConnPool::new(pool_settings(), None, Some(Arc::new(LineDelimitedJson)));

    let mut out = 0_i64;
    pool.call(running.addr, "REG", "mock.ServMock", &11, Some(&mut out))
        .await?;
    assert_eq!(out, 11);
    pool.call(running.addr, "REG", "mock.ServMock", &12, Some(&mut out))
        .await?;
    assert_eq!(out, 12);
    assert_eq!(pool.stats().dials, 1);

    pool.close().await;
    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn codec_mismatch_surfaces_as_protocol_rejection() -> Result<()> {
    let running = DispatcherSpec::default()
        .with_service("mock", serv_mock())
        .start()
        .await?;
    // 行分隔帧的前 4 字节被默认编码读作超限长度，服务端随即关闭连接。
    let pool = ConnPool::new(pool_settings(), None, Some(Arc::new(LineDelimitedJson)));

    let mut out = 0_i64;
    let err = pool
        .call(running.addr, "REG", "mock.ServMock", &1, Some(&mut out))
        .await
        .expect_err("codecs disagree");
    assert!(
        matches!(err, PoolError::ProtocolRejected { .. }),
        "unexpected error: {err}"
    );
    assert!(pool.is_empty());

    running.stop().await;
    Ok(())
}
