//! 出站连接池。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 每次调用都新建 TCP（以及可能的 TLS）连接代价过高；池按 `地址/协议` 缓存一条连接，
//!   同步与异步调用都复用它；
//!
//! ## 契约 (What)
//! - 每个键至多一条存活连接；同一键上并发的首次访问经由按键的拨号闸门只拨号一次，
//!   若仍出现插入竞争，后到者丢弃自己的套接字并共享先到者的连接；
//! - 调用级错误一律驱逐并关闭承载它的连接，下一次访问重新拨号；
//! - 空闲回收由单个后台任务按固定周期执行，`idle_timeout` 为零时不启动；
//! - 池内锁只保护内存操作，从不跨越网络 IO。
//!
//! ## 风险 (Trade-offs)
//! - 被驱逐但仍被持有的连接在最后一个持有者归还时才物理关闭，期间它已不在池中；
//! - 异步调用的失败只有在发出阶段才会触发驱逐，应答阶段的失败交由调用方处理。

use std::{
    collections::HashMap,
    fmt,
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use spark_mux::{ClientTls, PoolSettings, ProtocolId, handshake, tune_stream};
use spark_mux_rpc::{PendingReply, RpcClient, RpcError, SharedCodec, default_codec};
use tokio::{net::TcpStream, sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{
    conn::{Conn, ConnHold, pool_key},
    error::PoolError,
};

type DialGate = Arc<tokio::sync::Mutex<()>>;

/// 连接池的计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 累计完成的物理拨号次数（含竞争中被丢弃的连接）。
    pub dials: u64,
    /// 累计驱逐次数（调用失败、空闲回收与关闭池）。
    pub evictions: u64,
    /// 当前池中的连接数。
    pub live: usize,
}

struct PoolInner {
    settings: PoolSettings,
    tls: Option<ClientTls>,
    codec: SharedCodec,
    conns: Mutex<HashMap<String, Arc<Conn>>>,
    gates: Mutex<HashMap<String, DialGate>>,
    dials: AtomicU64,
    evictions: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    /// 命中则增加持有；命中已被对端关闭的连接时先驱逐，视为未命中。
    fn lookup(&self, key: &str) -> Option<ConnHold> {
        let stale = {
            let conns = self.conns.lock();
            let conn = conns.get(key)?;
            if !conn.client().is_closed() {
                return Some(conn.hold());
            }
            Arc::clone(conn)
        };
        self.evict(&stale, "peer closed");
        None
    }

    /// 插入新连接；若已有连接则丢弃新连接并共享已有的。
    ///
    /// `closed` 在 `conns` 锁内复查：`close` 先置位再排空，拨号期间关闭的池不会再收下连接。
    fn insert(&self, conn: Conn) -> Result<ConnHold, PoolError> {
        let mut conns = self.conns.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(conns);
            debug!(target: "spark::mux::pool", key = %conn.key(), "pool closed during dial, dropping connection");
            conn.close();
            return Err(PoolError::Closed);
        }
        if let Some(existing) = conns.get(conn.key()) {
            debug!(target: "spark::mux::pool", key = %conn.key(), "lost insert race, sharing existing connection");
            conn.close();
            return Ok(existing.hold());
        }
        let conn = Arc::new(conn);
        let hold = conn.hold();
        conns.insert(conn.key().to_owned(), conn);
        Ok(hold)
    }

    /// 仅当池中仍指向同一连接时移除它，并释放池的隐式持有。
    fn evict(&self, conn: &Arc<Conn>, reason: &'static str) -> bool {
        let removed = {
            let mut conns = self.conns.lock();
            match conns.get(conn.key()) {
                Some(current) if Arc::ptr_eq(current, conn) => conns.remove(conn.key()),
                _ => None,
            }
        };
        let Some(conn) = removed else {
            return false;
        };
        self.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(target: "spark::mux::pool", key = %conn.key(), reason, refs = conn.ref_count(), "connection evicted");
        conn.mark_shutdown();
        conn.release();
        true
    }

    fn reap(&self) -> usize {
        let idle = self.settings.idle_timeout();
        let mut expired = Vec::new();
        self.conns.lock().retain(|_, conn| {
            if conn.idle_for() >= idle {
                expired.push(Arc::clone(conn));
                false
            } else {
                true
            }
        });
        for conn in &expired {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(target: "spark::mux::pool", key = %conn.key(), refs = conn.ref_count(), "idle connection reaped");
            conn.mark_shutdown();
            conn.release();
        }
        expired.len()
    }

    async fn dial(
        &self,
        addr: SocketAddr,
        protocol: &ProtocolId,
        key: &str,
    ) -> Result<Conn, PoolError> {
        let limit = self.settings.dial_timeout();
        let connect = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| PoolError::Dial {
                    key: key.to_owned(),
                    source,
                })?;
            if let Err(err) = tune_stream(&stream) {
                debug!(target: "spark::mux::pool", key, error = %err, "socket tuning failed");
            }
            handshake::dial(stream, self.settings.version, protocol, self.tls.as_ref())
                .await
                .map_err(|source| PoolError::Handshake {
                    key: key.to_owned(),
                    source,
                })
        };
        let stream = tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| PoolError::DialTimeout {
                key: key.to_owned(),
                limit,
            })??;
        self.dials.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "spark::mux::pool",
            key,
            version = %self.settings.version,
            tls = self.tls.is_some(),
            codec = self.codec.name(),
            "dialed pooled connection"
        );
        let client = RpcClient::with_codec(stream, Arc::clone(&self.codec));
        Ok(Conn::new(addr, protocol.clone(), client))
    }
}

/// 按 (地址, 协议) 复用出站连接的连接池。
pub struct ConnPool {
    inner: Arc<PoolInner>,
    shutdown: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnPool {
    /// 创建连接池。`idle_timeout` 非零时启动回收任务，因此需在 Tokio 运行时内调用。
    ///
    /// `codec` 为 `None` 时使用 [`default_codec`]，必须与对端分发器的编码一致。
    pub fn new(
        settings: PoolSettings,
        tls: Option<ClientTls>,
        codec: Option<SharedCodec>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            settings,
            tls,
            codec: codec.unwrap_or_else(default_codec),
            conns: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            dials: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let (shutdown, _) = watch::channel(false);
        let reaper = (!inner.settings.idle_timeout().is_zero())
            .then(|| tokio::spawn(reap_loop(Arc::clone(&inner), shutdown.subscribe())));
        Self {
            inner,
            shutdown,
            reaper: Mutex::new(reaper),
        }
    }

    /// 取得 `(addr, protocol)` 的连接持有，必要时拨号。
    pub async fn acquire(
        &self,
        addr: SocketAddr,
        protocol: &ProtocolId,
    ) -> Result<ConnHold, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let key = pool_key(addr, protocol);
        if let Some(hold) = self.inner.lookup(&key) {
            return Ok(hold);
        }

        let gate = Arc::clone(self.inner.gates.lock().entry(key.clone()).or_default());
        let _turn = gate.lock().await;
        if let Some(hold) = self.inner.lookup(&key) {
            return Ok(hold);
        }
        let dialed = self.inner.dial(addr, protocol, &key).await;
        let hold = dialed.and_then(|conn| self.inner.insert(conn));
        {
            let mut gates = self.inner.gates.lock();
            if gates.get(&key).is_some_and(|current| Arc::ptr_eq(current, &gate)) {
                gates.remove(&key);
            }
        }
        hold
    }

    /// 同步调用。
    ///
    /// # 契约 (What)
    /// - `reply` 为 `None` 时在任何网络活动之前返回 [`PoolError::MissingReplyTarget`]；
    /// - 成功时把应答写入 `reply`；
    /// - 调用失败时驱逐连接；新建连接在给出任何应答前被关闭时返回 [`PoolError::ProtocolRejected`]；
    /// - 返回前归还本次持有。
    pub async fn call<A, R>(
        &self,
        addr: SocketAddr,
        protocol: &str,
        method: &str,
        args: &A,
        reply: Option<&mut R>,
    ) -> Result<(), PoolError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = reply.ok_or(PoolError::MissingReplyTarget)?;
        let protocol = ProtocolId::new(protocol).map_err(PoolError::InvalidProtocol)?;
        let hold = self.acquire(addr, &protocol).await?;
        match hold.client().call::<A, R>(method, args).await {
            Ok(value) => {
                *reply = value;
                Ok(())
            }
            Err(source) => {
                let err = classify_failure(&hold, source);
                self.inner.evict(hold.conn(), "call failed");
                Err(err)
            }
        }
    }

    /// 异步调用：发出请求后立即返回。
    ///
    /// 发出成功时返回的 [`ConnHold`] 交给调用方，应答取回后再归还；发出失败时连接被驱逐，
    /// 返回携带错误的 [`PendingCall`] 且不返回持有。
    pub async fn go<A, R>(
        &self,
        addr: SocketAddr,
        protocol: &str,
        method: &str,
        args: &A,
    ) -> (PendingCall<R>, Option<ConnHold>)
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let protocol = match ProtocolId::new(protocol) {
            Ok(protocol) => protocol,
            Err(err) => return (PendingCall::failed(PoolError::InvalidProtocol(err)), None),
        };
        let hold = match self.acquire(addr, &protocol).await {
            Ok(hold) => hold,
            Err(err) => return (PendingCall::failed(err), None),
        };
        match hold.client().invoke(method, args) {
            Ok(reply) => (
                PendingCall {
                    state: PendingState::Waiting {
                        reply,
                        key: hold.key().to_owned(),
                    },
                    _reply: PhantomData,
                },
                Some(hold),
            ),
            Err(source) => {
                let err = classify_failure(&hold, source);
                self.inner.evict(hold.conn(), "call failed");
                (PendingCall::failed(err), None)
            }
        }
    }

    /// 驱逐指定连接：仅当池中仍指向它时移除，标记关闭并释放池的持有。
    pub fn shutdown(&self, conn: &Arc<Conn>) -> bool {
        self.inner.evict(conn, "shutdown requested")
    }

    /// 立即执行一轮空闲回收，返回回收数量。
    pub fn reap_idle(&self) -> usize {
        if self.inner.settings.idle_timeout().is_zero() {
            return 0;
        }
        self.inner.reap()
    }

    /// 停止回收任务并驱逐全部连接；仍被持有的连接在归还后关闭。可重复调用。
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        let drained: Vec<Arc<Conn>> = self.inner.conns.lock().values().cloned().collect();
        for conn in &drained {
            self.inner.evict(conn, "pool closed");
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dials: self.inner.dials.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            live: self.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("settings", &self.inner.settings)
            .field("codec", &self.inner.codec.name())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn classify_failure(hold: &ConnHold, source: RpcError) -> PoolError {
    let key = hold.key().to_owned();
    let closed_early = matches!(source, RpcError::ConnectionClosed | RpcError::Io(_));
    if closed_early && !hold.client().has_received_reply() {
        PoolError::ProtocolRejected { key }
    } else {
        PoolError::Call { key, source }
    }
}

async fn reap_loop(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.settings.reap_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // `interval` 的首个 tick 立即完成。
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.reap();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

enum PendingState {
    Failed(PoolError),
    Waiting { reply: PendingReply, key: String },
}

/// 异步调用的结果句柄。
#[must_use = "a PendingCall does nothing unless waited on"]
pub struct PendingCall<R> {
    state: PendingState,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> PendingCall<R> {
    fn failed(err: PoolError) -> Self {
        Self {
            state: PendingState::Failed(err),
            _reply: PhantomData,
        }
    }

    /// 发出阶段是否已经失败。
    pub fn is_failed(&self) -> bool {
        matches!(self.state, PendingState::Failed(_))
    }

    /// 等待应答。
    pub async fn wait(self) -> Result<R, PoolError> {
        match self.state {
            PendingState::Failed(err) => Err(err),
            PendingState::Waiting { reply, key } => reply
                .decode::<R>()
                .await
                .map_err(|source| PoolError::Call { key, source }),
        }
    }
}

impl<R> fmt::Debug for PendingCall<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            PendingState::Failed(err) => format!("failed: {err}"),
            PendingState::Waiting { key, .. } => format!("waiting on {key}"),
        };
        f.debug_tuple("PendingCall").field(&state).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use spark_mux::{AcceptPolicy, ErrorClass, protocol::REGISTERED};
    use spark_mux_rpc::{MethodTable, RpcServer, ServiceError};
    use tokio::{
        io::{AsyncReadExt, DuplexStream},
        net::TcpListener,
    };

    use super::*;

    /// 仅对 `REG` 提供调用服务的对端，其它协议握手后直接断开。
    struct Peer {
        addr: SocketAddr,
        accepts: Arc<AtomicUsize>,
        task: JoinHandle<()>,
    }

    impl Peer {
        async fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let addr = listener.local_addr().expect("local addr");
            let server = RpcServer::new();
            let mock = MethodTable::new()
                .method("ServMock", |n: i64| async move { Ok::<_, ServiceError>(n) })
                .method("Fail", |_: ()| async move {
                    Err::<(), _>(ServiceError::failed("deliberate"))
                });
            server.register_name("mock", Arc::new(mock)).expect("register");

            let accepts = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&accepts);
            let task = tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let server = server.clone();
                    tokio::spawn(async move {
                        let Ok(classified) =
                            handshake::accept(stream, &AcceptPolicy::default()).await
                        else {
                            return;
                        };
                        if classified.protocol.as_str() == REGISTERED {
                            let _ = server.serve(classified.stream).await;
                        }
                    });
                }
            });
            Self {
                addr,
                accepts,
                task,
            }
        }

        fn accepts(&self) -> usize {
            self.accepts.load(Ordering::SeqCst)
        }
    }

    impl Drop for Peer {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    /// 以内存管道代替套接字的连接，返回值中的管道另一端可观察关闭。
    fn piped_conn() -> (Conn, DuplexStream) {
        let (client_io, peer_io) = tokio::io::duplex(64);
        let conn = Conn::new(
            "127.0.0.1:8300".parse().expect("addr"),
            ProtocolId::registered(),
            RpcClient::new(client_io),
        );
        (conn, peer_io)
    }

    async fn read_until_closed(peer: &mut DuplexStream) -> usize {
        let mut buf = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .expect("dropped conn must close its stream")
            .expect("read")
    }

    fn settings(idle_ms: u64, reap_ms: u64) -> PoolSettings {
        PoolSettings {
            idle_timeout_ms: idle_ms,
            reap_interval_ms: reap_ms,
            dial_timeout_ms: 2_000,
            ..PoolSettings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_one_dial() {
        let peer = Peer::spawn().await;
        let pool = Arc::new(ConnPool::new(settings(0, 1_000), None, None));

        let calls = (0..8_i64).map(|n| {
            let pool = Arc::clone(&pool);
            let addr = peer.addr;
            tokio::spawn(async move {
                let mut reply = 0_i64;
                let outcome = pool
                    .call(addr, "REG", "mock.ServMock", &n, Some(&mut reply))
                    .await;
                outcome.map(|()| (n, reply))
            })
        });
        for call in calls.collect::<Vec<_>>() {
            let (sent, got) = call.await.expect("join").expect("call");
            assert_eq!(sent, got);
        }

        assert_eq!(peer.accepts(), 1);
        let stats = pool.stats();
        assert_eq!(stats.dials, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_reply_target_fails_before_dialing() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let err = pool
            .call::<_, i64>(peer.addr, "REG", "mock.ServMock", &1, None)
            .await
            .expect_err("no reply target");
        assert!(matches!(err, PoolError::MissingReplyTarget));
        assert_eq!(err.code(), "spark.mux.pool.missing_reply_target");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.accepts(), 0);
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_protocol_reports_rejection() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let mut reply = 0_i64;
        let err = pool
            .call(peer.addr, "BOGUS", "mock.ServMock", &1, Some(&mut reply))
            .await
            .expect_err("peer drops unknown protocols");
        assert!(
            matches!(err, PoolError::ProtocolRejected { ref key } if key.ends_with("/BOGUS")),
            "unexpected error: {err}"
        );
        assert!(pool.is_empty());
        assert_eq!(pool.stats().evictions, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn call_failure_evicts_and_next_call_redials() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let mut reply = serde_json::Value::Null;
        let err = pool
            .call(peer.addr, "REG", "mock.Fail", &(), Some(&mut reply))
            .await
            .expect_err("remote failure");
        assert!(matches!(
            err,
            PoolError::Call {
                source: RpcError::Remote(_),
                ..
            }
        ));
        assert!(pool.is_empty());

        let mut reply = 0_i64;
        pool.call(peer.addr, "REG", "mock.ServMock", &5, Some(&mut reply))
            .await
            .expect("redial");
        assert_eq!(reply, 5);
        assert_eq!(pool.stats().dials, 2);
        assert_eq!(peer.accepts(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn evicting_a_held_conn_defers_close_to_last_release() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let hold = pool
            .acquire(peer.addr, &ProtocolId::registered())
            .await
            .expect("acquire");
        let conn = Arc::clone(hold.conn());
        assert_eq!(conn.ref_count(), 2);

        assert!(pool.shutdown(&conn));
        assert!(!pool.shutdown(&conn), "already evicted");
        assert!(pool.is_empty());
        assert!(conn.is_shutdown());
        assert!(!conn.is_closed());

        let reply: i64 = hold
            .client()
            .call("mock.ServMock", &9)
            .await
            .expect("held conn still usable");
        assert_eq!(reply, 9);

        assert!(hold.release());
        assert!(conn.is_closed());
        assert!(conn.client().is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn go_hands_the_hold_to_the_caller() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let (pending, hold) = pool
            .go::<_, i64>(peer.addr, "REG", "mock.ServMock", &7)
            .await;
        let hold = hold.expect("hold on success");
        assert!(!pending.is_failed());
        assert_eq!(hold.ref_count(), 2);
        assert_eq!(pending.wait().await.expect("reply"), 7);
        drop(hold);
        assert_eq!(pool.stats().live, 1);

        let (pending, hold) = pool
            .go::<_, i64>(peer.addr, "no such protocol", "mock.ServMock", &7)
            .await;
        assert!(hold.is_none());
        assert!(matches!(
            pending.wait().await,
            Err(PoolError::InvalidProtocol(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_connections_are_reaped() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(settings(50, 20), None, None);
        let hold = pool
            .acquire(peer.addr, &ProtocolId::registered())
            .await
            .expect("acquire");
        let conn = Arc::clone(hold.conn());
        drop(hold);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pool.is_empty());
        assert_eq!(pool.stats().evictions, 1);
        assert!(conn.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_idle_timeout_disables_reaping() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(settings(0, 10), None, None);
        let mut reply = 0_i64;
        pool.call(peer.addr, "REG", "mock.ServMock", &1, Some(&mut reply))
            .await
            .expect("call");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.reap_idle(), 0);
        assert_eq!(pool.stats().evictions, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_evicts_everything_and_refuses_new_work() {
        let peer = Peer::spawn().await;
        let pool = ConnPool::new(settings(60_000, 1_000), None, None);
        let conn = {
            let hold = pool
                .acquire(peer.addr, &ProtocolId::registered())
                .await
                .expect("acquire");
            Arc::clone(hold.conn())
        };
        pool.close().await;
        pool.close().await;
        assert!(pool.is_empty());
        assert!(conn.is_closed());

        let err = pool
            .acquire(peer.addr, &ProtocolId::registered())
            .await
            .expect_err("closed pool");
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_dial_is_a_no_client_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let mut reply = 0_i64;
        let err = pool
            .call(addr, "REG", "mock.ServMock", &1, Some(&mut reply))
            .await
            .expect_err("nothing listening");
        assert!(err.is_no_client(), "unexpected error: {err}");
        assert_eq!(pool.stats().dials, 0);
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn losing_an_insert_race_shares_the_first_conn() {
        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let (first, _first_peer) = piped_conn();
        let (second, mut second_peer) = piped_conn();

        let winner = pool.inner.insert(first).expect("first insert");
        let shared = pool.inner.insert(second).expect("second insert");
        assert!(Arc::ptr_eq(winner.conn(), shared.conn()));
        assert_eq!(winner.ref_count(), 3);
        assert_eq!(pool.len(), 1);
        assert!(!winner.client().is_closed());
        assert_eq!(read_until_closed(&mut second_peer).await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conn_dialed_across_close_is_not_pooled() {
        let pool = ConnPool::new(PoolSettings::default(), None, None);
        let (late, mut late_peer) = piped_conn();
        pool.close().await;

        let err = pool.inner.insert(late).expect_err("closed pool");
        assert!(matches!(err, PoolError::Closed));
        assert!(pool.is_empty());
        assert_eq!(read_until_closed(&mut late_peer).await, 0);
    }
}
