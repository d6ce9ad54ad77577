//! 服务端分发器：监听、握手分类、派发到协议处理函数。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 所有协议共享一个监听端口；分发器只回答“这条连接属于谁”，之后不再参与连接的生命周期；
//!
//! ## 契约 (What)
//! - `start` 先把服务注册表中的全部服务发布到调用引擎，再绑定监听地址并开始受理；
//! - 每条入站连接在独立任务中完成握手与派发，慢速对端不会阻塞监听循环；
//! - 握手失败、查询失败或处理函数报错都只记录一行日志，套接字随流的丢弃而关闭；
//! - `shutdown` 幂等，停止受理新连接，不打断已派发的处理函数。
//!
//! ## 风险 (Trade-offs)
//! - `accept` 的瞬时错误（如文件描述符耗尽）以固定短退避重试，而不是退出循环；
//! - `start` 之后登记的服务不会被发布。

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rustls::ServerConfig;
use spark_mux::{
    AcceptPolicy, ErrorClass, InboundTls, PeerInfo, ServerSettings, StreamRegistry, handshake,
    tune_stream,
};
use spark_mux_rpc::{RpcServer, ServiceRegistry, SharedCodec, default_codec};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{bridge::RegisteredBridge, error::DispatchError};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 单端口多协议分发器。
pub struct Dispatcher {
    settings: ServerSettings,
    tls: Option<InboundTls>,
    services: Arc<ServiceRegistry>,
    rpc: RpcServer,
    registry: Arc<StreamRegistry>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// 构造分发器。内建协议表中的 `REG` 绑定到本分发器自己的调用引擎。
    ///
    /// `codec` 为 `None` 时使用 [`default_codec`]；出站连接池必须选用同一编码。
    pub fn new(
        settings: ServerSettings,
        tls: Option<InboundTls>,
        services: Arc<ServiceRegistry>,
        codec: Option<SharedCodec>,
    ) -> Self {
        if settings.enforce_secure && tls.is_none() {
            warn!(
                target: "spark::mux::server",
                "enforce_secure has no effect without inbound tls"
            );
        }
        let rpc = RpcServer::with_codec(codec.unwrap_or_else(default_codec));
        let registry = Arc::new(StreamRegistry::with_builtins(Arc::new(
            RegisteredBridge::new(rpc.clone()),
        )));
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            tls,
            services,
            rpc,
            registry,
            local_addr: Mutex::new(None),
            shutdown,
            accept_task: Mutex::new(None),
        }
    }

    /// 本分发器的协议注册表，嵌入方在此登记 `RAFT`、`MESH` 或自定义协议。
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// `REG` 协议背后的调用引擎。
    pub fn rpc_server(&self) -> &RpcServer {
        &self.rpc
    }

    /// 实际绑定的地址；`start` 之前为 `None`。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// 发布服务、绑定监听并启动受理循环，返回实际绑定的地址。
    pub async fn start(&self) -> Result<SocketAddr, DispatchError> {
        if *self.shutdown.borrow() {
            return Err(DispatchError::ShutDown);
        }
        if self.accept_task.lock().is_some() {
            return Err(DispatchError::AlreadyStarted);
        }

        for (name, service) in self.services.entries() {
            match self.rpc.register_name(name.clone(), service) {
                Ok(()) => {}
                // 重复启动前的发布已经生效。
                Err(spark_mux_rpc::ServiceRegistryError::AlreadyRegistered(_)) => {}
                Err(source) => return Err(DispatchError::Publish { name, source }),
            }
        }

        let listener = TcpListener::bind(self.settings.listen_addr)
            .await
            .map_err(|source| DispatchError::Bind {
                addr: self.settings.listen_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| DispatchError::Bind {
                addr: self.settings.listen_addr,
                source,
            })?;

        let policy = Arc::new(AcceptPolicy {
            read_timeout: self.settings.handshake_timeout(),
            enforce_secure: self.settings.enforce_secure,
            tls: self.tls.clone(),
        });
        let mut slot = self.accept_task.lock();
        if slot.is_some() {
            return Err(DispatchError::AlreadyStarted);
        }
        *slot = Some(tokio::spawn(accept_loop(
            listener,
            policy,
            Arc::clone(&self.registry),
            self.shutdown.subscribe(),
        )));
        *self.local_addr.lock() = Some(local_addr);

        info!(
            target: "spark::mux::server",
            addr = %local_addr,
            services = ?self.rpc.service_names(),
            protocols = ?self.registry.protocols(spark_mux::MuxVersion::CURRENT),
            tls = self.tls.is_some(),
            enforce_secure = self.settings.enforce_secure,
            "mux dispatcher listening"
        );
        Ok(local_addr)
    }

    /// 停止受理新连接并等待受理循环退出。可重复调用。
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!(target: "spark::mux::server", "mux dispatcher stopped");
        }
    }

    /// 替换入站 TLS 配置，只影响之后的升级握手。未配置 TLS 时返回 `None`。
    pub fn replace_tls(&self, next: Arc<ServerConfig>) -> Option<Arc<ServerConfig>> {
        self.tls.as_ref().map(|tls| tls.replace(next))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("local_addr", &self.local_addr())
            .field("tls", &self.tls.is_some())
            .field("rpc", &self.rpc)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    policy: Arc<AcceptPolicy>,
    registry: Arc<StreamRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    tokio::spawn(classify(
                        stream,
                        remote_addr,
                        Arc::clone(&policy),
                        Arc::clone(&registry),
                    ));
                }
                Err(err) => {
                    warn!(target: "spark::mux::server", error = %err, "accept failed");
                    if backoff_or_stop(&mut shutdown, ACCEPT_BACKOFF).await {
                        break;
                    }
                }
            }
        }
    }
}

/// 退避 `pause`；期间收到停止信号时立即返回 `true`。
async fn backoff_or_stop(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn classify(
    stream: TcpStream,
    remote_addr: SocketAddr,
    policy: Arc<AcceptPolicy>,
    registry: Arc<StreamRegistry>,
) {
    let Ok(local_addr) = stream.local_addr() else {
        return;
    };
    if let Err(err) = tune_stream(&stream) {
        debug!(target: "spark::mux::server", peer = %remote_addr, error = %err, "socket tuning failed");
    }

    let classified = match handshake::accept(stream, &policy).await {
        Ok(classified) => classified,
        Err(err) => {
            warn!(
                target: "spark::mux::server",
                peer = %remote_addr,
                code = err.code(),
                error = %err,
                "handshake rejected"
            );
            return;
        }
    };

    let handler = match registry.lookup(classified.version, classified.protocol.as_str()) {
        Ok(handler) => handler,
        Err(err) => {
            warn!(
                target: "spark::mux::server",
                peer = %remote_addr,
                code = err.code(),
                error = %err,
                "no handler for stream"
            );
            return;
        }
    };

    let peer = PeerInfo {
        remote_addr,
        local_addr,
        version: classified.version,
        protocol: classified.protocol,
        secured: classified.secured,
    };
    debug!(
        target: "spark::mux::server",
        peer = %remote_addr,
        protocol = %peer.protocol,
        version = %peer.version,
        secured = peer.secured,
        "stream dispatched"
    );
    let protocol = peer.protocol.clone();
    if let Err(err) = handler.serve(classified.stream, peer).await {
        warn!(
            target: "spark::mux::server",
            peer = %remote_addr,
            protocol = %protocol,
            error = %err,
            "stream handler failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_mux::{
        BoxedStream, HandlerError, MuxVersion, ProtocolId, StreamProtocol, handler_fn,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn settings() -> ServerSettings {
        ServerSettings {
            listen_addr: "127.0.0.1:0".parse().expect("addr"),
            enforce_secure: false,
            handshake_timeout_ms: 500,
        }
    }

    fn bare_dispatcher() -> Dispatcher {
        Dispatcher::new(settings(), None, Arc::new(ServiceRegistry::new()), None)
    }

    async fn connect(dispatcher: &Dispatcher, protocol: &str) -> BoxedStream {
        let addr = dispatcher.local_addr().expect("started");
        let stream = TcpStream::connect(addr).await.expect("connect");
        handshake::dial(
            stream,
            MuxVersion::V2,
            &ProtocolId::new(protocol).expect("id"),
            None,
        )
        .await
        .expect("dial")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn custom_protocol_owns_its_connection() {
        let dispatcher = bare_dispatcher();
        let echo = handler_fn(|stream: BoxedStream, _peer: PeerInfo| async move {
            let (mut rd, mut wr) = tokio::io::split(stream);
            tokio::io::copy(&mut rd, &mut wr).await?;
            Ok::<(), HandlerError>(())
        });
        dispatcher
            .registry()
            .register(
                MuxVersion::V2,
                StreamProtocol::builder("echo").handler(echo).build().expect("build"),
            )
            .expect("register");
        dispatcher.start().await.expect("start");

        let mut stream = connect(&dispatcher, "ECHO").await;
        stream.write_all(b"hello").await.expect("write");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");

        dispatcher.shutdown().await;
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_protocol_is_closed() {
        let dispatcher = bare_dispatcher();
        dispatcher.start().await.expect("start");

        let mut stream = connect(&dispatcher, "BOGUS").await;
        let mut buf = [0u8; 1];
        let read = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(read, 0, "server must close the socket");
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lifecycle_errors() {
        let dispatcher = bare_dispatcher();
        assert!(dispatcher.local_addr().is_none());
        dispatcher.start().await.expect("start");
        assert!(matches!(
            dispatcher.start().await,
            Err(DispatchError::AlreadyStarted)
        ));
        dispatcher.shutdown().await;
        assert!(matches!(dispatcher.start().await, Err(DispatchError::ShutDown)));
        assert!(dispatcher.replace_tls(Arc::new(placeholder_config())).is_none());
    }

    fn placeholder_config() -> ServerConfig {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("versions")
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn occupied_address_fails_to_bind() {
        let first = bare_dispatcher();
        let addr = first.start().await.expect("start");
        let second = Dispatcher::new(
            ServerSettings {
                listen_addr: addr,
                ..settings()
            },
            None,
            Arc::new(ServiceRegistry::new()),
            None,
        );
        let err = second.start().await.expect_err("address in use");
        assert_eq!(err.code(), "spark.mux.server.bind_failed");
        first.shutdown().await;
    }

    #[tokio::test]
    async fn accept_backoff_yields_to_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiting = tokio::spawn(async move {
            backoff_or_stop(&mut rx, Duration::from_secs(60)).await
        });
        tx.send_replace(true);
        let stopped = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("backoff must not outlive shutdown")
            .expect("join");
        assert!(stopped);

        let (_tx, mut rx) = watch::channel(false);
        assert!(!backoff_or_stop(&mut rx, Duration::from_millis(10)).await);
    }
}
