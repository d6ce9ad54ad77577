//! 场景装配。

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use spark_mux::{InboundTls, MuxVersion, PoolSettings, ServerSettings};
use spark_mux_rpc::{ServiceRegistry, SharedCodec, SharedService};
use spark_mux_server::Dispatcher;

/// 监听在回环随机端口上的分发器。
pub struct RunningDispatcher {
    pub dispatcher: Dispatcher,
    pub addr: SocketAddr,
}

impl RunningDispatcher {
    pub async fn stop(&self) {
        self.dispatcher.shutdown().await;
    }
}

/// 分发器的场景参数。
#[derive(Default)]
pub struct DispatcherSpec {
    pub services: Vec<(&'static str, SharedService)>,
    pub tls: Option<InboundTls>,
    pub enforce_secure: bool,
    pub codec: Option<SharedCodec>,
}

impl DispatcherSpec {
    pub fn with_service(mut self, name: &'static str, service: SharedService) -> Self {
        self.services.push((name, service));
        self
    }

    pub fn with_tls(mut self, tls: InboundTls, enforce_secure: bool) -> Self {
        self.tls = Some(tls);
        self.enforce_secure = enforce_secure;
        self
    }

    pub fn with_codec(mut self, codec: SharedCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// 登记服务并启动分发器。
    pub async fn start(self) -> Result<RunningDispatcher> {
        let services = Arc::new(ServiceRegistry::new());
        for (name, service) in self.services {
            services
                .register(name, service)
                .with_context(|| format!("registering {name}"))?;
        }
        let settings = ServerSettings {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            enforce_secure: self.enforce_secure,
            handshake_timeout_ms: 2_000,
        };
        let dispatcher = Dispatcher::new(settings, self.tls, services, self.codec);
        let addr = dispatcher.start().await.context("starting dispatcher")?;
        Ok(RunningDispatcher { dispatcher, addr })
    }
}

/// 场景中使用的连接池设置：短拨号超时，默认不回收。
pub fn pool_settings() -> PoolSettings {
    PoolSettings {
        dial_timeout_ms: 2_000,
        ..PoolSettings::default()
    }
}

/// 指定版本的连接池设置。
pub fn pool_settings_for(version: MuxVersion) -> PoolSettings {
    PoolSettings {
        version,
        ..pool_settings()
    }
}
