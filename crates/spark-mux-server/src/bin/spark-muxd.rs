//! spark-muxd：按配置文件启动单端口多协议分发器。
//!
//! ```bash
//! RUST_LOG=spark=debug spark-muxd /etc/spark/mux.toml
//! ```
//! 未给出配置路径时使用全部默认值（明文、监听 `0.0.0.0:8300`）。收到 Ctrl-C 后停止受理并退出。

use std::{env, sync::Arc};

use anyhow::{Context, Result};
use spark_mux::{MuxConfig, TlsSettings};
use spark_mux_rpc::ServiceRegistry;
use spark_mux_server::Dispatcher;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter())
        .init();

    let config = match env::args().nth(1) {
        Some(path) => MuxConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => MuxConfig::default(),
    };

    let tls = match &config.tls {
        Some(files) => Some(
            TlsSettings::from_files(files)
                .context("loading tls material")?
                .inbound_tls()
                .context("building inbound tls config")?,
        ),
        None => None,
    };

    let dispatcher = Dispatcher::new(
        config.server.clone(),
        tls,
        Arc::new(ServiceRegistry::new()),
        None,
    );
    let addr = dispatcher.start().await.context("starting dispatcher")?;
    info!(%addr, "spark-muxd ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    dispatcher.shutdown().await;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
