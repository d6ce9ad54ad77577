use std::{io, net::SocketAddr};

use spark_mux::{ErrorCategory, ErrorClass};
use spark_mux_rpc::ServiceRegistryError;
use thiserror::Error;

/// 分发器生命周期错误。
#[derive(Debug, Error)]
pub enum DispatchError {
    /// 监听地址绑定失败。
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// `start` 被重复调用。
    #[error("dispatcher is already running")]
    AlreadyStarted,
    /// 分发器已经关闭，不能再启动。
    #[error("dispatcher has been shut down")]
    ShutDown,
    /// 服务发布到调用引擎失败。
    #[error("failed to publish service `{name}`: {source}")]
    Publish {
        name: String,
        #[source]
        source: ServiceRegistryError,
    },
}

impl ErrorClass for DispatchError {
    fn code(&self) -> &'static str {
        match self {
            DispatchError::Bind { .. } => "spark.mux.server.bind_failed",
            DispatchError::AlreadyStarted => "spark.mux.server.already_started",
            DispatchError::ShutDown => "spark.mux.server.shut_down",
            DispatchError::Publish { .. } => "spark.mux.server.publish_failed",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::Bind { .. } => ErrorCategory::Transport,
            DispatchError::AlreadyStarted | DispatchError::ShutDown => {
                ErrorCategory::CallerContract
            }
            DispatchError::Publish { .. } => ErrorCategory::Configuration,
        }
    }
}
