//! 调用引擎与服务注册表的错误定义。
//!
//! 错误码遵循 `spark.mux.rpc.<原因>` / `spark.mux.service.<原因>`，分类复用
//! [`spark_mux::ErrorCategory`]，连接池据此判断是否需要驱逐物理连接。

use std::io;

use spark_mux::{ErrorCategory, ErrorClass};
use thiserror::Error;

/// 调用引擎错误。
#[derive(Debug, Error)]
pub enum RpcError {
    /// 底层读写失败。
    #[error("rpc transport failed: {0}")]
    Io(#[from] io::Error),
    /// 帧长度超过上限。
    #[error("rpc frame of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },
    /// 参数或应答无法序列化。
    #[error("failed to encode rpc payload: {0}")]
    Encode(#[source] serde_json::Error),
    /// 帧内容无法解析为期望的类型。
    #[error("failed to decode rpc payload: {0}")]
    Decode(#[source] serde_json::Error),
    /// 远端处理失败，携带远端给出的描述。
    #[error("remote call failed: {0}")]
    Remote(String),
    /// 对端在应答到达之前关闭了连接。
    #[error("connection closed before the reply arrived")]
    ConnectionClosed,
    /// 本端客户端已关闭。
    #[error("rpc client is shut down")]
    Shutdown,
}

impl ErrorClass for RpcError {
    fn code(&self) -> &'static str {
        match self {
            RpcError::Io(_) => "spark.mux.rpc.io_failed",
            RpcError::FrameTooLarge { .. } => "spark.mux.rpc.frame_too_large",
            RpcError::Encode(_) => "spark.mux.rpc.encode_failed",
            RpcError::Decode(_) => "spark.mux.rpc.decode_failed",
            RpcError::Remote(_) => "spark.mux.rpc.remote_failed",
            RpcError::ConnectionClosed => "spark.mux.rpc.connection_closed",
            RpcError::Shutdown => "spark.mux.rpc.shutdown",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            RpcError::Io(err) if err.kind() == io::ErrorKind::TimedOut => ErrorCategory::Timeout,
            RpcError::Io(_) | RpcError::ConnectionClosed | RpcError::Shutdown => {
                ErrorCategory::Transport
            }
            RpcError::FrameTooLarge { .. } | RpcError::Decode(_) => ErrorCategory::ProtocolMismatch,
            RpcError::Encode(_) => ErrorCategory::CallerContract,
            RpcError::Remote(_) => ErrorCategory::CallFailed,
        }
    }
}

/// 服务方法返回的错误，经序列化后作为 [`RpcError::Remote`] 送达调用方。
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("invalid params: {0}")]
    InvalidParams(#[source] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

impl ServiceError {
    /// 以任意描述构造业务失败。
    pub fn failed(reason: impl Into<String>) -> Self {
        ServiceError::Failed(reason.into())
    }
}

/// 服务注册表错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceRegistryError {
    /// 服务对象没有任何可调用的方法。
    #[error("service object exposes no methods")]
    MissingObject,
    /// 服务名称为空。
    #[error("service needs a name")]
    MissingName,
    /// 同名服务已存在。
    #[error("service `{0}` is already registered")]
    AlreadyRegistered(String),
}

impl ErrorClass for ServiceRegistryError {
    fn code(&self) -> &'static str {
        match self {
            ServiceRegistryError::MissingObject => "spark.mux.service.missing_object",
            ServiceRegistryError::MissingName => "spark.mux.service.missing_name",
            ServiceRegistryError::AlreadyRegistered(_) => "spark.mux.service.already_registered",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}
